#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, DetectedObject};

const LETTERBOX_FILL: u8 = 114;

/// Tract-based backend for YOLO-format ONNX detectors.
///
/// The model must take a `[1, 3, S, S]` float input and produce a
/// `[1, 4 + classes, anchors]` output of center-format boxes followed by
/// per-class scores. Frames are letterboxed to `S x S` and boxes are mapped
/// back to the original pixel space.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    class_names: Vec<String>,
    confidence_threshold: f32,
    iou_threshold: f64,
}

struct Letterbox {
    scale: f64,
    pad_x: f64,
    pad_y: f64,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_size: u32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        if class_names.is_empty() {
            return Err(anyhow!("tract backend requires class names"));
        }
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            class_names,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the default confidence and NMS thresholds.
    pub fn with_thresholds(mut self, confidence: f64, iou: f64) -> Self {
        self.confidence_threshold = confidence as f32;
        self.iou_threshold = iou;
        self
    }

    fn build_input(&self, image: &DynamicImage) -> Result<(Tensor, Letterbox)> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot run inference on an empty frame"));
        }
        let side = self.input_size;
        let scale = (side as f32 / width as f32).min(side as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, side);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, side);
        let resized = image::imageops::resize(&image.to_rgb8(), new_w, new_h, FilterType::Triangle);

        let pad_x = (side - new_w) / 2;
        let pad_y = (side - new_h) / 2;
        let mut canvas = RgbImage::from_pixel(side, side, Rgb([LETTERBOX_FILL; 3]));
        image::imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

        let side = side as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            canvas.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });

        Ok((
            input.into_tensor(),
            Letterbox {
                scale: f64::from(scale),
                pad_x: f64::from(pad_x),
                pad_y: f64::from(pad_y),
            },
        ))
    }

    fn decode(&self, outputs: TVec<TValue>, letterbox: &Letterbox) -> Result<Vec<DetectedObject>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 || shape[0] != 1 || shape[1] != 4 + self.class_names.len() {
            return Err(anyhow!(
                "unexpected output shape {:?} for {} classes",
                shape,
                self.class_names.len()
            ));
        }

        let anchors = shape[2];
        let mut candidates = Vec::new();
        for i in 0..anchors {
            let (class_idx, score) = (0..self.class_names.len())
                .map(|c| (c, view[[0, 4 + c, i]]))
                .fold((0, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if !score.is_finite() || score < self.confidence_threshold {
                continue;
            }
            let cx = f64::from(view[[0, 0, i]]);
            let cy = f64::from(view[[0, 1, i]]);
            let w = f64::from(view[[0, 2, i]]);
            let h = f64::from(view[[0, 3, i]]);
            let bbox = BoundingBox::new(
                (cx - w / 2.0 - letterbox.pad_x) / letterbox.scale,
                (cy - h / 2.0 - letterbox.pad_y) / letterbox.scale,
                (cx + w / 2.0 - letterbox.pad_x) / letterbox.scale,
                (cy + h / 2.0 - letterbox.pad_y) / letterbox.scale,
            );
            candidates.push((class_idx, f64::from(score.min(1.0)), bbox));
        }

        Ok(non_max_suppression(candidates, self.iou_threshold)
            .into_iter()
            .map(|(class_idx, score, bbox)| DetectedObject {
                label: self.class_names[class_idx].clone(),
                confidence: score,
                bbox,
            })
            .collect())
    }
}

/// Per-class greedy NMS, highest score first.
fn non_max_suppression(
    mut candidates: Vec<(usize, f64, BoundingBox)>,
    iou_threshold: f64,
) -> Vec<(usize, f64, BoundingBox)> {
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut kept: Vec<(usize, f64, BoundingBox)> = Vec::new();
    for cand in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.0 == cand.0 && k.2.iou(&cand.2) > iou_threshold);
        if !suppressed {
            kept.push(cand);
        }
    }
    kept
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<DetectedObject>> {
        let (input, letterbox) = self.build_input(image)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, &letterbox)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = DynamicImage::new_rgb8(self.input_size, self.input_size);
        self.detect(&blank).map(|_| ())
    }
}
