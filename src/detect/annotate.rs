//! Annotated frame rendering.
//!
//! Boxes are drawn in memory and the result is encoded as JPEG. Nothing here
//! touches the filesystem; the orchestrator decides when an annotated frame
//! becomes a file.

use std::io::Cursor;

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::classify::LabelRules;
use crate::detect::result::DetectedObject;

const VIOLATION_COLOR: Rgb<u8> = Rgb([220, 30, 30]);
const SAFE_COLOR: Rgb<u8> = Rgb([30, 180, 60]);
const OTHER_COLOR: Rgb<u8> = Rgb([40, 110, 230]);
const STROKE_PX: i32 = 3;

/// Draw every detection onto a copy of `image` and return the JPEG bytes.
pub fn render(
    image: &DynamicImage,
    detections: &[DetectedObject],
    rules: &LabelRules,
) -> Result<Vec<u8>> {
    let mut canvas = image.to_rgb8();
    for det in detections {
        let color = if rules.is_violation(&det.label) {
            VIOLATION_COLOR
        } else if rules.is_safe(&det.label) {
            SAFE_COLOR
        } else {
            OTHER_COLOR
        };
        draw_box(&mut canvas, det, color);
    }
    encode_jpeg(&DynamicImage::ImageRgb8(canvas))
}

/// Encode a frame as JPEG. Alpha is dropped.
pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>> {
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut out = Cursor::new(Vec::new());
    rgb.write_to(&mut out, ImageFormat::Jpeg)
        .context("encode jpeg")?;
    Ok(out.into_inner())
}

fn draw_box(canvas: &mut RgbImage, det: &DetectedObject, color: Rgb<u8>) {
    let (width, height) = canvas.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let max_x = (width - 1) as f64;
    let max_y = (height - 1) as f64;
    let x1 = det.bbox.x1.clamp(0.0, max_x) as i32;
    let y1 = det.bbox.y1.clamp(0.0, max_y) as i32;
    let x2 = det.bbox.x2.clamp(0.0, max_x) as i32;
    let y2 = det.bbox.y2.clamp(0.0, max_y) as i32;

    for inset in 0..STROKE_PX {
        let (left, top) = (x1 + inset, y1 + inset);
        let (right, bottom) = (x2 - inset, y2 - inset);
        if right <= left || bottom <= top {
            break;
        }
        let rect = Rect::at(left, top).of_size((right - left + 1) as u32, (bottom - top + 1) as u32);
        draw_hollow_rect_mut(canvas, rect, color);
    }
}
