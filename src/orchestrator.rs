use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use image::DynamicImage;

use crate::classify::{classify, ComplianceStatus, LabelRules};
use crate::detect::{annotate, BackendRegistry, DetectedObject};
use crate::error::PipelineError;
use crate::storage::ViolationStore;

/// Result of processing one uploaded image.
#[derive(Clone, Debug)]
pub struct DetectionOutcome {
    pub event_id: i64,
    pub overall_status: ComplianceStatus,
    pub detections: Vec<DetectedObject>,
    /// Where the annotated frame was written, if that succeeded.
    pub annotated_path: Option<PathBuf>,
    pub annotated_jpeg: Vec<u8>,
}

/// Composes detection, classification and persistence for one image.
///
/// Inference happens before anything touches the store, so a model failure
/// leaves no trace. The annotated file is written only after the event has
/// committed.
#[derive(Clone)]
pub struct DetectionOrchestrator {
    detectors: BackendRegistry,
    rules: LabelRules,
    store: Arc<dyn ViolationStore>,
    output_dir: PathBuf,
}

impl DetectionOrchestrator {
    pub fn new(
        detectors: BackendRegistry,
        rules: LabelRules,
        store: Arc<dyn ViolationStore>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            detectors,
            rules,
            store,
            output_dir: output_dir.into(),
        }
    }

    pub fn rules(&self) -> &LabelRules {
        &self.rules
    }

    pub fn store(&self) -> &Arc<dyn ViolationStore> {
        &self.store
    }

    /// Decode an uploaded file and process it.
    pub fn process(&self, bytes: &[u8], filename: &str) -> Result<DetectionOutcome, PipelineError> {
        let image = image::load_from_memory(bytes)
            .context("decode uploaded image")
            .map_err(PipelineError::ModelInference)?;
        self.process_image(&image, filename)
    }

    pub fn process_image(
        &self,
        image: &DynamicImage,
        filename: &str,
    ) -> Result<DetectionOutcome, PipelineError> {
        let mut detections = self
            .detectors
            .detect(image)
            .map_err(PipelineError::ModelInference)?;
        // Store labels exactly as they are classified.
        for det in &mut detections {
            let trimmed = det.label.trim();
            if trimmed.len() != det.label.len() {
                det.label = trimmed.to_string();
            }
        }
        let overall_status = classify(&self.rules, detections.iter().map(|d| d.label.as_str()));
        let annotated_jpeg = annotate::render(image, &detections, &self.rules)
            .map_err(PipelineError::ModelInference)?;

        let image_name = image_name(filename);
        let event_id = self
            .store
            .write_detection_event(&image_name, overall_status, &detections)
            .map_err(PipelineError::Persistence)?;
        log::info!(
            "event {} committed: {} ({} detections) for {}",
            event_id,
            overall_status,
            detections.len(),
            image_name
        );

        let annotated_path = match self.write_annotated(event_id, &annotated_jpeg) {
            Ok(path) => Some(path),
            Err(err) => {
                log::warn!("event {}: annotated frame not written: {:#}", event_id, err);
                None
            }
        };

        Ok(DetectionOutcome {
            event_id,
            overall_status,
            detections,
            annotated_path,
            annotated_jpeg,
        })
    }

    fn write_annotated(&self, event_id: i64, jpeg: &[u8]) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("create output dir {}", self.output_dir.display()))?;
        let path = self.output_dir.join(format!("event_{}.jpg", event_id));
        std::fs::write(&path, jpeg).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}

/// Final path component of an uploaded filename; `upload` when there is none.
///
/// Commas and control characters become `_` so the name stays a single CSV
/// cell in the violations report.
fn image_name(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if name.is_empty() || name == "." || name == ".." {
        return "upload".to_string();
    }
    name.chars()
        .map(|c| if c == ',' || c.is_control() { '_' } else { c })
        .collect()
}

/// Require an existing directory for annotated output.
pub fn ensure_output_dir(path: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("create output dir {}", path.display()))?;
    if !path.is_dir() {
        return Err(anyhow!("output path {} is not a directory", path.display()));
    }
    Ok(())
}
