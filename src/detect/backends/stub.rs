use anyhow::{anyhow, Result};
use image::DynamicImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::DetectedObject;

/// Stub backend for testing. Replays a fixed set of detections for every frame,
/// or fails every call when built with [`StubBackend::failing`].
pub struct StubBackend {
    fixture: Vec<DetectedObject>,
    failure: Option<String>,
    calls: usize,
}

impl StubBackend {
    pub fn new(fixture: Vec<DetectedObject>) -> Self {
        Self {
            fixture,
            failure: None,
            calls: 0,
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fixture: Vec::new(),
            failure: Some(message.into()),
            calls: 0,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _image: &DynamicImage) -> Result<Vec<DetectedObject>> {
        self.calls += 1;
        if let Some(message) = &self.failure {
            return Err(anyhow!("{}", message));
        }
        Ok(self.fixture.clone())
    }
}
