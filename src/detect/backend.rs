use anyhow::Result;
use image::DynamicImage;

use crate::detect::result::DetectedObject;

/// Detector backend trait.
///
/// Wraps an opaque object-detection model. Implementations receive a decoded
/// frame of arbitrary dimensions and report every object they find with its
/// label, score and pixel-space box. A model failure is returned as an error,
/// never replaced by an empty result.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<DetectedObject>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
