use anyhow::Result;
use image::RgbImage;

use super::TagObservation;

/// Marker detection backend.
///
/// Implementations read the frame image and return one observation per
/// recognized marker, corners in canonical order. The image is owned by the
/// caller; backends must not retain it past the `detect` call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one frame.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<TagObservation>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn DetectorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DetectorBackend").field(&self.name()).finish()
    }
}
