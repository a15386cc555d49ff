//! AprilTag detection via the `apriltag` crate bindings.

use anyhow::{anyhow, Context, Result};
use apriltag::{DetectorBuilder, Family, Image};
use image::RgbImage;

use super::backend::DetectorBackend;
use super::{TagFamily, TagObservation};

pub struct ApriltagBackend {
    detector: apriltag::Detector,
}

impl ApriltagBackend {
    pub fn new(family: TagFamily) -> Result<Self> {
        let family = match family {
            TagFamily::Tag16h5 => Family::tag_16h5(),
            TagFamily::Tag36h11 => Family::tag_36h11(),
        };
        let detector = DetectorBuilder::new()
            .add_family_bits(family, 1)
            .build()
            .map_err(|e| anyhow!("failed to build apriltag detector: {}", e))?;
        Ok(Self { detector })
    }
}

impl DetectorBackend for ApriltagBackend {
    fn name(&self) -> &'static str {
        "apriltag"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<TagObservation>> {
        let width = image.width() as usize;
        let height = image.height() as usize;
        let mut gray = Image::zeros_with_stride(width, height, width)
            .context("allocate apriltag image buffer")?;
        for (x, y, pixel) in image.enumerate_pixels() {
            let [r, g, b] = pixel.0;
            let luma = (u16::from(r) * 30 + u16::from(g) * 59 + u16::from(b) * 11) / 100;
            gray[(x as usize, y as usize)] = luma as u8;
        }

        let mut observations = Vec::new();
        for detection in self.detector.detect(&gray) {
            let id = match u8::try_from(detection.id()) {
                Ok(id) => id,
                Err(_) => {
                    log::debug!("skipping tag id {} beyond wire range", detection.id());
                    continue;
                }
            };
            observations.push(TagObservation {
                id,
                corners: reorder_corners(detection.corners()),
            });
        }
        Ok(observations)
    }
}

/// The library reports corners counter-clockwise starting at the marker's
/// bottom-left; the pipeline's canonical order starts at the top-left and
/// runs clockwise.
fn reorder_corners(raw: [[f64; 2]; 4]) -> [[f64; 2]; 4] {
    [raw[3], raw[2], raw[1], raw[0]]
}
