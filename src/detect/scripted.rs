use anyhow::Result;
use image::RgbImage;

use super::backend::DetectorBackend;
use super::TagObservation;

/// Deterministic backend that plays back a fixed script of observation
/// batches, one per frame, cycling when the script runs out. An empty script
/// never detects anything. This is the default backend in pure-Rust builds
/// and the workhorse of the pipeline tests.
pub struct ScriptedBackend {
    script: Vec<Vec<TagObservation>>,
    cursor: usize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            script: Vec::new(),
            cursor: 0,
        }
    }

    pub fn with_script(script: Vec<Vec<TagObservation>>) -> Self {
        Self { script, cursor: 0 }
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<TagObservation>> {
        if self.script.is_empty() {
            return Ok(Vec::new());
        }
        let batch = self.script[self.cursor % self.script.len()].clone();
        self.cursor += 1;
        Ok(batch)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(id: u8) -> TagObservation {
        TagObservation {
            id,
            corners: [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]],
        }
    }

    #[test]
    fn empty_script_never_detects() {
        let mut backend = ScriptedBackend::new();
        let image = RgbImage::new(4, 4);
        assert!(backend.detect(&image).unwrap().is_empty());
        assert!(backend.detect(&image).unwrap().is_empty());
    }

    #[test]
    fn script_plays_back_in_order_and_cycles() {
        let mut backend =
            ScriptedBackend::with_script(vec![vec![observation(1)], vec![], vec![observation(2)]]);
        let image = RgbImage::new(4, 4);
        assert_eq!(backend.detect(&image).unwrap()[0].id, 1);
        assert!(backend.detect(&image).unwrap().is_empty());
        assert_eq!(backend.detect(&image).unwrap()[0].id, 2);
        // Wraps around.
        assert_eq!(backend.detect(&image).unwrap()[0].id, 1);
    }
}
