//! Marker detection: observation types, detector backends, and the
//! detection-source seam shared by live capture and log replay.

use std::str::FromStr;

use anyhow::{anyhow, Result};

mod backend;
mod scripted;
mod source;

#[cfg(feature = "detector-apriltag")]
mod apriltag;

pub use backend::DetectorBackend;
pub use scripted::ScriptedBackend;
pub use source::{DetectionBatch, DetectionSource, LiveDetector, ReplayDetector};

#[cfg(feature = "detector-apriltag")]
pub use apriltag::ApriltagBackend;

/// One recognized marker: its id and the four detected pixel corners in
/// canonical order (top-left, top-right, bottom-right, bottom-left of the
/// upright marker).
#[derive(Clone, Debug, PartialEq)]
pub struct TagObservation {
    pub id: u8,
    pub corners: [[f64; 2]; 4],
}

/// Marker family printed on the field tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagFamily {
    Tag16h5,
    Tag36h11,
}

impl FromStr for TagFamily {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "16h5" => Ok(Self::Tag16h5),
            "36h11" => Ok(Self::Tag36h11),
            other => Err(anyhow!("unknown tag family: {}", other)),
        }
    }
}

/// Detector backend selected in the configuration file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorKind {
    Scripted,
    Apriltag,
}

impl FromStr for DetectorKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "scripted" => Ok(Self::Scripted),
            "apriltag" => Ok(Self::Apriltag),
            other => Err(anyhow!("unknown detector: {}", other)),
        }
    }
}

impl DetectorKind {
    /// Build one backend instance. Workers do not share backends; each gets
    /// its own.
    pub fn build(self, family: TagFamily) -> Result<Box<dyn DetectorBackend>> {
        match self {
            Self::Scripted => Ok(Box::new(ScriptedBackend::new())),
            #[cfg(feature = "detector-apriltag")]
            Self::Apriltag => Ok(Box::new(ApriltagBackend::new(family)?)),
            #[cfg(not(feature = "detector-apriltag"))]
            Self::Apriltag => {
                let _ = family;
                Err(anyhow!(
                    "detector \"apriltag\" requires building with the detector-apriltag feature"
                ))
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tag_families_and_detectors() {
        assert_eq!("16h5".parse::<TagFamily>().unwrap(), TagFamily::Tag16h5);
        assert_eq!("36h11".parse::<TagFamily>().unwrap(), TagFamily::Tag36h11);
        assert!("25h9".parse::<TagFamily>().is_err());
        assert_eq!(
            "scripted".parse::<DetectorKind>().unwrap(),
            DetectorKind::Scripted
        );
        assert!("opencv".parse::<DetectorKind>().is_err());
    }

    #[test]
    fn scripted_backend_always_builds() {
        let backend = DetectorKind::Scripted.build(TagFamily::Tag36h11).unwrap();
        assert_eq!(backend.name(), "scripted");
    }

    #[cfg(not(feature = "detector-apriltag"))]
    #[test]
    fn apriltag_build_names_the_missing_feature() {
        let err = DetectorKind::Apriltag
            .build(TagFamily::Tag36h11)
            .unwrap_err();
        assert!(format!("{err}").contains("detector-apriltag"));
    }
}
