//! Core pipeline data types.
//!
//! - `CameraFrame`: one captured image plus capture metadata.
//! - `FrameResult`: a fully processed frame ready for dispatch.
//! - `pipeline_now()`: seconds on the process-wide monotonic clock; every
//!   timestamp in the pipeline lives in this domain.
//!
//! Both queue item types order by capture timestamp ONLY. The priority
//! queues rely on that to restore chronological order regardless of which
//! worker finishes first; no other field may influence comparison.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;
use std::sync::OnceLock;

use crate::config::CameraCalibration;
use crate::detect::TagObservation;
use crate::solve::EstimatePair;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Seconds elapsed on the pipeline monotonic clock.
///
/// The epoch is fixed the first time any thread asks for the time. Capture
/// sources anchor device-clock timestamps to this domain so that queueing
/// delay cannot reorder frames.
pub fn pipeline_now() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

// ----------------------------------------------------------------------------
// CameraFrame
// ----------------------------------------------------------------------------

/// One captured image, owned exclusively by whichever stage holds it.
#[derive(Debug)]
pub struct CameraFrame {
    /// Capture time in pipeline-clock seconds (device clock domain).
    pub timestamp: f64,
    /// Configured camera name.
    pub camera: String,
    /// Intrinsics for the camera that produced this frame.
    pub calibration: Arc<CameraCalibration>,
    /// RGB pixels at the calibration resolution.
    pub image: RgbImage,
    /// Rolling one-second frame rate measured by the capture manager.
    pub rate: f64,
}

impl PartialEq for CameraFrame {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp.total_cmp(&other.timestamp) == Ordering::Equal
    }
}

impl Eq for CameraFrame {}

impl PartialOrd for CameraFrame {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CameraFrame {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp.total_cmp(&other.timestamp)
    }
}

// ----------------------------------------------------------------------------
// FrameResult
// ----------------------------------------------------------------------------

/// Per-frame processing durations, in seconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessTimings {
    pub detect_seconds: f64,
    pub solve_seconds: f64,
}

/// A processed frame: detections, pose estimates, and the annotated image.
pub struct FrameResult {
    pub frame: CameraFrame,
    pub detections: Vec<TagObservation>,
    pub estimates: Option<EstimatePair>,
    pub timings: ProcessTimings,
}

impl PartialEq for FrameResult {
    fn eq(&self, other: &Self) -> bool {
        self.frame == other.frame
    }
}

impl Eq for FrameResult {}

impl PartialOrd for FrameResult {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrameResult {
    fn cmp(&self, other: &Self) -> Ordering {
        self.frame.cmp(&other.frame)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
