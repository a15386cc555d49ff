//! The "get next detection batch" seam.
//!
//! `DetectionSource` is what a worker blocks on. Live pipelines use
//! `LiveDetector` (frame queue + detector backend); replay pipelines use
//! `ReplayDetector` (a queue fed by the log replay pacer). Everything
//! downstream of the worker is identical for both.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::frame::CameraFrame;
use crate::queue::TimedQueue;

use super::backend::DetectorBackend;
use super::TagObservation;

/// One frame plus its detections, ordered by capture timestamp only.
pub struct DetectionBatch {
    pub frame: CameraFrame,
    pub detections: Vec<TagObservation>,
    /// Detection stage duration, seconds. Zero for replayed batches.
    pub detect_seconds: f64,
}

impl PartialEq for DetectionBatch {
    fn eq(&self, other: &Self) -> bool {
        self.frame == other.frame
    }
}

impl Eq for DetectionBatch {}

impl PartialOrd for DetectionBatch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DetectionBatch {
    fn cmp(&self, other: &Self) -> Ordering {
        self.frame.cmp(&other.frame)
    }
}

/// Blocking supplier of detection batches. `Ok(None)` means the wait timed
/// out with nothing available; callers poll their shutdown flag and retry.
pub trait DetectionSource: Send {
    fn next_batch(&mut self, timeout: Duration) -> Result<Option<DetectionBatch>>;
}

/// Live source: pops captured frames and runs a detector backend over them.
pub struct LiveDetector {
    frames: Arc<TimedQueue<CameraFrame>>,
    backend: Box<dyn DetectorBackend>,
}

impl LiveDetector {
    pub fn new(frames: Arc<TimedQueue<CameraFrame>>, backend: Box<dyn DetectorBackend>) -> Self {
        Self { frames, backend }
    }
}

impl DetectionSource for LiveDetector {
    fn next_batch(&mut self, timeout: Duration) -> Result<Option<DetectionBatch>> {
        let Some(frame) = self.frames.pop_timeout(timeout) else {
            return Ok(None);
        };
        let started = Instant::now();
        let detections = self.backend.detect(&frame.image)?;
        Ok(Some(DetectionBatch {
            frame,
            detections,
            detect_seconds: started.elapsed().as_secs_f64(),
        }))
    }
}

/// Replay source: batches arrive pre-detected from the log replay pacer.
pub struct ReplayDetector {
    batches: Arc<TimedQueue<DetectionBatch>>,
}

impl ReplayDetector {
    pub fn new(batches: Arc<TimedQueue<DetectionBatch>>) -> Self {
        Self { batches }
    }
}

impl DetectionSource for ReplayDetector {
    fn next_batch(&mut self, timeout: Duration) -> Result<Option<DetectionBatch>> {
        Ok(self.batches.pop_timeout(timeout))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
