//! Detection worker: pull a batch, solve, annotate, push the result.
//!
//! Workers are generic over `DetectionSource`, so the same loop serves live
//! capture and log replay. Each worker owns its detector backend (inside the
//! source) and a clone of the estimator; the environment is snapshotted per
//! frame so a bus refresh lands between frames, never inside one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::annotate;
use crate::detect::{DetectionBatch, DetectionSource};
use crate::environment::SharedEnvironment;
use crate::frame::{FrameResult, ProcessTimings};
use crate::queue::TimedQueue;
use crate::solve::PoseEstimator;

pub struct DetectionWorker<S: DetectionSource> {
    source: S,
    estimator: PoseEstimator,
    environment: SharedEnvironment,
    results: Arc<TimedQueue<FrameResult>>,
    running: Arc<AtomicBool>,
}

impl<S: DetectionSource> DetectionWorker<S> {
    pub fn new(
        source: S,
        estimator: PoseEstimator,
        environment: SharedEnvironment,
        results: Arc<TimedQueue<FrameResult>>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            estimator,
            environment,
            results,
            running,
        }
    }

    pub fn run(mut self) {
        while self.running.load(Ordering::SeqCst) {
            match self.source.next_batch(Duration::from_secs(1)) {
                Ok(Some(batch)) => self.process(batch),
                Ok(None) => {}
                Err(e) => log::warn!("detection failed: {}", e),
            }
        }
    }

    fn process(&mut self, batch: DetectionBatch) {
        let DetectionBatch {
            mut frame,
            detections,
            detect_seconds,
        } = batch;

        let environment = self.environment.snapshot();
        let solve_started = Instant::now();
        let estimates = self
            .estimator
            .solve(&frame.calibration, &detections, &environment);
        let timings = ProcessTimings {
            detect_seconds,
            solve_seconds: solve_started.elapsed().as_secs_f64(),
        };

        annotate::worker_overlay(
            &mut frame.image,
            &frame.camera,
            frame.rate,
            &timings,
            &detections,
            estimates.as_ref(),
        );

        self.results.push(FrameResult {
            frame,
            detections,
            estimates,
            timings,
        });
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraCalibration;
    use crate::detect::{LiveDetector, ScriptedBackend, TagObservation};
    use crate::environment::TagEnvironment;
    use crate::frame::CameraFrame;
    use crate::geom;
    use crate::solve::PinholeBackend;
    use image::RgbImage;
    use nalgebra::{Isometry3, Matrix3, Translation3};

    fn calibration() -> Arc<CameraCalibration> {
        Arc::new(CameraCalibration {
            resolution: [640, 480],
            matrix: Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0),
            distortion: vec![0.0; 5],
        })
    }

    fn environment_with_tag(id: u8) -> SharedEnvironment {
        let mut env = TagEnvironment::new(0.152);
        env.insert(
            id,
            Isometry3::from_parts(
                Translation3::new(4.0, 0.0, 1.0),
                geom::quaternion_from_wxyz(1.0, 0.0, 0.0, 0.0),
            ),
        );
        SharedEnvironment::new(env)
    }

    fn observation(id: u8) -> TagObservation {
        TagObservation {
            id,
            corners: [
                [300.0, 220.0],
                [340.0, 220.0],
                [340.0, 260.0],
                [300.0, 260.0],
            ],
        }
    }

    #[test]
    fn worker_solves_and_queues_results() {
        let frames = Arc::new(TimedQueue::new());
        frames.push(CameraFrame {
            timestamp: 1.0,
            camera: "front".to_string(),
            calibration: calibration(),
            image: RgbImage::new(640, 480),
            rate: 30.0,
        });

        let backend = Box::new(ScriptedBackend::with_script(vec![vec![observation(5)]]));
        let results = Arc::new(TimedQueue::new());
        let running = Arc::new(AtomicBool::new(true));
        let worker = DetectionWorker::new(
            LiveDetector::new(frames, backend),
            PoseEstimator::new(Arc::new(PinholeBackend)),
            environment_with_tag(5),
            results.clone(),
            running.clone(),
        );

        let handle = std::thread::spawn(move || worker.run());
        let result = loop {
            if let Some(result) = results.pop_timeout(Duration::from_millis(50)) {
                break result;
            }
        };
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();

        assert_eq!(result.detections.len(), 1);
        let pair = result.estimates.expect("known tag should solve");
        assert!(pair.pose_b.is_some());
        assert!(result.timings.solve_seconds >= 0.0);
        // The overlay touched the frame.
        assert!(result.frame.image.pixels().any(|p| p.0 != [0, 0, 0]));
    }
}
