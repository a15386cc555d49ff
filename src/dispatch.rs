//! The dispatcher: single consumer of the result queue.
//!
//! One thread pops processed frames in timestamp order and fans them out to
//! the telemetry bus, the durable log, and the preview stream. Being the
//! only bus/log/stream producer on the result side is what makes per-camera
//! output ordering a non-problem.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::annotate;
use crate::bus::{encode_poses, MatchInfo, TelemetryBus};
use crate::frame::{pipeline_now, FrameResult};
use crate::log::{LogEvent, LogRecord, LogWriter};
use crate::queue::TimedQueue;
use crate::stream::FrameSink;

pub struct Dispatcher {
    results: Arc<TimedQueue<FrameResult>>,
    bus: Arc<dyn TelemetryBus>,
    log: Option<LogWriter>,
    sink: FrameSink,
    running: Arc<AtomicBool>,
    last_match: Option<MatchInfo>,
    last_match_poll: Option<Instant>,
}

impl Dispatcher {
    pub fn new(
        results: Arc<TimedQueue<FrameResult>>,
        bus: Arc<dyn TelemetryBus>,
        log: Option<LogWriter>,
        sink: FrameSink,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            results,
            bus,
            log,
            sink,
            running,
            last_match: None,
            last_match_poll: None,
        }
    }

    pub fn run(mut self) {
        while self.running.load(Ordering::SeqCst) {
            match self.results.pop_timeout(Duration::from_secs(1)) {
                Some(result) => self.handle_result(result),
                None => self.poll_match_info(),
            }
        }
        self.shutdown();
    }

    pub fn handle_result(&mut self, mut result: FrameResult) {
        let latency = (pipeline_now() - result.frame.timestamp).max(0.0);
        let camera = result.frame.camera.clone();

        self.bus
            .publish_poses(&camera, encode_poses(&result, latency));
        self.bus
            .publish_text(&camera, "fps", &format!("{:.1}", result.frame.rate), false);

        if let Some(log) = &self.log {
            if !result.detections.is_empty() {
                log.append(&LogRecord {
                    timestamp: result.frame.timestamp,
                    camera: camera.clone(),
                    event: LogEvent::Detections(result.detections.clone()),
                });
            }
            if let Some(pair) = &result.estimates {
                log.append(&LogRecord::estimates(result.frame.timestamp, &camera, pair));
            }
        }

        self.poll_match_info();

        annotate::dispatch_overlay(&mut result.frame.image, self.results.len(), latency);
        self.sink.submit(&camera, result.frame.image);
    }

    /// At most once a second, read match info from the bus and log it when
    /// it changes. The first observed document always counts as a change.
    fn poll_match_info(&mut self) {
        let due = self
            .last_match_poll
            .map_or(true, |at| at.elapsed() >= Duration::from_secs(1));
        if !due {
            return;
        }
        self.last_match_poll = Some(Instant::now());

        let info = self.bus.match_info();
        if self.last_match.as_ref() == Some(&info) {
            return;
        }
        if let Some(log) = &self.log {
            log.append(&LogRecord {
                timestamp: pipeline_now(),
                camera: String::new(),
                event: LogEvent::Match(info.clone()),
            });
        }
        self.last_match = Some(info);
    }

    /// Flush and close the log. `run` calls this on exit; tests that drive
    /// `handle_result` directly call it themselves.
    pub fn shutdown(&mut self) {
        if let Some(log) = self.log.take() {
            log.stop();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{decode_poses, InMemoryBus};
    use crate::config::CameraCalibration;
    use crate::detect::TagObservation;
    use crate::frame::{CameraFrame, ProcessTimings};
    use crate::geom;
    use crate::log::LogReader;
    use crate::solve::{EstimatePair, PoseEstimate};
    use image::RgbImage;
    use nalgebra::{Isometry3, Matrix3, Translation3};

    fn result(detections: Vec<TagObservation>, estimates: Option<EstimatePair>) -> FrameResult {
        FrameResult {
            frame: CameraFrame {
                timestamp: pipeline_now(),
                camera: "front".to_string(),
                calibration: Arc::new(CameraCalibration {
                    resolution: [64, 48],
                    matrix: Matrix3::identity(),
                    distortion: vec![],
                }),
                image: RgbImage::new(64, 48),
                rate: 42.0,
            },
            detections,
            estimates,
            timings: ProcessTimings::default(),
        }
    }

    fn pair() -> EstimatePair {
        EstimatePair {
            pose_a: PoseEstimate {
                pose: Isometry3::from_parts(
                    Translation3::new(1.0, 2.0, 0.5),
                    geom::quaternion_from_wxyz(1.0, 0.0, 0.0, 0.0),
                ),
                reprojection_error: 0.3,
            },
            pose_b: None,
        }
    }

    fn observation(id: u8) -> TagObservation {
        TagObservation {
            id,
            corners: [[1.0, 1.0], [5.0, 1.0], [5.0, 5.0], [1.0, 5.0]],
        }
    }

    fn dispatcher(bus: Arc<InMemoryBus>, log: Option<LogWriter>) -> Dispatcher {
        Dispatcher::new(
            Arc::new(TimedQueue::new()),
            bus,
            log,
            FrameSink::new(),
            Arc::new(AtomicBool::new(true)),
        )
    }

    #[test]
    fn results_reach_bus_and_sink() {
        let bus = Arc::new(InMemoryBus::new());
        let mut dispatcher = dispatcher(bus.clone(), None);
        dispatcher.handle_result(result(vec![observation(4)], Some(pair())));
        dispatcher.shutdown();

        let payload = bus
            .last_payload("tagtrack/cameras/front/outputs/poses")
            .unwrap();
        let decoded = decode_poses(&payload).unwrap();
        assert!(decoded.estimate_a.is_some());
        assert_eq!(decoded.detections.len(), 1);
        assert!(decoded.latency_seconds >= 0.0);
        assert_eq!(
            bus.last_payload("tagtrack/cameras/front/outputs/fps").unwrap(),
            b"42.0"
        );
        assert!(dispatcher.sink.mosaic().is_some());
    }

    #[test]
    fn detections_and_estimates_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let writer = LogWriter::create(dir.path()).unwrap();
        let path = writer.path().to_path_buf();
        let mut dispatcher = dispatcher(bus, Some(writer));

        dispatcher.handle_result(result(vec![observation(4)], Some(pair())));
        // No detections, no estimate: nothing to log.
        dispatcher.handle_result(result(vec![], None));
        dispatcher.shutdown();

        let mut reader = LogReader::open(&path).unwrap();
        let mut events = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            events.push(record.event);
        }
        // One match record (first poll) plus the detection and estimate pair.
        assert!(events
            .iter()
            .any(|e| matches!(e, LogEvent::Detections(d) if d.len() == 1)));
        assert!(events
            .iter()
            .any(|e| matches!(e, LogEvent::Estimates(est) if est.len() == 1)));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, LogEvent::Detections(_)))
                .count(),
            1
        );
    }

    #[test]
    fn match_info_is_logged_once_per_change() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let writer = LogWriter::create(dir.path()).unwrap();
        let path = writer.path().to_path_buf();
        let mut dispatcher = dispatcher(bus.clone(), Some(writer));

        dispatcher.poll_match_info();
        // Same document again within the poll window: no second record.
        dispatcher.poll_match_info();
        dispatcher.shutdown();

        let mut reader = LogReader::open(&path).unwrap();
        let mut matches = 0;
        while let Some(record) = reader.next_record().unwrap() {
            if let LogEvent::Match(info) = record.event {
                assert_eq!(info.event_name, "UNKNOWN");
                assert!(record.camera.is_empty());
                matches += 1;
            }
        }
        assert_eq!(matches, 1);
    }
}
