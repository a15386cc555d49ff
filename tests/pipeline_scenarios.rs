//! Scenario tests across the worker/dispatcher path with in-memory fakes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use nalgebra::{Isometry3, Matrix3, Translation3};

use tagtrack::bus::{decode_poses, InMemoryBus};
use tagtrack::capture::{CameraRuntimeParams, CaptureManager};
use tagtrack::config::{CameraCalibration, CameraSettings, FrameDebugSettings};
use tagtrack::detect::{LiveDetector, ScriptedBackend, TagObservation};
use tagtrack::dispatch::Dispatcher;
use tagtrack::environment::{SharedEnvironment, TagEnvironment};
use tagtrack::frame::{pipeline_now, CameraFrame, FrameResult};
use tagtrack::geom;
use tagtrack::queue::TimedQueue;
use tagtrack::solve::{PinholeBackend, PoseEstimator};
use tagtrack::stream::FrameSink;
use tagtrack::worker::DetectionWorker;

fn calibration() -> Arc<CameraCalibration> {
    Arc::new(CameraCalibration {
        resolution: [640, 480],
        matrix: Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0),
        distortion: vec![0.0; 5],
    })
}

fn environment(ids: &[u8]) -> SharedEnvironment {
    let mut env = TagEnvironment::new(0.152);
    for (i, id) in ids.iter().enumerate() {
        env.insert(
            *id,
            Isometry3::from_parts(
                Translation3::new(4.0, i as f64 * 0.5, 1.0),
                geom::quaternion_from_wxyz(1.0, 0.0, 0.0, 0.0),
            ),
        );
    }
    SharedEnvironment::new(env)
}

fn square(id: u8, cx: f64, cy: f64, half: f64) -> TagObservation {
    TagObservation {
        id,
        corners: [
            [cx - half, cy - half],
            [cx + half, cy - half],
            [cx + half, cy + half],
            [cx - half, cy + half],
        ],
    }
}

/// Run one scripted frame through a worker and the dispatcher; return the
/// decoded poses payload.
fn run_scenario(
    script: Vec<Vec<TagObservation>>,
    environment: SharedEnvironment,
    bus: Arc<InMemoryBus>,
) -> tagtrack::bus::DecodedPoses {
    let frames = Arc::new(TimedQueue::new());
    frames.push(CameraFrame {
        timestamp: pipeline_now(),
        camera: "front".to_string(),
        calibration: calibration(),
        image: RgbImage::new(640, 480),
        rate: 30.0,
    });

    let results = Arc::new(TimedQueue::new());
    let running = Arc::new(AtomicBool::new(true));
    let worker = DetectionWorker::new(
        LiveDetector::new(frames, Box::new(ScriptedBackend::with_script(script))),
        PoseEstimator::new(Arc::new(PinholeBackend)),
        environment,
        results.clone(),
        running.clone(),
    );
    let worker_handle = std::thread::spawn(move || worker.run());

    let result: FrameResult = loop {
        if let Some(result) = results.pop_timeout(Duration::from_millis(50)) {
            break result;
        }
    };
    running.store(false, Ordering::SeqCst);
    worker_handle.join().unwrap();

    let mut dispatcher = Dispatcher::new(
        Arc::new(TimedQueue::new()),
        bus.clone(),
        None,
        FrameSink::new(),
        Arc::new(AtomicBool::new(true)),
    );
    dispatcher.handle_result(result);
    dispatcher.shutdown();

    let payload = bus
        .last_payload("tagtrack/cameras/front/outputs/poses")
        .expect("poses payload published");
    decode_poses(&payload).expect("payload decodes")
}

#[test]
fn empty_frame_publishes_no_estimate() {
    let bus = Arc::new(InMemoryBus::new());
    let decoded = run_scenario(vec![vec![]], environment(&[1]), bus);
    assert!(decoded.estimate_a.is_none());
    assert!(decoded.estimate_b.is_none());
    assert!(decoded.detections.is_empty());
    assert!(decoded.latency_seconds >= 0.0);
}

#[test]
fn single_tag_publishes_ordered_ambiguous_pair() {
    let bus = Arc::new(InMemoryBus::new());
    let mut detection = square(1, 320.0, 240.0, 22.0);
    // Trapezoid asymmetry so the mirror candidates differ.
    detection.corners[0][0] += 4.0;
    detection.corners[1][0] -= 4.0;
    let decoded = run_scenario(vec![vec![detection]], environment(&[1]), bus);

    let a = decoded.estimate_a.expect("primary estimate");
    let b = decoded.estimate_b.expect("single tag is ambiguous");
    assert!(a.error <= b.error);
    assert_eq!(decoded.detections.len(), 1);
    let (id, corners) = &decoded.detections[0];
    assert_eq!(*id, 1);
    // Corners arrive rounded to integer pixels.
    assert_eq!(corners[0], [302, 218]);
}

#[test]
fn two_tags_publish_a_single_estimate() {
    let bus = Arc::new(InMemoryBus::new());
    let decoded = run_scenario(
        vec![vec![
            square(1, 250.0, 240.0, 20.0),
            square(2, 390.0, 240.0, 20.0),
        ]],
        environment(&[1, 2]),
        bus,
    );
    assert!(decoded.estimate_a.is_some());
    assert!(decoded.estimate_b.is_none());
    assert_eq!(decoded.detections.len(), 2);
}

#[test]
fn unknown_tags_still_appear_as_detections() {
    let bus = Arc::new(InMemoryBus::new());
    let decoded = run_scenario(
        vec![vec![square(99, 320.0, 240.0, 20.0)]],
        environment(&[1]),
        bus,
    );
    assert!(decoded.estimate_a.is_none());
    assert_eq!(decoded.detections.len(), 1);
    assert_eq!(decoded.detections[0].0, 99);
}

#[test]
fn live_pipeline_end_to_end_with_synthetic_camera() {
    let bus = Arc::new(InMemoryBus::new());
    bus.set_camera_params(
        "front",
        CameraRuntimeParams {
            target_fps: 120.0,
            ..CameraRuntimeParams::default()
        },
    );

    let frames = Arc::new(TimedQueue::new());
    let results = Arc::new(TimedQueue::new());
    let running = Arc::new(AtomicBool::new(true));
    let sink = FrameSink::new();

    let manager = CaptureManager::new(
        CameraSettings {
            name: "front".to_string(),
            id: "stub://pipeline".to_string(),
            calibration_path: PathBuf::from("unused.json"),
        },
        calibration(),
        bus.clone(),
        frames.clone(),
        FrameDebugSettings {
            enabled: false,
            output_dir: PathBuf::from("unused"),
        },
        running.clone(),
    );
    let capture_handle = std::thread::spawn(move || manager.run());

    let worker = DetectionWorker::new(
        LiveDetector::new(
            frames,
            Box::new(ScriptedBackend::with_script(vec![vec![square(
                1, 320.0, 240.0, 20.0,
            )]])),
        ),
        PoseEstimator::new(Arc::new(PinholeBackend)),
        environment(&[1]),
        results.clone(),
        running.clone(),
    );
    let worker_handle = std::thread::spawn(move || worker.run());

    let dispatcher = Dispatcher::new(
        results,
        bus.clone(),
        None,
        sink.clone(),
        running.clone(),
    );
    let dispatcher_handle = std::thread::spawn(move || dispatcher.run());

    // Wait for at least one pose to make it all the way through.
    let deadline = Instant::now() + Duration::from_secs(3);
    let payload = loop {
        if let Some(payload) = bus.last_payload("tagtrack/cameras/front/outputs/poses") {
            break payload;
        }
        assert!(Instant::now() < deadline, "no poses published in time");
        std::thread::sleep(Duration::from_millis(20));
    };

    running.store(false, Ordering::SeqCst);
    capture_handle.join().unwrap();
    worker_handle.join().unwrap();
    dispatcher_handle.join().unwrap();

    let decoded = decode_poses(&payload).unwrap();
    assert!(decoded.estimate_a.is_some());
    assert!(sink.mosaic().is_some());
    assert_eq!(
        bus.last_payload("tagtrack/cameras/front/outputs/alive")
            .unwrap(),
        b"false"
    );
}
