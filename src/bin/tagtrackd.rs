//! The tagtrack pipeline daemon.
//!
//! Live mode: one capture thread per configured camera feeding a shared
//! frame queue, a fixed pool of detection workers, one dispatcher. Replay
//! mode (`--replay <file>`): recorded detections are paced back through
//! per-camera worker queues and the identical downstream path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use env_logger::Env;

use tagtrack::bus::{MqttBus, TelemetryBus};
use tagtrack::capture::CaptureManager;
use tagtrack::config::{CameraCalibration, TagTrackConfig};
use tagtrack::detect::{DetectionBatch, LiveDetector, ReplayDetector};
use tagtrack::dispatch::Dispatcher;
use tagtrack::environment::{SharedEnvironment, TagEnvironment};
use tagtrack::frame::{CameraFrame, FrameResult};
use tagtrack::log::LogWriter;
use tagtrack::queue::TimedQueue;
use tagtrack::replay::{self, ReplayFeeds};
use tagtrack::solve::{PinholeBackend, PoseEstimator};
use tagtrack::stream::{FrameSink, StreamServer};
use tagtrack::worker::DetectionWorker;

#[derive(Parser, Debug)]
#[command(name = "tagtrackd", about = "Multi-camera fiducial tracking daemon")]
struct Args {
    /// Configuration file.
    #[arg(short = 'c', long, env = "TAGTRACK_CONFIG", default_value = "tagtrack.json")]
    config: PathBuf,

    /// Replay a recorded .ttlog file instead of opening cameras.
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Replay speed factor (1.0 = recorded pace).
    #[arg(long, default_value_t = 1.0)]
    speed: f64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.speed <= 0.0 {
        return Err(anyhow!("--speed must be positive"));
    }

    let config = TagTrackConfig::load(&args.config)?;
    let environment = TagEnvironment::load(&config.environment_path)?;
    log::info!(
        "environment {} carries {} tags",
        config.environment_path.display(),
        environment.len()
    );
    let shared_environment = SharedEnvironment::new(environment);

    let running = Arc::new(AtomicBool::new(true));
    let ctrlc_running = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("shutdown requested");
        ctrlc_running.store(false, Ordering::SeqCst);
    })
    .context("install signal handler")?;

    let mqtt = Arc::new(MqttBus::connect(
        &config.bus.addr,
        &config.bus.client_id,
        shared_environment.clone(),
    )?);
    let bus: Arc<dyn TelemetryBus> = mqtt.clone();
    bus.publish_environment(&shared_environment.snapshot());

    let mut calibrations: HashMap<String, Arc<CameraCalibration>> = HashMap::new();
    for camera in &config.cameras {
        let calibration = Arc::new(
            CameraCalibration::load(&camera.calibration_path)
                .with_context(|| format!("calibration for camera {}", camera.name))?,
        );
        bus.publish_text(
            &camera.name,
            "resolution",
            &format!("[{},{}]", calibration.resolution[0], calibration.resolution[1]),
            true,
        );
        calibrations.insert(camera.name.clone(), calibration);
    }

    let sink = FrameSink::new();
    let stream_handle = StreamServer::new(config.stream_port, sink.clone()).spawn()?;

    let log_writer = if config.logging.enabled && args.replay.is_none() {
        Some(LogWriter::create(&config.logging.output_dir)?)
    } else {
        None
    };

    let results: Arc<TimedQueue<FrameResult>> = Arc::new(TimedQueue::new());
    let estimator = PoseEstimator::new(Arc::new(PinholeBackend));
    let mut handles: Vec<(String, JoinHandle<()>)> = Vec::new();
    let mut replay_feeder: Option<JoinHandle<Result<()>>> = None;
    let mut replay_queues: Vec<Arc<TimedQueue<DetectionBatch>>> = Vec::new();

    match &args.replay {
        None => {
            let frames: Arc<TimedQueue<CameraFrame>> = Arc::new(TimedQueue::new());
            for camera in &config.cameras {
                let manager = CaptureManager::new(
                    camera.clone(),
                    Arc::clone(&calibrations[&camera.name]),
                    Arc::clone(&bus),
                    Arc::clone(&frames),
                    config.frame_debug.clone(),
                    Arc::clone(&running),
                );
                let handle = std::thread::Builder::new()
                    .name(format!("capture-{}", camera.name))
                    .spawn(move || manager.run())
                    .context("spawn capture thread")?;
                handles.push((format!("capture-{}", camera.name), handle));
            }
            for index in 0..config.process_threads {
                let mut backend = config.detector.build(config.tag_family)?;
                backend.warm_up()?;
                let source = LiveDetector::new(Arc::clone(&frames), backend);
                let worker = DetectionWorker::new(
                    source,
                    estimator.clone(),
                    shared_environment.clone(),
                    Arc::clone(&results),
                    Arc::clone(&running),
                );
                let handle = std::thread::Builder::new()
                    .name(format!("worker-{index}"))
                    .spawn(move || worker.run())
                    .context("spawn worker thread")?;
                handles.push((format!("worker-{index}"), handle));
            }
        }
        Some(path) => {
            // One worker per camera keeps replayed frames of a camera in
            // recorded order.
            let mut feeds = ReplayFeeds::new();
            for camera in &config.cameras {
                let batches: Arc<TimedQueue<DetectionBatch>> = Arc::new(TimedQueue::new());
                feeds.insert(
                    camera.name.clone(),
                    (Arc::clone(&calibrations[&camera.name]), Arc::clone(&batches)),
                );
                replay_queues.push(Arc::clone(&batches));
                let worker = DetectionWorker::new(
                    ReplayDetector::new(batches),
                    estimator.clone(),
                    shared_environment.clone(),
                    Arc::clone(&results),
                    Arc::clone(&running),
                );
                let handle = std::thread::Builder::new()
                    .name(format!("replay-worker-{}", camera.name))
                    .spawn(move || worker.run())
                    .context("spawn replay worker thread")?;
                handles.push((format!("replay-worker-{}", camera.name), handle));
            }
            let path = path.clone();
            let speed = args.speed;
            let feeder_running = Arc::clone(&running);
            replay_feeder = Some(
                std::thread::Builder::new()
                    .name("replay-feeder".to_string())
                    .spawn(move || replay::run(&path, speed, &feeds, &feeder_running))
                    .context("spawn replay feeder thread")?,
            );
        }
    }

    let dispatcher = Dispatcher::new(
        Arc::clone(&results),
        Arc::clone(&bus),
        log_writer,
        sink,
        Arc::clone(&running),
    );
    let dispatcher_handle = std::thread::Builder::new()
        .name("dispatcher".to_string())
        .spawn(move || dispatcher.run())
        .context("spawn dispatcher thread")?;
    handles.push(("dispatcher".to_string(), dispatcher_handle));

    // Fail fast: an unexpected worker/dispatcher/capture exit takes the
    // whole process down rather than limping along half-blind.
    let mut failure: Option<String> = None;
    while running.load(Ordering::SeqCst) {
        if let Some(name) = handles
            .iter()
            .find(|(_, handle)| handle.is_finished())
            .map(|(name, _)| name.clone())
        {
            log::error!("thread {} exited unexpectedly, shutting down", name);
            failure = Some(name);
            running.store(false, Ordering::SeqCst);
            break;
        }
        if let Some(feeder) = &replay_feeder {
            // Replay drains to completion, then the daemon exits on its own.
            if feeder.is_finished()
                && replay_queues.iter().all(|queue| queue.is_empty())
                && results.is_empty()
            {
                log::info!("replay complete");
                running.store(false, Ordering::SeqCst);
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    running.store(false, Ordering::SeqCst);

    let mut replay_error: Option<anyhow::Error> = None;
    if let Some(feeder) = replay_feeder {
        match feeder.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => replay_error = Some(e),
            Err(_) => replay_error = Some(anyhow!("replay feeder thread panicked")),
        }
    }
    for (name, handle) in handles {
        if handle.join().is_err() {
            log::error!("thread {} panicked", name);
        }
    }
    stream_handle.stop();
    mqtt.disconnect()?;

    if let Some(e) = replay_error {
        return Err(e.context("replay failed"));
    }
    match failure {
        Some(name) => Err(anyhow!("thread {} died; see log for cause", name)),
        None => Ok(()),
    }
}
