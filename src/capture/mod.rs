//! Camera capture: one manager thread per configured camera.
//!
//! A capture manager never holds the process hostage. Every failure mode
//! (device missing, no retained config on the bus, read errors) degrades to
//! "camera reported dead, retry in a second" while the rest of the pipeline
//! keeps running. Per-camera exposure/gain/fps live on the telemetry bus and
//! are polled every frame; a change closes and reopens the device.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use image::RgbImage;
use serde::Deserialize;

use crate::annotate;
use crate::bus::TelemetryBus;
use crate::config::{CameraCalibration, CameraSettings, FrameDebugSettings};
use crate::frame::CameraFrame;
use crate::queue::TimedQueue;

mod synthetic;
#[cfg(feature = "camera-v4l2")]
mod v4l2;

pub use synthetic::SyntheticCamera;

/// Live per-camera settings polled from the bus. Absence of a retained
/// document means the camera stays closed.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraRuntimeParams {
    pub auto_exposure: bool,
    pub exposure: f64,
    pub gain: f64,
    pub target_fps: f64,
}

impl Default for CameraRuntimeParams {
    fn default() -> Self {
        Self {
            auto_exposure: false,
            exposure: 42.0,
            gain: 1.0,
            target_fps: 50.0,
        }
    }
}

// ----------------------------------------------------------------------------
// Camera sources
// ----------------------------------------------------------------------------

/// A camera device. `stub://<seed>` ids select the synthetic source; any
/// other id is a V4L2 device path.
pub enum CameraSource {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "camera-v4l2")]
    Device(v4l2::V4l2Camera),
}

impl std::fmt::Debug for CameraSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Synthetic(camera) => f.debug_tuple("Synthetic").field(camera).finish(),
            #[cfg(feature = "camera-v4l2")]
            Self::Device(_) => f.debug_tuple("Device").finish_non_exhaustive(),
        }
    }
}

impl CameraSource {
    pub fn open(
        id: &str,
        calibration: &CameraCalibration,
        params: &CameraRuntimeParams,
    ) -> Result<Self> {
        if let Some(seed) = id.strip_prefix("stub://") {
            return Ok(Self::Synthetic(SyntheticCamera::new(
                seed,
                calibration.resolution[0],
                calibration.resolution[1],
                params.target_fps,
            )));
        }
        #[cfg(feature = "camera-v4l2")]
        {
            Ok(Self::Device(v4l2::V4l2Camera::open(id, calibration, params)?))
        }
        #[cfg(not(feature = "camera-v4l2"))]
        {
            Err(anyhow::anyhow!(
                "camera id {} needs the camera-v4l2 feature; only stub:// ids work in this build",
                id
            ))
        }
    }

    /// Next frame plus its pipeline-clock capture timestamp. Blocks until a
    /// frame is available.
    pub fn read(&mut self) -> Result<(RgbImage, f64)> {
        match self {
            Self::Synthetic(camera) => Ok(camera.read()),
            #[cfg(feature = "camera-v4l2")]
            Self::Device(camera) => camera.read(),
        }
    }
}

// ----------------------------------------------------------------------------
// Failure gating and liveness
// ----------------------------------------------------------------------------

/// Collapses a run of repeated failures into a single warning. `trip`
/// returns true only on the first failure of a run.
#[derive(Default)]
pub struct FailureGate {
    tripped: bool,
}

impl FailureGate {
    pub fn trip(&mut self) -> bool {
        let first = !self.tripped;
        self.tripped = true;
        first
    }

    pub fn reset(&mut self) {
        self.tripped = false;
    }
}

/// Publishes the retained per-camera `alive` output: immediately on change,
/// and at a one-second heartbeat otherwise.
struct AliveReporter {
    last_value: Option<bool>,
    last_publish: Option<Instant>,
}

impl AliveReporter {
    fn new() -> Self {
        Self {
            last_value: None,
            last_publish: None,
        }
    }

    fn report(&mut self, bus: &dyn TelemetryBus, camera: &str, alive: bool) {
        let changed = self.last_value != Some(alive);
        let due = self
            .last_publish
            .map_or(true, |at| at.elapsed() >= Duration::from_secs(1));
        if changed || due {
            bus.publish_text(camera, "alive", if alive { "true" } else { "false" }, true);
            self.last_value = Some(alive);
            self.last_publish = Some(Instant::now());
        }
    }
}

// ----------------------------------------------------------------------------
// Capture manager
// ----------------------------------------------------------------------------

pub struct CaptureManager {
    settings: CameraSettings,
    calibration: Arc<CameraCalibration>,
    bus: Arc<dyn TelemetryBus>,
    frames: Arc<TimedQueue<CameraFrame>>,
    frame_debug: FrameDebugSettings,
    running: Arc<AtomicBool>,
}

impl CaptureManager {
    pub fn new(
        settings: CameraSettings,
        calibration: Arc<CameraCalibration>,
        bus: Arc<dyn TelemetryBus>,
        frames: Arc<TimedQueue<CameraFrame>>,
        frame_debug: FrameDebugSettings,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            settings,
            calibration,
            bus,
            frames,
            frame_debug,
            running,
        }
    }

    pub fn run(mut self) {
        let camera = self.settings.name.clone();
        let mut source: Option<CameraSource> = None;
        let mut active_params: Option<CameraRuntimeParams> = None;
        let mut first_frame_pending = false;
        let mut alive = AliveReporter::new();
        let mut params_gate = FailureGate::default();
        let mut open_gate = FailureGate::default();
        let mut read_gate = FailureGate::default();

        // Rolling one-second frame counter.
        let mut rate = 0.0;
        let mut count: u32 = 0;
        let mut window_start = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            let Some(params) = self.bus.camera_params(&camera) else {
                source = None;
                active_params = None;
                alive.report(self.bus.as_ref(), &camera, false);
                if params_gate.trip() {
                    log::warn!("{}: no config on the bus, camera closed", camera);
                }
                std::thread::sleep(Duration::from_secs(1));
                continue;
            };
            params_gate.reset();

            if active_params.is_some() && active_params != Some(params) {
                log::info!("{}: runtime params changed, reopening", camera);
                source = None;
            }

            if source.is_none() {
                match CameraSource::open(&self.settings.id, &self.calibration, &params) {
                    Ok(opened) => {
                        source = Some(opened);
                        active_params = Some(params);
                        first_frame_pending = true;
                        open_gate.reset();
                    }
                    Err(e) => {
                        active_params = None;
                        alive.report(self.bus.as_ref(), &camera, false);
                        if open_gate.trip() {
                            log::warn!("{}: open failed: {}", camera, e);
                        }
                        std::thread::sleep(Duration::from_secs(1));
                        continue;
                    }
                }
            }

            let (image, timestamp) = match source.as_mut().map(CameraSource::read) {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    source = None;
                    alive.report(self.bus.as_ref(), &camera, false);
                    if read_gate.trip() {
                        log::warn!("{}: read failed: {}", camera, e);
                    }
                    std::thread::sleep(Duration::from_secs(1));
                    continue;
                }
                None => continue,
            };
            read_gate.reset();
            alive.report(self.bus.as_ref(), &camera, true);

            let now = Instant::now();
            while now.duration_since(window_start) >= Duration::from_secs(1) {
                rate = f64::from(count);
                count = 0;
                window_start += Duration::from_secs(1);
            }
            count += 1;

            if first_frame_pending {
                first_frame_pending = false;
                self.record_first_frame(&camera, &image);
            }

            self.frames.push(CameraFrame {
                timestamp,
                camera: camera.clone(),
                calibration: Arc::clone(&self.calibration),
                image,
                rate,
            });
        }
        alive.report(self.bus.as_ref(), &camera, false);
    }

    /// First frame after every (re)open: optionally archive a JPEG and tell
    /// the bus where it went.
    fn record_first_frame(&mut self, camera: &str, image: &RgbImage) {
        if !self.frame_debug.enabled {
            return;
        }
        match save_debug_frame(&self.frame_debug.output_dir, camera, image) {
            Ok(path) => {
                self.bus
                    .publish_text(camera, "first_frame", &path.display().to_string(), true);
            }
            Err(e) => log::warn!("{}: first-frame archive failed: {}", camera, e),
        }
    }
}

fn save_debug_frame(dir: &std::path::Path, camera: &str, image: &RgbImage) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!(
        "{}_{:.3}.jpg",
        camera,
        crate::frame::pipeline_now()
    ));
    std::fs::write(&path, annotate::encode_jpeg(image, 90)?)?;
    Ok(path)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
