//! Daemon configuration: JSON file, environment overrides, validation.
//!
//! The file carries everything that is fixed for the life of the process
//! (camera set, worker count, ports, directories). Per-camera exposure and
//! frame-rate settings are NOT here; those are live values polled from the
//! telemetry bus.

use anyhow::{anyhow, Result};
use nalgebra::Matrix3;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::detect::{DetectorKind, TagFamily};

const DEFAULT_BUS_ADDR: &str = "mqtt://127.0.0.1:1883";
const DEFAULT_BUS_CLIENT_ID: &str = "tagtrack";
const DEFAULT_PROCESS_THREADS: usize = 2;
const DEFAULT_STREAM_PORT: u16 = 5800;
const DEFAULT_FRAME_DEBUG_DIR: &str = "frames";
const DEFAULT_LOG_DIR: &str = "logs";

#[derive(Debug, Deserialize, Default)]
struct TagTrackConfigFile {
    bus: Option<BusConfigFile>,
    #[serde(rename = "tag-family")]
    tag_family: Option<String>,
    detector: Option<String>,
    #[serde(rename = "process-threads")]
    process_threads: Option<usize>,
    cameras: Option<Vec<CameraConfigFile>>,
    environment: Option<PathBuf>,
    #[serde(rename = "frame-debug")]
    frame_debug: Option<FrameDebugConfigFile>,
    #[serde(rename = "web-stream")]
    web_stream: Option<WebStreamConfigFile>,
    logging: Option<LoggingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct BusConfigFile {
    addr: Option<String>,
    client_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    name: Option<String>,
    id: Option<String>,
    calibration: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct FrameDebugConfigFile {
    enabled: Option<bool>,
    #[serde(rename = "output-dir")]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct WebStreamConfigFile {
    port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfigFile {
    enabled: Option<bool>,
    #[serde(rename = "output-dir")]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TagTrackConfig {
    pub bus: BusSettings,
    pub tag_family: TagFamily,
    pub detector: DetectorKind,
    pub process_threads: usize,
    pub cameras: Vec<CameraSettings>,
    pub environment_path: PathBuf,
    pub frame_debug: FrameDebugSettings,
    pub stream_port: u16,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct BusSettings {
    pub addr: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub name: String,
    /// Device path or `stub://<seed>` synthetic URL.
    pub id: String,
    pub calibration_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FrameDebugSettings {
    pub enabled: bool,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub enabled: bool,
    pub output_dir: PathBuf,
}

impl TagTrackConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TagTrackConfigFile) -> Result<Self> {
        let bus = BusSettings {
            addr: file
                .bus
                .as_ref()
                .and_then(|bus| bus.addr.clone())
                .unwrap_or_else(|| DEFAULT_BUS_ADDR.to_string()),
            client_id: file
                .bus
                .as_ref()
                .and_then(|bus| bus.client_id.clone())
                .unwrap_or_else(|| DEFAULT_BUS_CLIENT_ID.to_string()),
        };
        let tag_family = match file.tag_family.as_deref() {
            Some(name) => name.parse::<TagFamily>()?,
            None => TagFamily::Tag36h11,
        };
        let detector = match file.detector.as_deref() {
            Some(name) => name.parse::<DetectorKind>()?,
            None => DetectorKind::Scripted,
        };
        let process_threads = file.process_threads.unwrap_or(DEFAULT_PROCESS_THREADS);
        let cameras = file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .map(|camera| {
                Ok(CameraSettings {
                    name: camera
                        .name
                        .ok_or_else(|| anyhow!("camera entry is missing a name"))?,
                    id: camera
                        .id
                        .ok_or_else(|| anyhow!("camera entry is missing an id"))?,
                    calibration_path: camera
                        .calibration
                        .ok_or_else(|| anyhow!("camera entry is missing a calibration path"))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let environment_path = file
            .environment
            .ok_or_else(|| anyhow!("config is missing the environment layout path"))?;
        let frame_debug = FrameDebugSettings {
            enabled: file
                .frame_debug
                .as_ref()
                .and_then(|dbg| dbg.enabled)
                .unwrap_or(false),
            output_dir: file
                .frame_debug
                .and_then(|dbg| dbg.output_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FRAME_DEBUG_DIR)),
        };
        let stream_port = file
            .web_stream
            .and_then(|stream| stream.port)
            .unwrap_or(DEFAULT_STREAM_PORT);
        let logging = LoggingSettings {
            enabled: file
                .logging
                .as_ref()
                .and_then(|logging| logging.enabled)
                .unwrap_or(false),
            output_dir: file
                .logging
                .and_then(|logging| logging.output_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
        };
        Ok(Self {
            bus,
            tag_family,
            detector,
            process_threads,
            cameras,
            environment_path,
            frame_debug,
            stream_port,
            logging,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("TAGTRACK_BUS_ADDR") {
            if !addr.trim().is_empty() {
                self.bus.addr = addr;
            }
        }
        if let Ok(port) = std::env::var("TAGTRACK_STREAM_PORT") {
            if !port.trim().is_empty() {
                self.stream_port = port
                    .parse()
                    .map_err(|_| anyhow!("TAGTRACK_STREAM_PORT must be a port number"))?;
            }
        }
        if let Ok(dir) = std::env::var("TAGTRACK_LOG_DIR") {
            if !dir.trim().is_empty() {
                self.logging.output_dir = PathBuf::from(dir);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.process_threads == 0 {
            return Err(anyhow!("process-threads must be at least 1"));
        }
        if self.cameras.is_empty() {
            return Err(anyhow!("at least one camera must be configured"));
        }
        let mut names = HashSet::new();
        for camera in &self.cameras {
            if camera.name.is_empty() {
                return Err(anyhow!("camera names must not be empty"));
            }
            if !names.insert(camera.name.as_str()) {
                return Err(anyhow!("duplicate camera name: {}", camera.name));
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<TagTrackConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

// ----------------------------------------------------------------------------
// Camera calibration files
// ----------------------------------------------------------------------------

/// Intrinsics produced by the offline calibration procedure.
#[derive(Debug, Clone)]
pub struct CameraCalibration {
    /// Width, height. The calibration file stores rows then columns, so the
    /// loader swaps the indexes.
    pub resolution: [u32; 2],
    pub matrix: Matrix3<f64>,
    pub distortion: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct CalibrationFile {
    camera_resolution: MatrixData,
    camera_matrix: MatrixData,
    distortion_coefficients: MatrixData,
}

#[derive(Debug, Deserialize)]
struct MatrixData {
    data: Vec<f64>,
}

impl CameraCalibration {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read calibration file {}: {}", path.display(), e))?;
        let file: CalibrationFile = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid calibration file {}: {}", path.display(), e))?;
        if file.camera_resolution.data.len() < 2 {
            return Err(anyhow!(
                "calibration file {} has a malformed camera_resolution",
                path.display()
            ));
        }
        if file.camera_matrix.data.len() != 9 {
            return Err(anyhow!(
                "calibration file {} must carry a 3x3 camera matrix",
                path.display()
            ));
        }
        let resolution = [
            file.camera_resolution.data[1] as u32,
            file.camera_resolution.data[0] as u32,
        ];
        Ok(Self {
            resolution,
            matrix: Matrix3::from_row_slice(&file.camera_matrix.data),
            distortion: file.distortion_coefficients.data,
        })
    }
}
