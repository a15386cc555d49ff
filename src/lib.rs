//! tagtrack: a multi-camera fiducial tracking pipeline.
//!
//! Capture threads push timestamped frames into a priority queue; a fixed
//! pool of workers detects tags and solves camera poses against a known tag
//! environment; a single dispatcher restores timestamp order and fans
//! results out to the MQTT telemetry bus, a durable binary log, and an MJPEG
//! preview stream. Recorded logs replay through the same worker/dispatcher
//! path.
//!
//! The `tagtrackd` binary runs the pipeline; `taglog` inspects log files.

pub mod annotate;
pub mod bus;
pub mod capture;
pub mod config;
pub mod detect;
pub mod dispatch;
pub mod environment;
pub mod frame;
pub mod geom;
pub mod log;
pub mod queue;
pub mod replay;
pub mod solve;
pub mod stream;
pub mod worker;

pub use bus::{InMemoryBus, MqttBus, TelemetryBus};
pub use config::TagTrackConfig;
pub use environment::{SharedEnvironment, TagEnvironment};
pub use frame::{pipeline_now, CameraFrame, FrameResult};
pub use queue::TimedQueue;
