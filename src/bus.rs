//! Telemetry/config bus.
//!
//! The bus carries three kinds of traffic:
//! - outputs published per camera (poses payload, fps, liveness, resolution,
//!   first-frame diagnostics) plus the field environment,
//! - retained per-camera config documents polled by the capture managers,
//! - retained match/session metadata polled by the dispatcher.
//!
//! `TelemetryBus` is the seam; `MqttBus` is the production implementation
//! and `InMemoryBus` backs the tests. Publish failures are logged, never
//! fatal: an unreachable broker degrades the pipeline, it does not stop it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use serde::Deserialize;

use crate::capture::CameraRuntimeParams;
use crate::environment::{SharedEnvironment, TagEnvironment};
use crate::frame::FrameResult;
use crate::geom;

const TOPIC_PREFIX: &str = "tagtrack";
const MATCH_TOPIC: &str = "tagtrack/match_info";
const ENVIRONMENT_TOPIC: &str = "tagtrack/environment";
const ENVIRONMENT_SET_TOPIC: &str = "tagtrack/environment/set";

pub fn camera_output_topic(camera: &str, output: &str) -> String {
    format!("{TOPIC_PREFIX}/cameras/{camera}/outputs/{output}")
}

fn camera_config_topic(camera: &str) -> String {
    format!("{TOPIC_PREFIX}/cameras/{camera}/config")
}

/// Match/session metadata consumed from the bus and mirrored into the log.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatchInfo {
    pub event_name: String,
    pub match_num: i32,
    pub match_type: i32,
    pub replay_num: i32,
    pub is_red: bool,
    pub station_num: i32,
}

impl Default for MatchInfo {
    fn default() -> Self {
        Self {
            event_name: "UNKNOWN".to_string(),
            match_num: 999_999,
            match_type: 999_999,
            replay_num: 999_999,
            is_red: false,
            station_num: 999_999,
        }
    }
}

/// The bus seam shared by capture managers and the dispatcher.
pub trait TelemetryBus: Send + Sync {
    /// Retained per-camera runtime params. `None` means unavailable: no
    /// retained document yet, or the broker is unreachable.
    fn camera_params(&self, camera: &str) -> Option<CameraRuntimeParams>;

    /// Current match metadata; defaults when no document has arrived.
    fn match_info(&self) -> MatchInfo;

    fn publish_text(&self, camera: &str, output: &str, value: &str, retained: bool);

    fn publish_poses(&self, camera: &str, payload: Vec<u8>);

    fn publish_environment(&self, environment: &TagEnvironment);

    fn connected(&self) -> bool;
}

// ----------------------------------------------------------------------------
// Wire codecs
// ----------------------------------------------------------------------------

/// One pose as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PosePayload {
    pub error: f32,
    pub translation: [f64; 3],
    pub quaternion: [f64; 4],
}

/// Decoded poses payload, for consumers and the round-trip tests.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedPoses {
    pub estimate_a: Option<PosePayload>,
    pub estimate_b: Option<PosePayload>,
    pub detections: Vec<(u8, [[u16; 2]; 4])>,
    pub latency_seconds: f64,
}

/// Pack one frame result into the binary poses payload (big-endian).
pub fn encode_poses(result: &FrameResult, latency_seconds: f64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(128);
    match &result.estimates {
        Some(pair) => {
            bytes.push(1);
            put_pose(&mut bytes, &pair.pose_a.pose, pair.pose_a.reprojection_error);
            match &pair.pose_b {
                Some(b) => {
                    bytes.push(1);
                    put_pose(&mut bytes, &b.pose, b.reprojection_error);
                }
                None => bytes.push(0),
            }
        }
        None => bytes.push(0),
    }
    bytes.push(result.detections.len().min(u8::MAX as usize) as u8);
    for detection in result.detections.iter().take(u8::MAX as usize) {
        bytes.push(detection.id);
        for corner in &detection.corners {
            bytes.extend_from_slice(&round_u16(corner[0]).to_be_bytes());
            bytes.extend_from_slice(&round_u16(corner[1]).to_be_bytes());
        }
    }
    bytes.extend_from_slice(&latency_seconds.to_be_bytes());
    bytes
}

pub fn decode_poses(bytes: &[u8]) -> Result<DecodedPoses> {
    let mut cursor = Cursor::new(bytes);
    let estimate_a = if cursor.take_u8()? != 0 {
        Some(take_pose(&mut cursor)?)
    } else {
        None
    };
    let estimate_b = if estimate_a.is_some() && cursor.take_u8()? != 0 {
        Some(take_pose(&mut cursor)?)
    } else {
        None
    };
    let count = cursor.take_u8()? as usize;
    let mut detections = Vec::with_capacity(count);
    for _ in 0..count {
        let id = cursor.take_u8()?;
        let mut corners = [[0u16; 2]; 4];
        for corner in &mut corners {
            corner[0] = cursor.take_u16()?;
            corner[1] = cursor.take_u16()?;
        }
        detections.push((id, corners));
    }
    let latency_seconds = cursor.take_f64()?;
    cursor.finish()?;
    Ok(DecodedPoses {
        estimate_a,
        estimate_b,
        detections,
        latency_seconds,
    })
}

fn put_pose(bytes: &mut Vec<u8>, pose: &nalgebra::Isometry3<f64>, error: f64) {
    bytes.extend_from_slice(&(error as f32).to_be_bytes());
    let t = pose.translation.vector;
    for v in [t.x, t.y, t.z] {
        bytes.extend_from_slice(&v.to_be_bytes());
    }
    for v in geom::quaternion_wxyz(pose) {
        bytes.extend_from_slice(&v.to_be_bytes());
    }
}

fn take_pose(cursor: &mut Cursor<'_>) -> Result<PosePayload> {
    let error = cursor.take_f32()?;
    let translation = [cursor.take_f64()?, cursor.take_f64()?, cursor.take_f64()?];
    let quaternion = [
        cursor.take_f64()?,
        cursor.take_f64()?,
        cursor.take_f64()?,
        cursor.take_f64()?,
    ];
    Ok(PosePayload {
        error,
        translation,
        quaternion,
    })
}

fn round_u16(value: f64) -> u16 {
    value.round().clamp(0.0, f64::from(u16::MAX)) as u16
}

/// Flat f64 array as big-endian bytes (environment encoding).
pub fn encode_f64_array(values: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 8);
    for v in values {
        bytes.extend_from_slice(&v.to_be_bytes());
    }
    bytes
}

pub fn decode_f64_array(bytes: &[u8]) -> Result<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return Err(anyhow!("f64 array payload length {} not a multiple of 8", bytes.len()));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_be_bytes(raw)
        })
        .collect())
}

/// Bounds-checked big-endian reader shared by the binary payload decoders.
pub(crate) struct Cursor<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, at: 0 }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.at + n;
        if end > self.bytes.len() {
            return Err(anyhow!(
                "payload truncated at byte {} (needed {})",
                self.bytes.len(),
                end
            ));
        }
        let slice = &self.bytes[self.at..end];
        self.at = end;
        Ok(slice)
    }

    pub(crate) fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn take_u16(&mut self) -> Result<u16> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    pub(crate) fn take_i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub(crate) fn take_i32(&mut self) -> Result<i32> {
        let raw = self.take(4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(raw);
        Ok(i32::from_be_bytes(buf))
    }

    pub(crate) fn take_f32(&mut self) -> Result<f32> {
        let raw = self.take(4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(raw);
        Ok(f32::from_be_bytes(buf))
    }

    pub(crate) fn take_f64(&mut self) -> Result<f64> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(f64::from_be_bytes(buf))
    }

    pub(crate) fn finish(&self) -> Result<()> {
        if self.at != self.bytes.len() {
            return Err(anyhow!(
                "payload has {} trailing bytes",
                self.bytes.len() - self.at
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// MQTT implementation
// ----------------------------------------------------------------------------

struct BusState {
    params: Mutex<HashMap<String, CameraRuntimeParams>>,
    match_info: Mutex<Option<MatchInfo>>,
    environment: SharedEnvironment,
    connected: AtomicBool,
    shutting_down: AtomicBool,
}

pub struct MqttBus {
    client: Client,
    state: Arc<BusState>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Connect to the broker and start the connection iterator thread. The
    /// thread keeps running through connection errors; `connected()` tracks
    /// reachability.
    pub fn connect(
        addr: &str,
        client_id: &str,
        environment: SharedEnvironment,
    ) -> Result<Self> {
        let (host, port) = parse_bus_addr(addr)?;
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);
        let (client, connection) = Client::new(options, 64);

        let state = Arc::new(BusState {
            params: Mutex::new(HashMap::new()),
            match_info: Mutex::new(None),
            environment,
            connected: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        });

        let thread_state = Arc::clone(&state);
        let thread_client = client.clone();
        let handle = std::thread::Builder::new()
            .name("bus-connection".to_string())
            .spawn(move || run_connection(connection, thread_client, thread_state))
            .context("spawn bus connection thread")?;

        Ok(Self {
            client,
            state,
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn disconnect(&self) -> Result<()> {
        self.state.shutting_down.store(true, Ordering::SeqCst);
        self.client.disconnect()?;
        let handle = self
            .connection_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow!("bus connection thread panicked"))?;
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, retained: bool) {
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtLeastOnce, retained, payload)
        {
            log::debug!("bus publish to {} failed: {}", topic, e);
        }
    }
}

impl TelemetryBus for MqttBus {
    fn camera_params(&self, camera: &str) -> Option<CameraRuntimeParams> {
        if !self.connected() {
            return None;
        }
        self.state
            .params
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(camera)
            .copied()
    }

    fn match_info(&self) -> MatchInfo {
        self.state
            .match_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }

    fn publish_text(&self, camera: &str, output: &str, value: &str, retained: bool) {
        self.publish(
            &camera_output_topic(camera, output),
            value.as_bytes().to_vec(),
            retained,
        );
    }

    fn publish_poses(&self, camera: &str, payload: Vec<u8>) {
        self.publish(&camera_output_topic(camera, "poses"), payload, false);
    }

    fn publish_environment(&self, environment: &TagEnvironment) {
        self.publish(
            ENVIRONMENT_TOPIC,
            encode_f64_array(&environment.to_flat_array()),
            true,
        );
    }

    fn connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}

fn run_connection(mut connection: Connection, client: Client, state: Arc<BusState>) {
    let mut last_warn: Option<Instant> = None;
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                state.connected.store(true, Ordering::SeqCst);
                log::info!("bus connected");
                if let Err(e) = subscribe_all(&client) {
                    log::warn!("bus subscribe failed: {}", e);
                }
                // Make sure a freshly-restarted broker carries the layout.
                let snapshot = state.environment.snapshot();
                if let Err(e) = client.publish(
                    ENVIRONMENT_TOPIC,
                    QoS::AtLeastOnce,
                    true,
                    encode_f64_array(&snapshot.to_flat_array()),
                ) {
                    log::debug!("bus environment publish failed: {}", e);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = String::from_utf8_lossy(&publish.topic).to_string();
                if let Err(e) = route_incoming(&client, &state, &topic, &publish.payload) {
                    log::warn!("bus message on {} rejected: {}", topic, e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                state.connected.store(false, Ordering::SeqCst);
                if state.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                let now = Instant::now();
                if last_warn.map_or(true, |t| now.duration_since(t) >= Duration::from_secs(5)) {
                    log::warn!("bus connection error: {}", e);
                    last_warn = Some(now);
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
}

fn subscribe_all(client: &Client) -> Result<()> {
    client.subscribe(
        format!("{TOPIC_PREFIX}/cameras/+/config"),
        QoS::AtLeastOnce,
    )?;
    client.subscribe(MATCH_TOPIC, QoS::AtLeastOnce)?;
    client.subscribe(ENVIRONMENT_SET_TOPIC, QoS::AtLeastOnce)?;
    Ok(())
}

fn route_incoming(
    client: &Client,
    state: &BusState,
    topic: &str,
    payload: &[u8],
) -> Result<()> {
    if let Some(camera) = config_topic_camera(topic) {
        let params: CameraRuntimeParams =
            serde_json::from_slice(payload).context("invalid camera config document")?;
        state
            .params
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(camera.to_string(), params);
        return Ok(());
    }
    if topic == MATCH_TOPIC {
        let info: MatchInfo =
            serde_json::from_slice(payload).context("invalid match info document")?;
        *state
            .match_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(info);
        return Ok(());
    }
    if topic == ENVIRONMENT_SET_TOPIC {
        let values = decode_f64_array(payload)?;
        let environment = TagEnvironment::from_flat_array(&values)?;
        log::info!("environment refreshed from bus: {} tags", environment.len());
        let encoded = encode_f64_array(&environment.to_flat_array());
        state.environment.replace(environment);
        client
            .publish(ENVIRONMENT_TOPIC, QoS::AtLeastOnce, true, encoded)
            .context("republish environment")?;
        return Ok(());
    }
    Ok(())
}

fn config_topic_camera(topic: &str) -> Option<&str> {
    topic
        .strip_prefix("tagtrack/cameras/")?
        .strip_suffix("/config")
        .filter(|camera| !camera.is_empty() && !camera.contains('/'))
}

fn parse_bus_addr(addr: &str) -> Result<(String, u16)> {
    let mut remainder = addr.trim();
    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            other => return Err(anyhow!("unsupported bus scheme: {}", other)),
        }
        remainder = rest;
    }
    let (host, port) = remainder
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing bus port in {}", addr))?;
    let port: u16 = port.parse().context("invalid bus port")?;
    Ok((host.to_string(), port))
}

// ----------------------------------------------------------------------------
// In-memory implementation for tests
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

#[derive(Default)]
pub struct InMemoryBus {
    params: Mutex<HashMap<String, CameraRuntimeParams>>,
    match_info: Mutex<Option<MatchInfo>>,
    messages: Mutex<Vec<BusMessage>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_camera_params(&self, camera: &str, params: CameraRuntimeParams) {
        self.params
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(camera.to_string(), params);
    }

    pub fn clear_camera_params(&self, camera: &str) {
        self.params
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(camera);
    }

    pub fn set_match_info(&self, info: MatchInfo) {
        *self
            .match_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(info);
    }

    pub fn messages(&self) -> Vec<BusMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recent payload published on a topic.
    pub fn last_payload(&self, topic: &str) -> Option<Vec<u8>> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|m| m.topic == topic)
            .map(|m| m.payload.clone())
    }

    fn record(&self, topic: String, payload: Vec<u8>, retained: bool) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(BusMessage {
                topic,
                payload,
                retained,
            });
    }
}

impl TelemetryBus for InMemoryBus {
    fn camera_params(&self, camera: &str) -> Option<CameraRuntimeParams> {
        self.params
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(camera)
            .copied()
    }

    fn match_info(&self) -> MatchInfo {
        self.match_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }

    fn publish_text(&self, camera: &str, output: &str, value: &str, retained: bool) {
        self.record(
            camera_output_topic(camera, output),
            value.as_bytes().to_vec(),
            retained,
        );
    }

    fn publish_poses(&self, camera: &str, payload: Vec<u8>) {
        self.record(camera_output_topic(camera, "poses"), payload, false);
    }

    fn publish_environment(&self, environment: &TagEnvironment) {
        self.record(
            ENVIRONMENT_TOPIC.to_string(),
            encode_f64_array(&environment.to_flat_array()),
            true,
        );
    }

    fn connected(&self) -> bool {
        true
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraCalibration;
    use crate::detect::TagObservation;
    use crate::frame::{CameraFrame, FrameResult, ProcessTimings};
    use crate::solve::{EstimatePair, PoseEstimate};
    use image::RgbImage;
    use nalgebra::{Isometry3, Matrix3, Translation3};

    fn result(detections: Vec<TagObservation>, estimates: Option<EstimatePair>) -> FrameResult {
        FrameResult {
            frame: CameraFrame {
                timestamp: 12.5,
                camera: "front".to_string(),
                calibration: Arc::new(CameraCalibration {
                    resolution: [640, 480],
                    matrix: Matrix3::identity(),
                    distortion: vec![],
                }),
                image: RgbImage::new(4, 4),
                rate: 48.0,
            },
            detections,
            estimates,
            timings: ProcessTimings::default(),
        }
    }

    fn estimate(error: f64, x: f64) -> PoseEstimate {
        PoseEstimate {
            pose: Isometry3::from_parts(
                Translation3::new(x, -2.0, 0.5),
                geom::quaternion_from_wxyz(1.0, 0.0, 0.0, 0.0),
            ),
            reprojection_error: error,
        }
    }

    fn observation(id: u8) -> TagObservation {
        TagObservation {
            id,
            corners: [
                [100.4, 200.6],
                [150.2, 200.1],
                [150.9, 250.3],
                [100.1, 250.8],
            ],
        }
    }

    #[test]
    fn poses_payload_round_trips_with_both_estimates() {
        let pair = EstimatePair {
            pose_a: estimate(0.25, 3.0),
            pose_b: Some(estimate(1.75, 3.5)),
        };
        let result = result(vec![observation(7)], Some(pair));
        let bytes = encode_poses(&result, 0.042);
        let decoded = decode_poses(&bytes).unwrap();

        let a = decoded.estimate_a.unwrap();
        assert!((a.error - 0.25).abs() < 1e-6);
        assert_eq!(a.translation, [3.0, -2.0, 0.5]);
        assert_eq!(a.quaternion, [1.0, 0.0, 0.0, 0.0]);
        let b = decoded.estimate_b.unwrap();
        assert!((b.error - 1.75).abs() < 1e-6);
        assert_eq!(decoded.detections.len(), 1);
        let (id, corners) = &decoded.detections[0];
        assert_eq!(*id, 7);
        assert_eq!(corners[0], [100, 201]);
        assert_eq!(corners[2], [151, 250]);
        assert_eq!(decoded.latency_seconds, 0.042);
    }

    #[test]
    fn empty_payload_is_flag_count_latency() {
        let bytes = encode_poses(&result(vec![], None), 0.01);
        assert_eq!(bytes.len(), 1 + 1 + 8);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[1], 0);
        let decoded = decode_poses(&bytes).unwrap();
        assert!(decoded.estimate_a.is_none());
        assert!(decoded.estimate_b.is_none());
        assert!(decoded.detections.is_empty());
    }

    #[test]
    fn single_estimate_sets_no_second_flag() {
        let pair = EstimatePair {
            pose_a: estimate(0.5, 1.0),
            pose_b: None,
        };
        let bytes = encode_poses(&result(vec![observation(1), observation(2)], Some(pair)), 0.0);
        let decoded = decode_poses(&bytes).unwrap();
        assert!(decoded.estimate_a.is_some());
        assert!(decoded.estimate_b.is_none());
        assert_eq!(decoded.detections.len(), 2);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let bytes = encode_poses(&result(vec![observation(1)], None), 0.0);
        assert!(decode_poses(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn f64_array_round_trips() {
        let values = [0.152, 1.0, -2.5, 3.25];
        let decoded = decode_f64_array(&encode_f64_array(&values)).unwrap();
        assert_eq!(decoded, values);
        assert!(decode_f64_array(&[0, 1, 2]).is_err());
    }

    #[test]
    fn match_info_defaults_apply_to_sparse_documents() {
        let info: MatchInfo = serde_json::from_str(r#"{"event_name":"REGIONAL"}"#).unwrap();
        assert_eq!(info.event_name, "REGIONAL");
        assert_eq!(info.match_num, 999_999);
        assert!(!info.is_red);
    }

    #[test]
    fn bus_addr_parsing() {
        assert_eq!(
            parse_bus_addr("mqtt://10.0.0.2:1883").unwrap(),
            ("10.0.0.2".to_string(), 1883)
        );
        assert_eq!(
            parse_bus_addr("localhost:1884").unwrap(),
            ("localhost".to_string(), 1884)
        );
        assert!(parse_bus_addr("http://x:1").is_err());
        assert!(parse_bus_addr("nohost").is_err());
    }

    #[test]
    fn config_topic_extraction() {
        assert_eq!(
            config_topic_camera("tagtrack/cameras/front/config"),
            Some("front")
        );
        assert_eq!(config_topic_camera("tagtrack/cameras//config"), None);
        assert_eq!(config_topic_camera("tagtrack/cameras/a/b/config"), None);
        assert_eq!(config_topic_camera("tagtrack/match_info"), None);
    }

    #[test]
    fn in_memory_bus_tracks_params_and_messages() {
        let bus = InMemoryBus::new();
        assert!(bus.camera_params("front").is_none());
        bus.set_camera_params("front", CameraRuntimeParams::default());
        assert!(bus.camera_params("front").is_some());

        bus.publish_text("front", "alive", "true", true);
        bus.publish_text("front", "alive", "false", true);
        let topic = camera_output_topic("front", "alive");
        assert_eq!(bus.last_payload(&topic).unwrap(), b"false");
        assert_eq!(bus.messages().len(), 2);
    }
}
