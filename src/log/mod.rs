//! Framed binary log (`.ttlog` files).
//!
//! Records are self-delimiting: a start byte, a 16-bit big-endian body
//! length, then the body. A reader that lands mid-stream scans forward to
//! the next start byte, so a torn tail or a damaged span costs records, not
//! the file. `LogWriter` decouples producers from the disk with a channel
//! and a background thread that flushes and fsyncs at least once per second.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rand::Rng;

use crate::bus::{Cursor, MatchInfo};
use crate::detect::TagObservation;
use crate::solve::{EstimatePair, PoseEstimate};
use crate::geom;

pub const START_BYTE: u8 = 0x5A;

const EVENT_DETECTIONS: i8 = 0;
const EVENT_MATCH: i8 = 1;
const EVENT_ESTIMATES: i8 = 2;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// One logged pose candidate.
#[derive(Clone, Debug, PartialEq)]
pub struct LoggedEstimate {
    pub error: f64,
    pub translation: [f64; 3],
    pub quaternion: [f64; 4],
}

impl From<&PoseEstimate> for LoggedEstimate {
    fn from(estimate: &PoseEstimate) -> Self {
        let t = estimate.pose.translation.vector;
        Self {
            error: estimate.reprojection_error,
            translation: [t.x, t.y, t.z],
            quaternion: geom::quaternion_wxyz(&estimate.pose),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogEvent {
    Detections(Vec<TagObservation>),
    Match(MatchInfo),
    Estimates(Vec<LoggedEstimate>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    /// Pipeline-clock seconds.
    pub timestamp: f64,
    /// Empty for match records.
    pub camera: String,
    pub event: LogEvent,
}

impl LogRecord {
    pub fn estimates(timestamp: f64, camera: &str, pair: &EstimatePair) -> Self {
        let mut estimates = vec![LoggedEstimate::from(&pair.pose_a)];
        if let Some(b) = &pair.pose_b {
            estimates.push(LoggedEstimate::from(b));
        }
        Self {
            timestamp,
            camera: camera.to_string(),
            event: LogEvent::Estimates(estimates),
        }
    }
}

// ----------------------------------------------------------------------------
// Record codec
// ----------------------------------------------------------------------------

pub fn encode_record(record: &LogRecord) -> Result<Vec<u8>> {
    let camera = record.camera.as_bytes();
    if camera.len() > u8::MAX as usize {
        return Err(anyhow!("camera name too long for the log: {}", record.camera));
    }
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&record.timestamp.to_be_bytes());
    body.push(event_id(&record.event) as u8);
    body.push(camera.len() as u8);
    body.extend_from_slice(camera);
    encode_event(&mut body, &record.event)?;

    if body.len() > u16::MAX as usize {
        return Err(anyhow!("log record body too large: {} bytes", body.len()));
    }
    let mut framed = Vec::with_capacity(body.len() + 3);
    framed.push(START_BYTE);
    framed.extend_from_slice(&(body.len() as u16).to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

fn event_id(event: &LogEvent) -> i8 {
    match event {
        LogEvent::Detections(_) => EVENT_DETECTIONS,
        LogEvent::Match(_) => EVENT_MATCH,
        LogEvent::Estimates(_) => EVENT_ESTIMATES,
    }
}

fn encode_event(body: &mut Vec<u8>, event: &LogEvent) -> Result<()> {
    match event {
        LogEvent::Detections(detections) => {
            if detections.len() > u8::MAX as usize {
                return Err(anyhow!("too many detections in one record"));
            }
            body.push(detections.len() as u8);
            for detection in detections {
                body.push(detection.id);
                body.push(detection.corners.len() as u8);
                for corner in &detection.corners {
                    body.extend_from_slice(&corner[0].to_be_bytes());
                    body.extend_from_slice(&corner[1].to_be_bytes());
                }
            }
        }
        LogEvent::Match(info) => {
            let name = info.event_name.as_bytes();
            if name.len() > u16::MAX as usize {
                return Err(anyhow!("event name too long for the log"));
            }
            body.extend_from_slice(&(name.len() as u16).to_be_bytes());
            body.extend_from_slice(name);
            body.extend_from_slice(&info.match_num.to_be_bytes());
            body.extend_from_slice(&info.match_type.to_be_bytes());
            body.extend_from_slice(&info.replay_num.to_be_bytes());
            body.push(u8::from(info.is_red));
            body.extend_from_slice(&info.station_num.to_be_bytes());
        }
        LogEvent::Estimates(estimates) => {
            if estimates.is_empty() || estimates.len() > 2 {
                return Err(anyhow!(
                    "estimate records carry 1 or 2 candidates, got {}",
                    estimates.len()
                ));
            }
            body.push(estimates.len() as u8);
            for estimate in estimates {
                body.extend_from_slice(&estimate.error.to_be_bytes());
                for v in estimate.translation {
                    body.extend_from_slice(&v.to_be_bytes());
                }
                for v in estimate.quaternion {
                    body.extend_from_slice(&v.to_be_bytes());
                }
            }
        }
    }
    Ok(())
}

pub fn decode_record(body: &[u8]) -> Result<LogRecord> {
    let mut cursor = Cursor::new(body);
    let timestamp = cursor.take_f64()?;
    let event_id = cursor.take_i8()?;
    let name_len = cursor.take_u8()? as usize;
    let camera = std::str::from_utf8(cursor.take(name_len)?)
        .context("camera name is not utf-8")?
        .to_string();
    let event = match event_id {
        EVENT_DETECTIONS => {
            let count = cursor.take_u8()? as usize;
            let mut detections = Vec::with_capacity(count);
            for _ in 0..count {
                let id = cursor.take_u8()?;
                let corner_count = cursor.take_u8()? as usize;
                if corner_count != 4 {
                    return Err(anyhow!("detection record with {} corners", corner_count));
                }
                let mut corners = [[0.0f64; 2]; 4];
                for corner in &mut corners {
                    corner[0] = cursor.take_f64()?;
                    corner[1] = cursor.take_f64()?;
                }
                detections.push(TagObservation { id, corners });
            }
            LogEvent::Detections(detections)
        }
        EVENT_MATCH => {
            let name_len = cursor.take_u16()? as usize;
            let event_name = std::str::from_utf8(cursor.take(name_len)?)
                .context("event name is not utf-8")?
                .to_string();
            LogEvent::Match(MatchInfo {
                event_name,
                match_num: cursor.take_i32()?,
                match_type: cursor.take_i32()?,
                replay_num: cursor.take_i32()?,
                is_red: cursor.take_u8()? != 0,
                station_num: cursor.take_i32()?,
            })
        }
        EVENT_ESTIMATES => {
            let count = cursor.take_u8()? as usize;
            if count == 0 || count > 2 {
                return Err(anyhow!("estimate record with {} candidates", count));
            }
            let mut estimates = Vec::with_capacity(count);
            for _ in 0..count {
                let error = cursor.take_f64()?;
                let translation = [cursor.take_f64()?, cursor.take_f64()?, cursor.take_f64()?];
                let quaternion = [
                    cursor.take_f64()?,
                    cursor.take_f64()?,
                    cursor.take_f64()?,
                    cursor.take_f64()?,
                ];
                estimates.push(LoggedEstimate {
                    error,
                    translation,
                    quaternion,
                });
            }
            LogEvent::Estimates(estimates)
        }
        other => return Err(anyhow!("unknown log event id {}", other)),
    };
    cursor.finish()?;
    Ok(LogRecord {
        timestamp,
        camera,
        event,
    })
}

// ----------------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------------

pub struct LogWriter {
    path: PathBuf,
    tx: Option<Sender<Vec<u8>>>,
    handle: Option<JoinHandle<()>>,
}

impl LogWriter {
    /// Open a fresh log file in `dir` and start the writer thread.
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create log directory {}", dir.display()))?;
        let name = format!("log_{}.ttlog", rand::thread_rng().gen::<u64>() >> 1);
        let path = dir.join(name);
        let file = File::create(&path)
            .with_context(|| format!("create log file {}", path.display()))?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let thread_path = path.clone();
        let handle = std::thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || {
                let mut writer = BufWriter::new(file);
                let mut last_sync = Instant::now();
                loop {
                    match rx.recv_timeout(FLUSH_INTERVAL) {
                        Ok(bytes) => {
                            if let Err(e) = writer.write_all(&bytes) {
                                log::error!(
                                    "log write to {} failed, stopping: {}",
                                    thread_path.display(),
                                    e
                                );
                                return;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if last_sync.elapsed() >= FLUSH_INTERVAL {
                        if let Err(e) = sync(&mut writer) {
                            log::error!(
                                "log sync of {} failed, stopping: {}",
                                thread_path.display(),
                                e
                            );
                            return;
                        }
                        last_sync = Instant::now();
                    }
                }
                if let Err(e) = sync(&mut writer) {
                    log::error!("final log sync of {} failed: {}", thread_path.display(), e);
                }
            })
            .context("spawn log writer thread")?;

        log::info!("logging to {}", path.display());
        Ok(Self {
            path,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand a record to the writer thread. Never blocks on the disk.
    pub fn append(&self, record: &LogRecord) {
        let bytes = match encode_record(record) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("unloggable record dropped: {}", e);
                return;
            }
        };
        if let Some(tx) = &self.tx {
            // A dead writer thread has already logged its own error.
            let _ = tx.send(bytes);
        }
    }

    /// Drain, flush, fsync, and join the writer thread.
    pub fn stop(mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("log writer thread panicked");
            }
        }
    }
}

fn sync(writer: &mut BufWriter<File>) -> std::io::Result<()> {
    writer.flush()?;
    writer.get_ref().sync_data()
}

// ----------------------------------------------------------------------------
// Reader
// ----------------------------------------------------------------------------

pub struct LogReader {
    bytes: Vec<u8>,
    at: usize,
    resyncs: usize,
    /// True while skipping a damaged span, so one span counts once.
    skipping: bool,
}

impl LogReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut bytes = Vec::new();
        File::open(path)
            .with_context(|| format!("open log file {}", path.display()))?
            .read_to_end(&mut bytes)
            .with_context(|| format!("read log file {}", path.display()))?;
        Ok(Self {
            bytes,
            at: 0,
            resyncs: 0,
            skipping: false,
        })
    }

    /// Next decodable record, or `Ok(None)` at end of file. A truncated tail
    /// is normal (the writer may have been cut mid-record) and ends the file.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>> {
        loop {
            // Scan forward to a start byte.
            while self.at < self.bytes.len() && self.bytes[self.at] != START_BYTE {
                if !self.skipping {
                    self.skipping = true;
                    self.resyncs += 1;
                }
                self.at += 1;
            }
            if self.at + 3 > self.bytes.len() {
                return Ok(None);
            }
            let len =
                u16::from_be_bytes([self.bytes[self.at + 1], self.bytes[self.at + 2]]) as usize;
            let start = self.at + 3;
            let end = start + len;
            if end > self.bytes.len() {
                return Ok(None);
            }
            match decode_record(&self.bytes[start..end]) {
                Ok(record) => {
                    self.at = end;
                    self.skipping = false;
                    return Ok(Some(record));
                }
                Err(_) => {
                    // A false start byte inside garbage; resume scanning one
                    // byte later.
                    if !self.skipping {
                        self.skipping = true;
                        self.resyncs += 1;
                    }
                    self.at += 1;
                }
            }
        }
    }

    /// Number of damaged spans skipped so far.
    pub fn resyncs(&self) -> usize {
        self.resyncs
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(id: u8) -> TagObservation {
        TagObservation {
            id,
            corners: [[1.5, 2.5], [3.5, 2.5], [3.5, 4.5], [1.5, 4.5]],
        }
    }

    fn sample_records() -> Vec<LogRecord> {
        vec![
            LogRecord {
                timestamp: 1.25,
                camera: "front".to_string(),
                event: LogEvent::Detections(vec![detection(3), detection(8)]),
            },
            LogRecord {
                timestamp: 1.5,
                camera: String::new(),
                event: LogEvent::Match(MatchInfo {
                    event_name: "SCRIM".to_string(),
                    match_num: 12,
                    match_type: 2,
                    replay_num: 0,
                    is_red: true,
                    station_num: 1,
                }),
            },
            LogRecord {
                timestamp: 1.75,
                camera: "front".to_string(),
                event: LogEvent::Estimates(vec![
                    LoggedEstimate {
                        error: 0.4,
                        translation: [1.0, 2.0, 0.5],
                        quaternion: [1.0, 0.0, 0.0, 0.0],
                    },
                    LoggedEstimate {
                        error: 2.1,
                        translation: [1.1, 2.2, 0.4],
                        quaternion: [0.9, 0.1, 0.0, 0.0],
                    },
                ]),
            },
        ]
    }

    #[test]
    fn records_round_trip_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.ttlog");
        let mut bytes = Vec::new();
        for record in sample_records() {
            bytes.extend(encode_record(&record).unwrap());
        }
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        for expected in sample_records() {
            assert_eq!(reader.next_record().unwrap().unwrap(), expected);
        }
        assert!(reader.next_record().unwrap().is_none());
        assert_eq!(reader.resyncs(), 0);
    }

    #[test]
    fn reader_resyncs_past_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("damaged.ttlog");
        let records = sample_records();
        let mut bytes = encode_record(&records[0]).unwrap();
        bytes.extend_from_slice(&[0x00, 0x13, 0x37, 0x00]);
        bytes.extend(encode_record(&records[2]).unwrap());
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap(), records[0]);
        assert_eq!(reader.next_record().unwrap().unwrap(), records[2]);
        assert!(reader.next_record().unwrap().is_none());
        assert_eq!(reader.resyncs(), 1);
    }

    #[test]
    fn truncated_tail_ends_the_file_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.ttlog");
        let records = sample_records();
        let mut bytes = encode_record(&records[0]).unwrap();
        let torn = encode_record(&records[1]).unwrap();
        bytes.extend_from_slice(&torn[..torn.len() / 2]);
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap(), records[0]);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn writer_thread_lands_records_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LogWriter::create(dir.path()).unwrap();
        let path = writer.path().to_path_buf();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("log_"));

        for record in sample_records() {
            writer.append(&record);
        }
        writer.stop();

        let mut reader = LogReader::open(&path).unwrap();
        let mut seen = 0;
        while reader.next_record().unwrap().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[test]
    fn oversized_camera_names_are_rejected() {
        let record = LogRecord {
            timestamp: 0.0,
            camera: "x".repeat(300),
            event: LogEvent::Detections(vec![]),
        };
        assert!(encode_record(&record).is_err());
    }
}
