//! Log replay: feed recorded detections back through the live pipeline.
//!
//! Only detection records drive replay; match and estimate records are
//! ignored (estimates are recomputed by the workers, which is the point of
//! replaying). Records are released on the recorded timeline, optionally
//! scaled by a speed factor, into per-camera queues consumed by
//! `ReplayDetector` workers. Everything downstream is the live code path.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::config::CameraCalibration;
use crate::detect::{DetectionBatch, TagObservation};
use crate::frame::{pipeline_now, CameraFrame};
use crate::log::{LogEvent, LogReader};
use crate::queue::TimedQueue;

pub type ReplayFeeds = HashMap<String, (Arc<CameraCalibration>, Arc<TimedQueue<DetectionBatch>>)>;

/// Replay `path` into the per-camera feeds. Returns when the log is
/// exhausted or `running` clears.
pub fn run(path: &Path, speed: f64, feeds: &ReplayFeeds, running: &AtomicBool) -> Result<()> {
    if speed <= 0.0 {
        return Err(anyhow!("replay speed must be positive, got {}", speed));
    }

    let mut reader = LogReader::open(path)?;
    let mut records: Vec<(f64, String, Vec<TagObservation>)> = Vec::new();
    while let Some(record) = reader.next_record()? {
        if let LogEvent::Detections(detections) = record.event {
            records.push((record.timestamp, record.camera, detections));
        }
    }
    if reader.resyncs() > 0 {
        log::warn!(
            "{}: skipped {} damaged spans",
            path.display(),
            reader.resyncs()
        );
    }
    let Some(first_ts) = records.first().map(|record| record.0) else {
        log::warn!("{}: no detection records to replay", path.display());
        return Ok(());
    };
    log::info!(
        "replaying {} detection records from {} at {}x",
        records.len(),
        path.display(),
        speed
    );

    let started = Instant::now();
    let mut unknown_cameras: HashSet<String> = HashSet::new();
    let mut next = 0;
    while next < records.len() && running.load(Ordering::SeqCst) {
        let elapsed = started.elapsed().as_secs_f64() * speed;
        let due = first_ts + elapsed;
        while next < records.len() && records[next].0 <= due {
            let (_, camera, detections) = &records[next];
            next += 1;
            let Some((calibration, queue)) = feeds.get(camera) else {
                if unknown_cameras.insert(camera.clone()) {
                    log::warn!("log names unconfigured camera {}, skipping", camera);
                }
                continue;
            };
            queue.push(DetectionBatch {
                frame: CameraFrame {
                    timestamp: pipeline_now(),
                    camera: camera.clone(),
                    calibration: Arc::clone(calibration),
                    image: RgbImage::new(calibration.resolution[0], calibration.resolution[1]),
                    rate: 0.0,
                },
                detections: detections.clone(),
                detect_seconds: 0.0,
            });
        }
        if next < records.len() {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
