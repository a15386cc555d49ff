//! Offline .ttlog inspector.
//!
//! Walks a recorded log, validates framing, and prints a summary: record
//! counts per event type and per camera, the covered time span, and how
//! many damaged spans the reader had to skip. `--dump` additionally prints
//! every record.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use tagtrack::log::{LogEvent, LogReader};

#[derive(Parser, Debug)]
#[command(name = "taglog", about = "Inspect tagtrack .ttlog files")]
struct Args {
    /// Log file to inspect.
    file: PathBuf,

    /// Print every record, not just the summary.
    #[arg(long)]
    dump: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut reader = LogReader::open(&args.file)?;

    let mut detections = 0usize;
    let mut matches = 0usize;
    let mut estimates = 0usize;
    let mut per_camera: BTreeMap<String, usize> = BTreeMap::new();
    let mut first_ts: Option<f64> = None;
    let mut last_ts: Option<f64> = None;

    while let Some(record) = reader.next_record()? {
        first_ts.get_or_insert(record.timestamp);
        last_ts = Some(record.timestamp);
        if !record.camera.is_empty() {
            *per_camera.entry(record.camera.clone()).or_insert(0) += 1;
        }
        match &record.event {
            LogEvent::Detections(tags) => {
                detections += 1;
                if args.dump {
                    let ids: Vec<u8> = tags.iter().map(|t| t.id).collect();
                    println!(
                        "{:>12.3}  {:<12} detections {:?}",
                        record.timestamp, record.camera, ids
                    );
                }
            }
            LogEvent::Match(info) => {
                matches += 1;
                if args.dump {
                    println!(
                        "{:>12.3}  {:<12} match {} #{} type {} station {} {}",
                        record.timestamp,
                        "-",
                        info.event_name,
                        info.match_num,
                        info.match_type,
                        info.station_num,
                        if info.is_red { "red" } else { "blue" }
                    );
                }
            }
            LogEvent::Estimates(list) => {
                estimates += 1;
                if args.dump {
                    for (i, e) in list.iter().enumerate() {
                        println!(
                            "{:>12.3}  {:<12} estimate[{}] err {:.3} at ({:.2}, {:.2}, {:.2})",
                            record.timestamp,
                            record.camera,
                            i,
                            e.error,
                            e.translation[0],
                            e.translation[1],
                            e.translation[2]
                        );
                    }
                }
            }
        }
    }

    println!("file: {}", args.file.display());
    println!(
        "records: {} detections, {} estimates, {} match",
        detections, estimates, matches
    );
    for (camera, count) in &per_camera {
        println!("  {}: {} records", camera, count);
    }
    match (first_ts, last_ts) {
        (Some(first), Some(last)) => {
            println!("span: {:.3}s ({:.3} .. {:.3})", last - first, first, last)
        }
        _ => println!("span: empty"),
    }
    if reader.resyncs() > 0 {
        println!("WARNING: {} damaged spans skipped", reader.resyncs());
    }
    Ok(())
}
