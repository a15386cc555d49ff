//! MJPEG preview over plain HTTP.
//!
//! `FrameSink` holds the latest annotated frame per camera; the server
//! composes them into a mosaic on demand. `GET /` serves a minimal viewer
//! page and `GET /stream.mjpg` a `multipart/x-mixed-replace` stream capped
//! at 30 fps. The accept loop is non-blocking so shutdown is prompt; each
//! connection gets its own thread.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::annotate;

const MOSAIC_TILE_WIDTH: u32 = 640;
const STREAM_FRAME_INTERVAL: Duration = Duration::from_millis(33);
const JPEG_QUALITY: u8 = 75;

const INDEX_PAGE: &str = "<!DOCTYPE html>\
<html><head><title>tagtrack</title></head>\
<body style=\"background:#000;margin:0;display:flex;\
align-items:center;justify-content:center;height:100vh\">\
<img src=\"stream.mjpg\" style=\"max-width:100%;max-height:100%\">\
</body></html>";

/// Latest annotated frame per camera. Clones share the store.
#[derive(Clone, Default)]
pub struct FrameSink {
    frames: Arc<Mutex<BTreeMap<String, RgbImage>>>,
}

impl FrameSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, camera: &str, image: RgbImage) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(camera.to_string(), image);
    }

    /// Current mosaic, or `None` before any frame has arrived.
    pub fn mosaic(&self) -> Option<RgbImage> {
        let frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        if frames.is_empty() {
            return None;
        }
        let tiles: Vec<&RgbImage> = frames.values().collect();
        Some(compose_mosaic(&tiles))
    }
}

/// Scale every tile to a common width and lay them out in a near-square
/// grid. Row height follows the tallest tile in the row.
fn compose_mosaic(tiles: &[&RgbImage]) -> RgbImage {
    let scaled: Vec<RgbImage> = tiles
        .iter()
        .map(|tile| {
            if tile.width() == MOSAIC_TILE_WIDTH || tile.width() == 0 {
                (*tile).clone()
            } else {
                let height = (u64::from(tile.height()) * u64::from(MOSAIC_TILE_WIDTH)
                    / u64::from(tile.width()))
                .max(1) as u32;
                imageops::resize(*tile, MOSAIC_TILE_WIDTH, height, FilterType::Triangle)
            }
        })
        .collect();

    let columns = (scaled.len() as f64).sqrt().ceil() as usize;
    let mut canvas_height = 0u32;
    let mut row_tops = Vec::new();
    for row in scaled.chunks(columns) {
        row_tops.push(canvas_height);
        canvas_height += row.iter().map(RgbImage::height).max().unwrap_or(0);
    }
    let canvas_width = MOSAIC_TILE_WIDTH * columns.min(scaled.len()) as u32;

    let mut canvas = RgbImage::new(canvas_width.max(1), canvas_height.max(1));
    for (row_index, row) in scaled.chunks(columns).enumerate() {
        for (col, tile) in row.iter().enumerate() {
            imageops::replace(
                &mut canvas,
                tile,
                (col as u32 * MOSAIC_TILE_WIDTH).into(),
                row_tops[row_index].into(),
            );
        }
    }
    canvas
}

// ----------------------------------------------------------------------------
// HTTP server
// ----------------------------------------------------------------------------

pub struct StreamServer {
    port: u16,
    sink: FrameSink,
}

pub struct StreamHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("stream accept thread panicked");
            }
        }
    }
}

impl StreamServer {
    pub fn new(port: u16, sink: FrameSink) -> Self {
        Self { port, sink }
    }

    pub fn spawn(self) -> Result<StreamHandle> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .with_context(|| format!("bind stream port {}", self.port))?;
        listener
            .set_nonblocking(true)
            .context("set stream listener non-blocking")?;
        let addr = listener.local_addr().context("read stream listener addr")?;
        log::info!("preview stream on http://{}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);
        let sink = self.sink;
        let handle = std::thread::Builder::new()
            .name("stream-accept".to_string())
            .spawn(move || {
                while !accept_shutdown.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((socket, _)) => {
                            let sink = sink.clone();
                            let shutdown = Arc::clone(&accept_shutdown);
                            let spawned = std::thread::Builder::new()
                                .name("stream-conn".to_string())
                                .spawn(move || serve_connection(socket, sink, shutdown));
                            if let Err(e) = spawned {
                                log::warn!("stream connection thread failed to start: {}", e);
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(50));
                        }
                        Err(e) => {
                            log::warn!("stream accept failed: {}", e);
                            std::thread::sleep(Duration::from_millis(50));
                        }
                    }
                }
            })
            .context("spawn stream accept thread")?;

        Ok(StreamHandle {
            addr,
            shutdown,
            handle: Some(handle),
        })
    }
}

fn serve_connection(socket: TcpStream, sink: FrameSink, shutdown: Arc<AtomicBool>) {
    if let Err(e) = handle_request(socket, &sink, &shutdown) {
        log::debug!("stream connection ended: {}", e);
    }
}

fn handle_request(
    socket: TcpStream,
    sink: &FrameSink,
    shutdown: &AtomicBool,
) -> Result<()> {
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .context("set stream read timeout")?;
    let mut reader = BufReader::new(socket.try_clone().context("clone stream socket")?);
    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .context("read request line")?;
    // Drain headers; we only route on the request line.
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).context("read header")? == 0 || line.trim().is_empty() {
            break;
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");
    let mut socket = socket;
    match (method, path) {
        ("GET", "/") => {
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                INDEX_PAGE.len(),
                INDEX_PAGE
            );
            socket.write_all(response.as_bytes())?;
        }
        ("GET", "/stream.mjpg") => stream_mjpeg(&mut socket, sink, shutdown)?,
        ("GET", _) => {
            socket.write_all(
                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            )?;
        }
        _ => {
            socket.write_all(
                b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            )?;
        }
    }
    Ok(())
}

fn stream_mjpeg(socket: &mut TcpStream, sink: &FrameSink, shutdown: &AtomicBool) -> Result<()> {
    socket.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=FRAME\r\nConnection: close\r\n\r\n",
    )?;
    let mut last_part: Option<Instant> = None;
    while !shutdown.load(Ordering::SeqCst) {
        let Some(mosaic) = sink.mosaic() else {
            std::thread::sleep(Duration::from_millis(100));
            continue;
        };
        if let Some(at) = last_part {
            let elapsed = at.elapsed();
            if elapsed < STREAM_FRAME_INTERVAL {
                std::thread::sleep(STREAM_FRAME_INTERVAL - elapsed);
            }
        }
        last_part = Some(Instant::now());

        let jpeg = annotate::encode_jpeg(&mosaic, JPEG_QUALITY)?;
        let header = format!(
            "--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            jpeg.len()
        );
        // Disconnects are routine; report them quietly upward.
        socket.write_all(header.as_bytes())?;
        socket.write_all(&jpeg)?;
        socket.write_all(b"\r\n")?;
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
