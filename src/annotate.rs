//! Overlay drawing on owned frame buffers.
//!
//! Workers stamp per-frame diagnostics (camera, fps, stage timings, pose
//! summary, marker outlines); the dispatcher adds queue depth and frame age.
//! Text uses a built-in 5x7 bitmap font so no font assets ship with the
//! daemon.

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use crate::detect::TagObservation;
use crate::frame::ProcessTimings;
use crate::solve::EstimatePair;

const GLYPH_WIDTH: i32 = 6;
const GLYPH_HEIGHT: i32 = 8;
const TEXT: Rgb<u8> = Rgb([255, 255, 255]);
const BACKDROP: Rgb<u8> = Rgb([0, 0, 0]);
const MARKER: Rgb<u8> = Rgb([0, 255, 0]);

/// Worker-stage overlay: marker outlines plus the header diagnostics block.
pub fn worker_overlay(
    image: &mut RgbImage,
    camera: &str,
    rate: f64,
    timings: &ProcessTimings,
    detections: &[TagObservation],
    estimates: Option<&EstimatePair>,
) {
    for detection in detections {
        draw_polygon(image, &detection.corners, MARKER);
        let [x, y] = detection.corners[0];
        draw_line_with_backdrop(
            image,
            x.round() as i32,
            y.round() as i32 - GLYPH_HEIGHT,
            &format!("{}", detection.id),
        );
    }

    let mut lines = vec![
        format!("{} FPS {:.0}", camera, rate),
        format!(
            "DET {:.1}MS SOLVE {:.1}MS",
            timings.detect_seconds * 1000.0,
            timings.solve_seconds * 1000.0
        ),
    ];
    if let Some(pair) = estimates {
        let t = pair.pose_a.pose.translation.vector;
        lines.push(format!(
            "POSE {:.2} {:.2} {:.2} ERR {:.2}",
            t.x, t.y, t.z, pair.pose_a.reprojection_error
        ));
        if let Some(b) = &pair.pose_b {
            lines.push(format!("ALT ERR {:.2}", b.reprojection_error));
        }
    }
    for (i, line) in lines.iter().enumerate() {
        draw_line_with_backdrop(image, 2, 2 + i as i32 * GLYPH_HEIGHT, line);
    }
}

/// Dispatcher-stage overlay: result-queue depth and frame age, bottom-left.
pub fn dispatch_overlay(image: &mut RgbImage, queue_depth: usize, age_seconds: f64) {
    let line = format!("QUEUE {} AGE {:.0}MS", queue_depth, age_seconds * 1000.0);
    let y = image.height() as i32 - GLYPH_HEIGHT - 2;
    draw_line_with_backdrop(image, 2, y, &line);
}

/// Encode an RGB buffer as JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality)
        .encode_image(image)
        .map_err(|e| anyhow!("jpeg encode failed: {}", e))?;
    Ok(bytes)
}

fn draw_line_with_backdrop(image: &mut RgbImage, x: i32, y: i32, text: &str) {
    let width = text.chars().count() as i32 * GLYPH_WIDTH + 2;
    fill_rect(image, x - 1, y - 1, x + width, y + GLYPH_HEIGHT - 1, BACKDROP);
    draw_text(image, x, y, text, TEXT);
}

pub fn draw_text(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        put_pixel(image, x + col, y + row as i32, color);
                    }
                }
            }
        }
        x += GLYPH_WIDTH;
    }
}

pub fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    for y in top..=bottom {
        for x in left..=right {
            put_pixel(image, x, y, color);
        }
    }
}

/// Closed polygon through the corner points.
pub fn draw_polygon(image: &mut RgbImage, corners: &[[f64; 2]; 4], color: Rgb<u8>) {
    for i in 0..4 {
        let [x0, y0] = corners[i];
        let [x1, y1] = corners[(i + 1) % 4];
        draw_segment(
            image,
            x0.round() as i32,
            y0.round() as i32,
            x1.round() as i32,
            y1.round() as i32,
            color,
        );
    }
}

fn draw_segment(image: &mut RgbImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgb<u8>) {
    let steps = (x1 - x0).abs().max((y1 - y0).abs()).max(1);
    for step in 0..=steps {
        let t = step as f64 / steps as f64;
        let x = x0 as f64 + (x1 - x0) as f64 * t;
        let y = y0 as f64 + (y1 - y0) as f64 * t;
        put_pixel(image, x.round() as i32, y.round() as i32, color);
    }
}

fn put_pixel(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        *image.get_pixel_mut(x as u32, y as u32) = color;
    }
}

#[rustfmt::skip]
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'A' => Some([0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
        'B' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110]),
        'C' => Some([0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110]),
        'D' => Some([0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110]),
        'E' => Some([0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111]),
        'F' => Some([0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000]),
        'G' => Some([0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111]),
        'H' => Some([0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
        'I' => Some([0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        'J' => Some([0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100]),
        'K' => Some([0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001]),
        'L' => Some([0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111]),
        'M' => Some([0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001]),
        'N' => Some([0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001]),
        'O' => Some([0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
        'P' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000]),
        'Q' => Some([0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101]),
        'R' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001]),
        'S' => Some([0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110]),
        'T' => Some([0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100]),
        'U' => Some([0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
        'V' => Some([0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100]),
        'W' => Some([0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b11011, 0b10001]),
        'X' => Some([0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001]),
        'Y' => Some([0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100]),
        'Z' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111]),
        '0' => Some([0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110]),
        '1' => Some([0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        '2' => Some([0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111]),
        '3' => Some([0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110]),
        '4' => Some([0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010]),
        '5' => Some([0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110]),
        '6' => Some([0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110]),
        '7' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000]),
        '8' => Some([0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110]),
        '9' => Some([0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100]),
        '.' => Some([0, 0, 0, 0, 0, 0b00110, 0b00110]),
        '-' => Some([0, 0, 0, 0b01110, 0, 0, 0]),
        ':' => Some([0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0]),
        '/' => Some([0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000]),
        '_' => Some([0, 0, 0, 0, 0, 0, 0b11111]),
        ' ' => Some([0, 0, 0, 0, 0, 0, 0]),
        _ => None,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glyphs_cover_the_overlay_alphabet() {
        for ch in "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789.-:/_ ".chars() {
            assert!(glyph_bits(ch).is_some(), "missing glyph for {ch:?}");
        }
    }

    #[test]
    fn drawing_clips_at_image_edges() {
        let mut image = RgbImage::new(16, 16);
        draw_text(&mut image, -5, -5, "EDGE", TEXT);
        draw_text(&mut image, 14, 14, "EDGE", TEXT);
        fill_rect(&mut image, -10, -10, 100, 100, Rgb([9, 9, 9]));
        draw_polygon(
            &mut image,
            &[[-4.0, -4.0], [40.0, -4.0], [40.0, 40.0], [-4.0, 40.0]],
            MARKER,
        );
    }

    #[test]
    fn text_marks_pixels() {
        let mut image = RgbImage::new(32, 16);
        draw_text(&mut image, 1, 1, "A", TEXT);
        let lit = image.pixels().filter(|p| p.0 == [255, 255, 255]).count();
        assert!(lit > 0);
    }

    #[test]
    fn jpeg_encoding_emits_magic_bytes() {
        let image = RgbImage::new(8, 8);
        let bytes = encode_jpeg(&image, 80).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
