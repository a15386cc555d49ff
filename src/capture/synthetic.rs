//! Synthetic camera for `stub://` ids.
//!
//! Generates a deterministic moving pattern derived from the stub seed, paced
//! at the requested frame rate. Used by tests and by deployments that bring
//! the pipeline up before real hardware is attached.

use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use crate::frame::pipeline_now;

#[derive(Debug)]
pub struct SyntheticCamera {
    seed: u64,
    width: u32,
    height: u32,
    frame_interval: Duration,
    next_frame_at: Instant,
    frame_count: u64,
}

impl SyntheticCamera {
    pub fn new(seed: &str, width: u32, height: u32, target_fps: f64) -> Self {
        let fps = if target_fps > 0.0 { target_fps } else { 50.0 };
        Self {
            seed: fold_seed(seed),
            width,
            height,
            frame_interval: Duration::from_secs_f64(1.0 / fps),
            next_frame_at: Instant::now(),
            frame_count: 0,
        }
    }

    /// Blocks until the next frame is due, then returns it with its capture
    /// timestamp on the pipeline clock.
    pub fn read(&mut self) -> (RgbImage, f64) {
        let now = Instant::now();
        if self.next_frame_at > now {
            std::thread::sleep(self.next_frame_at - now);
        }
        self.next_frame_at += self.frame_interval;
        // Do not accumulate lag when a reader falls behind.
        if self.next_frame_at < Instant::now() {
            self.next_frame_at = Instant::now() + self.frame_interval;
        }

        let timestamp = pipeline_now();
        self.frame_count += 1;
        let image = self.render();
        (image, timestamp)
    }

    fn render(&self) -> RgbImage {
        let mut image = RgbImage::new(self.width, self.height);
        let phase = self.frame_count.wrapping_mul(7).wrapping_add(self.seed);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let v = (x as u64)
                .wrapping_add((y as u64).wrapping_mul(3))
                .wrapping_add(phase);
            *pixel = Rgb([(v % 256) as u8, ((v >> 3) % 256) as u8, ((v >> 5) % 256) as u8]);
        }
        image
    }
}

fn fold_seed(seed: &str) -> u64 {
    seed.bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
            (acc ^ b as u64).wrapping_mul(0x100_0000_01b3)
        })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_match_the_requested_resolution() {
        let mut camera = SyntheticCamera::new("test", 32, 24, 500.0);
        let (image, timestamp) = camera.read();
        assert_eq!(image.dimensions(), (32, 24));
        assert!(timestamp >= 0.0);
    }

    #[test]
    fn timestamps_are_monotonic() {
        let mut camera = SyntheticCamera::new("test", 8, 8, 500.0);
        let (_, a) = camera.read();
        let (_, b) = camera.read();
        assert!(b > a);
    }

    #[test]
    fn different_seeds_produce_different_scenes() {
        let mut one = SyntheticCamera::new("one", 16, 16, 500.0);
        let mut two = SyntheticCamera::new("two", 16, 16, 500.0);
        let (a, _) = one.read();
        let (b, _) = two.read();
        assert_ne!(a.as_raw(), b.as_raw());
    }
}
