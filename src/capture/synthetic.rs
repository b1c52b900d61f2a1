use std::time::{Duration, Instant};

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::ResourceError;

use super::{CapturedImage, FrameSource};

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Camera index; seeds the noise so two "cameras" differ.
    pub camera: u32,
    pub width: u16,
    pub height: u16,
    /// Pace frames to this rate. 0 means as fast as requested.
    pub target_fps: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            camera: 0,
            width: 640,
            height: 480,
            target_fps: 30,
        }
    }
}

/// Generated RGB8 frames: a drifting gradient with a little noise.
pub struct SyntheticSource {
    config: SyntheticConfig,
    rng: StdRng,
    frame_count: u64,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(u64::from(config.camera)),
            config,
            frame_count: 0,
            next_due: None,
        }
    }

    fn frame_interval(&self) -> Option<Duration> {
        (self.config.target_fps > 0)
            .then(|| Duration::from_secs_f64(1.0 / f64::from(self.config.target_fps)))
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let shift = self.frame_count as usize;
        let mut pixels = vec![0u8; width * height * 3];
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let (x, y) = (i % width, i / width);
            px[0] = ((x + shift) % 256) as u8;
            px[1] = (y % 256) as u8;
            px[2] = self.rng.gen_range(0..16);
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!(
            "synthetic camera {} ({}x{})",
            self.config.camera, self.config.width, self.config.height
        )
    }

    fn open(&mut self) -> Result<(), ResourceError> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(ResourceError::Capture {
                device: self.describe(),
                reason: "frame dimensions must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    fn next_image(&mut self) -> Result<CapturedImage> {
        if let Some(interval) = self.frame_interval() {
            let now = Instant::now();
            let due = self.next_due.unwrap_or(now);
            if due > now {
                std::thread::sleep(due - now);
            }
            self.next_due = Some(due.max(now) + interval);
        }
        self.frame_count += 1;
        let bytes = self.generate_pixels();
        Ok(CapturedImage {
            width: self.config.width,
            height: self.config.height,
            bytes,
        })
    }
}
