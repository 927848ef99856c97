//! Synthetic staging scene (`stub://`).
//!
//! Renders a staging area without a camera: an empty backdrop, a "hand"
//! placing an object, the object's first side, a hand turning it, the second
//! side, and the hand removing it. The cycle repeats forever, with mild sensor
//! noise on every frame.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

/// Configuration for a synthetic source.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Frames each scene phase lasts.
    pub phase_frames: u64,
    /// Peak sensor noise added to each channel.
    pub noise: u8,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub://staging".to_string(),
            width: 320,
            height: 240,
            phase_frames: 12,
            noise: 2,
            seed: 0x5eed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scene {
    Empty,
    Hand,
    Side(u8),
}

// One full object cycle.
const SCRIPT: [Scene; 7] = [
    Scene::Empty,
    Scene::Hand,
    Scene::Side(0),
    Scene::Hand,
    Scene::Side(1),
    Scene::Hand,
    Scene::Empty,
];

pub struct SyntheticSource {
    config: SyntheticConfig,
    rng: StdRng,
    frame_count: u64,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            frame_count: 0,
            connected: false,
        }
    }

    fn scene_at(&self, frame_count: u64) -> Scene {
        let phase = (frame_count / self.config.phase_frames.max(1)) as usize;
        SCRIPT[phase % SCRIPT.len()]
    }

    fn render(&mut self, scene: Scene) -> Vec<u8> {
        let w = self.config.width as usize;
        let h = self.config.height as usize;
        let mut pixels = vec![0u8; w * h * 3];

        // Backdrop: soft vertical gradient.
        for y in 0..h {
            let shade = 60 + (y * 40 / h.max(1)) as u8;
            for x in 0..w {
                let offset = (y * w + x) * 3;
                pixels[offset] = shade;
                pixels[offset + 1] = shade;
                pixels[offset + 2] = shade.saturating_add(10);
            }
        }

        let (ox, oy, ow, oh) = (w / 4, h / 4, w / 2, h / 2);
        match scene {
            Scene::Empty => {}
            Scene::Side(side) => {
                for y in oy..oy + oh {
                    for x in ox..ox + ow {
                        let offset = (y * w + x) * 3;
                        let value = side_texture(side, x - ox, y - oy);
                        pixels[offset] = value;
                        pixels[offset + 1] = value / 2;
                        pixels[offset + 2] = 255 - value;
                    }
                }
            }
            Scene::Hand => {
                let hx = self.rng.gen_range(0..w.saturating_sub(w / 3).max(1));
                let hy = self.rng.gen_range(0..h.saturating_sub(h / 3).max(1));
                for y in hy..(hy + h / 3).min(h) {
                    for x in hx..(hx + w / 3).min(w) {
                        let offset = (y * w + x) * 3;
                        pixels[offset] = 210;
                        pixels[offset + 1] = 160;
                        pixels[offset + 2] = 130;
                    }
                }
            }
        }

        if self.config.noise > 0 {
            let noise = self.config.noise as i16;
            for pixel in pixels.iter_mut() {
                let delta = self.rng.gen_range(-noise..=noise);
                *pixel = (*pixel as i16 + delta).clamp(0, 255) as u8;
            }
        }
        pixels
    }
}

fn side_texture(side: u8, x: usize, y: usize) -> u8 {
    match side % 2 {
        0 => {
            if (x / 8 + y / 8) % 2 == 0 {
                230
            } else {
                30
            }
        }
        _ => ((x * 255 / 32 + y * 3) % 256) as u8,
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!(
            "SyntheticSource: connected to {} ({}x{})",
            self.config.name,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            anyhow::bail!("synthetic source {} not connected", self.config.name);
        }
        let scene = self.scene_at(self.frame_count);
        self.frame_count += 1;
        let pixels = self.render(scene);
        Frame::rgb(pixels, self.config.width, self.config.height)
    }

    fn release(&mut self) {
        if self.connected {
            log::info!("SyntheticSource: released {}", self.config.name);
        }
        self.connected = false;
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyntheticConfig {
        SyntheticConfig {
            width: 64,
            height: 48,
            phase_frames: 2,
            ..SyntheticConfig::default()
        }
    }

    #[test]
    fn synthetic_source_produces_frames() -> Result<()> {
        let mut source = SyntheticSource::new(config());
        source.connect()?;
        let frame = source.next_frame()?;
        assert_eq!((frame.width, frame.height), (64, 48));
        assert_eq!(frame.pixels().len(), 64 * 48 * 3);
        Ok(())
    }

    #[test]
    fn scene_cycles_through_object_sides() {
        let source = SyntheticSource::new(config());
        let scenes: Vec<Scene> = (0..14).step_by(2).map(|i| source.scene_at(i)).collect();
        assert_eq!(scenes, SCRIPT.to_vec());
        assert_eq!(source.scene_at(14), Scene::Empty);
    }

    #[test]
    fn released_source_stops_producing() -> Result<()> {
        let mut source = SyntheticSource::new(config());
        source.connect()?;
        source.release();
        assert!(source.next_frame().is_err());
        Ok(())
    }
}
