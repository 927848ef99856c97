//! Frame ingestion sources.
//!
//! This module provides different sources for frames of the staging area:
//! - USB/V4L2 cameras (feature: ingest-v4l2)
//! - Recorded stills replayed from a directory (`dir://<path>`)
//! - Synthetic staging scene (`stub://<name>`)
//! - Scripted in-memory frames (deterministic replay)
//!
//! Every source is opened with `connect`, read with `next_frame`, and closed
//! with `release`. A failed `next_frame` is final for the capture run; sources
//! do not retry internally.

pub mod directory;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod script;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};

use crate::frame::Frame;

pub use directory::DirectorySource;
pub use script::ScriptedSource;
pub use synthetic::{SyntheticConfig, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

/// Camera abstraction consumed by the capture state machine.
pub trait FrameSource: Send {
    /// Open the underlying device.
    fn connect(&mut self) -> Result<()>;

    /// Read the next frame. An error means the device is gone.
    fn next_frame(&mut self) -> Result<Frame>;

    /// Close the underlying device. Must be safe to call more than once.
    fn release(&mut self);

    /// What the source is and how many frames it delivered so far.
    fn stats(&self) -> SourceStats;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// Open a source from a camera URL.
///
/// - `stub://<name>`: synthetic staging scene
/// - `dir://<path>`: replay still images in file-name order
/// - anything else: a V4L2 device path (requires the ingest-v4l2 feature)
pub fn open_source(camera: &str, width: u32, height: u32) -> Result<Box<dyn FrameSource>> {
    let camera = camera.trim();
    if camera.is_empty() {
        return Err(anyhow!("camera must not be empty"));
    }
    if camera.starts_with("stub://") {
        let config = SyntheticConfig {
            name: camera.to_string(),
            width,
            height,
            ..SyntheticConfig::default()
        };
        return Ok(Box::new(SyntheticSource::new(config)));
    }
    if let Some(path) = camera.strip_prefix("dir://") {
        return Ok(Box::new(DirectorySource::new(path)));
    }
    #[cfg(feature = "ingest-v4l2")]
    {
        let config = V4l2Config {
            device: camera.to_string(),
            width,
            height,
            ..V4l2Config::default()
        };
        Ok(Box::new(V4l2Source::new(config)))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        Err(anyhow!(
            "camera '{}' requires the ingest-v4l2 feature (or use stub:// / dir://)",
            camera
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_stub_and_dir_sources() -> Result<()> {
        let stub = open_source("stub://staging", 32, 24)?;
        assert_eq!(stub.stats().source, "stub://staging");

        let dir = open_source("dir:///tmp/recording", 32, 24)?;
        assert_eq!(dir.stats().source, "/tmp/recording");
        Ok(())
    }

    #[test]
    fn rejects_empty_camera() {
        assert!(open_source("  ", 32, 24).is_err());
    }
}
