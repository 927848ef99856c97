//! Recorded stills source (`dir://<path>`).
//!
//! Replays JPEG/PNG files from a local directory in file-name order. The end
//! of the recording behaves like an unplugged camera: `next_frame` fails.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

const EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub struct DirectorySource {
    root: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    frames_captured: u64,
    connected: bool,
}

impl DirectorySource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            files: Vec::new(),
            cursor: 0,
            frames_captured: 0,
            connected: false,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for DirectorySource {
    fn connect(&mut self) -> Result<()> {
        let entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("read recording directory {}", self.root.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_image(&path) {
                files.push(path);
            }
        }
        files.sort();
        if files.is_empty() {
            return Err(anyhow!(
                "recording directory {} contains no images",
                self.root.display()
            ));
        }
        log::info!(
            "DirectorySource: connected to {} ({} frames)",
            self.root.display(),
            files.len()
        );
        self.files = files;
        self.cursor = 0;
        self.connected = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("recording {} not connected", self.root.display()));
        }
        let path = self
            .files
            .get(self.cursor)
            .ok_or_else(|| anyhow!("recording {} exhausted", self.root.display()))?
            .clone();
        self.cursor += 1;

        let decoded = image::open(&path)
            .with_context(|| format!("decode {}", path.display()))?
            .to_rgb8();
        let (width, height) = decoded.dimensions();
        self.frames_captured += 1;
        Frame::rgb(decoded.into_raw(), width, height)
    }

    fn release(&mut self) {
        if self.connected {
            log::info!("DirectorySource: released {}", self.root.display());
        }
        self.connected = false;
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            source: self.root.display().to_string(),
        }
    }
}
