//! Persistence of accepted sides.
//!
//! One JPEG per side, named `object<id>_side<n>_<unix-seconds>.jpg`, written in
//! side order. The output directory must exist unless the run was started in
//! clear-and-recreate mode.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::frame::DEFAULT_JPEG_QUALITY;
use crate::session::ObjectSession;

/// Files written for one object, in side order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReceipt {
    pub object_id: u64,
    pub paths: Vec<PathBuf>,
}

pub trait ImageSink: Send {
    /// Persist every accepted side of `session`.
    fn flush(&mut self, session: &ObjectSession) -> Result<FlushReceipt>;

    /// Withdraw a previously flushed object (full-object retake).
    fn retract(&mut self, receipt: &FlushReceipt) -> Result<()>;
}

/// Clear-and-recreate (`clear == true`, destructive: every file in `dir` is
/// deleted) or require the directory to exist.
pub fn prepare_output_dir(dir: &Path, clear: bool) -> Result<()> {
    if clear {
        if dir.exists() {
            fs::remove_dir_all(dir)
                .with_context(|| format!("clear output directory {}", dir.display()))?;
        }
        fs::create_dir_all(dir)
            .with_context(|| format!("create output directory {}", dir.display()))?;
        log::warn!("cleared and recreated {}", dir.display());
        return Ok(());
    }
    if !dir.is_dir() {
        return Err(anyhow!(
            "output directory {} does not exist (enable clear_output_dir to create it)",
            dir.display()
        ));
    }
    Ok(())
}

pub struct DirectorySink {
    root: PathBuf,
    quality: u8,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn side_path(&self, object_id: u64, side: usize, timestamp: u64) -> PathBuf {
        self.root
            .join(format!("object{object_id}_side{side}_{timestamp}.jpg"))
    }

    /// Write every side or none: files written before a failure are removed.
    fn write_object(&self, session: &ObjectSession, timestamp: u64) -> Result<FlushReceipt> {
        let mut receipt = FlushReceipt {
            object_id: session.object_id(),
            paths: Vec::with_capacity(session.len()),
        };
        for (i, side) in session.accepted_sides().iter().enumerate() {
            let path = self.side_path(session.object_id(), i + 1, timestamp);
            let written = side
                .to_jpeg(self.quality)
                .and_then(|jpeg| {
                    fs::write(&path, jpeg).with_context(|| format!("write {}", path.display()))
                });
            if let Err(err) = written {
                remove_partial(&receipt.paths);
                return Err(err.context(format!("save object {}", session.object_id())));
            }
            receipt.paths.push(path);
        }
        Ok(receipt)
    }
}

fn remove_partial(paths: &[PathBuf]) {
    for path in paths {
        if let Err(err) = fs::remove_file(path) {
            log::warn!("could not remove partial side {}: {}", path.display(), err);
        }
    }
}

impl ImageSink for DirectorySink {
    fn flush(&mut self, session: &ObjectSession) -> Result<FlushReceipt> {
        if !self.root.is_dir() {
            return Err(anyhow!(
                "output directory {} does not exist",
                self.root.display()
            ));
        }
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let receipt = self.write_object(session, timestamp)?;
        log::info!(
            "object {} saved: {} sides in {}",
            receipt.object_id,
            receipt.paths.len(),
            self.root.display()
        );
        Ok(receipt)
    }

    fn retract(&mut self, receipt: &FlushReceipt) -> Result<()> {
        for path in &receipt.paths {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(anyhow::Error::new(err).context(format!("remove {}", path.display())))
                }
            }
        }
        log::info!("object {} withdrawn", receipt.object_id);
        Ok(())
    }
}
