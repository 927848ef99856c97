//! Capture cue. Best effort: failures are logged by the caller and ignored.

use anyhow::Result;
use std::io::Write;

pub trait Notifier: Send {
    fn cue(&mut self) -> Result<()>;
}

/// Rings the terminal bell on stderr.
#[derive(Clone, Copy, Debug, Default)]
pub struct TerminalBell;

impl Notifier for TerminalBell {
    fn cue(&mut self) -> Result<()> {
        let mut stderr = std::io::stderr().lock();
        stderr.write_all(b"\x07")?;
        stderr.flush()?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn cue(&mut self) -> Result<()> {
        Ok(())
    }
}
