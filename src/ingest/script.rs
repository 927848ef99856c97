//! Scripted frame source.
//!
//! Plays back a fixed list of frames. Used to replay a recorded sequence
//! through the state machine deterministically.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

pub struct ScriptedSource {
    name: String,
    frames: VecDeque<Frame>,
    hold_last: bool,
    last: Option<Frame>,
    frames_captured: u64,
    connected: bool,
    released: bool,
}

impl ScriptedSource {
    pub fn new(name: impl Into<String>, frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            name: name.into(),
            frames: frames.into_iter().collect(),
            hold_last: false,
            last: None,
            frames_captured: 0,
            connected: false,
            released: false,
        }
    }

    /// Keep returning the final frame once the script is exhausted, like a
    /// camera pointed at a scene that no longer changes.
    pub fn hold_last(mut self) -> Self {
        self.hold_last = true;
        self
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl FrameSource for ScriptedSource {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        self.released = false;
        log::info!("ScriptedSource: connected to {}", self.name);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("scripted source {} not connected", self.name));
        }
        let frame = match self.frames.pop_front() {
            Some(frame) => frame,
            None if self.hold_last => self
                .last
                .clone()
                .ok_or_else(|| anyhow!("scripted source {} is empty", self.name))?,
            None => return Err(anyhow!("scripted source {} exhausted", self.name)),
        };
        self.frames_captured += 1;
        self.last = Some(frame.clone());
        Ok(frame)
    }

    fn release(&mut self) {
        if self.connected {
            log::info!("ScriptedSource: released {}", self.name);
        }
        self.connected = false;
        self.released = true;
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            source: self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: u8) -> Frame {
        Frame::gray(vec![value; 4], 2, 2).unwrap()
    }

    #[test]
    fn plays_frames_in_order_then_fails() -> Result<()> {
        let mut source = ScriptedSource::new("script", [frame(1), frame(2)]);
        assert!(source.next_frame().is_err(), "must connect first");
        source.connect()?;
        assert_eq!(source.next_frame()?.pixels()[0], 1);
        assert_eq!(source.next_frame()?.pixels()[0], 2);
        assert!(source.next_frame().is_err());
        assert_eq!(source.stats().frames_captured, 2);
        Ok(())
    }

    #[test]
    fn hold_last_repeats_final_frame() -> Result<()> {
        let mut source = ScriptedSource::new("script", [frame(9)]).hold_last();
        source.connect()?;
        for _ in 0..3 {
            assert_eq!(source.next_frame()?.pixels()[0], 9);
        }
        source.release();
        assert!(source.is_released());
        Ok(())
    }
}
