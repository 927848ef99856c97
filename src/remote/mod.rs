//! Best-effort link from the capture loop to the display.
//!
//! Publishing never fails the capture: callers log a `Transport` error and
//! carry on.

pub mod protocol;
pub mod ws;

use crate::error::CaptureError;
use crate::frame::Frame;
use crate::state::{RemoteState, StatusHandle};

pub use protocol::{ClientRole, DebugNotice, NoticeLevel, WireMessage};
pub use ws::{WsConfig, WsRemoteChannel};

pub trait RemoteChannel: Send {
    fn publish_state(&mut self, state: &RemoteState) -> Result<(), CaptureError>;

    /// Low-rate live preview.
    fn publish_live(&mut self, frame: &Frame) -> Result<(), CaptureError>;

    /// Preview of a just-accepted side.
    fn publish_captured(&mut self, frame: &Frame) -> Result<(), CaptureError>;

    fn is_connected(&self) -> bool;

    fn close(&mut self) {}
}

/// Channel used when no display is reachable.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullChannel;

impl RemoteChannel for NullChannel {
    fn publish_state(&mut self, _state: &RemoteState) -> Result<(), CaptureError> {
        Ok(())
    }

    fn publish_live(&mut self, _frame: &Frame) -> Result<(), CaptureError> {
        Ok(())
    }

    fn publish_captured(&mut self, _frame: &Frame) -> Result<(), CaptureError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        false
    }
}

/// Connect to the display, falling back to `NullChannel` when it is
/// unreachable.
pub fn open_channel(config: &WsConfig, status: StatusHandle) -> Box<dyn RemoteChannel> {
    match WsRemoteChannel::connect(config, status) {
        Ok(channel) => Box::new(channel),
        Err(err) => {
            log::warn!(
                "display at {} unavailable, continuing without it: {:#}",
                config.url,
                err
            );
            Box::new(NullChannel)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::status_cell;
    use std::time::Duration;

    #[test]
    fn unreachable_display_falls_back_to_null_channel() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (_owner, handle) = status_cell(RemoteState::default());
        let cfg = WsConfig {
            url: format!("ws://{addr}/ws"),
            connect_timeout: Duration::from_millis(200),
            ..WsConfig::default()
        };
        let mut channel = open_channel(&cfg, handle);
        assert!(!channel.is_connected());
        assert!(channel.publish_state(&RemoteState::default()).is_ok());
    }
}
