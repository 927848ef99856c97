//! Display wire protocol.
//!
//! Every WebSocket text message is one JSON envelope
//! `{"event": "<name>", "data": <payload>}`:
//!
//! | event | direction | data |
//! |---|---|---|
//! | `update_state` | capture -> display, hub -> all | `{object_id, image_number, status}` |
//! | `live_frame` | capture -> display | base64 JPEG |
//! | `capture_frame` | capture -> display | base64 JPEG |
//! | `set_state` | display -> hub | partial state patch |
//! | `resume_capture` | display -> hub / capture | none |
//! | `debug_message` | hub -> connecting display | `{message, type}` |
//!
//! The capture loop connects with `?role=capture`; every other WebSocket
//! client is a display.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CaptureError;
use crate::state::RemoteState;

/// Query parameter a WebSocket client announces its role with.
pub const ROLE_PARAM: &str = "role";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientRole {
    /// The capture loop. Only it may publish `update_state` and previews.
    Capture,
    Display,
}

impl ClientRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Display => "display",
        }
    }

    /// Anything but an explicit `capture` is a display.
    pub fn from_param(value: Option<&str>) -> Self {
        match value {
            Some(v) if v == Self::Capture.as_str() => Self::Capture,
            _ => Self::Display,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Start-up progress shown on a display's debug panel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugNotice {
    pub message: String,
    #[serde(rename = "type")]
    pub level: NoticeLevel,
}

impl DebugNotice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: NoticeLevel::Info,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: NoticeLevel::Error,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum WireMessage {
    UpdateState(RemoteState),
    LiveFrame(String),
    CaptureFrame(String),
    SetState(Value),
    ResumeCapture,
    DebugMessage(DebugNotice),
}

impl WireMessage {
    pub fn encode(&self) -> Result<String, CaptureError> {
        serde_json::to_string(self)
            .map_err(|e| CaptureError::transport(format!("encode {}: {}", self.name(), e)))
    }

    pub fn decode(text: &str) -> Result<Self, CaptureError> {
        serde_json::from_str(text)
            .map_err(|e| CaptureError::validation(format!("malformed message: {e}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::UpdateState(_) => "update_state",
            Self::LiveFrame(_) => "live_frame",
            Self::CaptureFrame(_) => "capture_frame",
            Self::SetState(_) => "set_state",
            Self::ResumeCapture => "resume_capture",
            Self::DebugMessage(_) => "debug_message",
        }
    }

    /// Preview payloads are relayed verbatim and never inspected by the hub.
    pub fn is_preview(&self) -> bool {
        matches!(self, Self::LiveFrame(_) | Self::CaptureFrame(_))
    }
}
