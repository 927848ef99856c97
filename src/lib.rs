//! Side Capture
//!
//! Multi-side object photography on a fixed staging area. An operator places an
//! object, the camera notices the hand moving in and out, waits for the scene
//! to settle and shoots the first side. The operator turns the object; once the
//! new side is stable and visibly different the next side is shot, and so on
//! until the object has `images_per_object` sides, which are then written to
//! the image directory.
//!
//! # Module Structure
//!
//! - `frame`: owned camera frames and JPEG encoding
//! - `ingest`: frame sources (V4L2 camera, recorded stills, synthetic scene)
//! - `detect`: motion and side-change detection
//! - `capture`: the capture state machine and its supervisor
//! - `session` / `sink`: per-object side accumulation and persistence
//! - `state`: capture status and the resume handshake
//! - `remote` / `display`: WebSocket link to the display and the display hub
//! - `input`: operator retake key
//! - `config`: daemon configuration (file, environment, validation)

pub mod capture;
pub mod clock;
pub mod config;
pub mod detect;
pub mod display;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod input;
pub mod notify;
pub mod remote;
pub mod session;
pub mod sink;
pub mod state;

pub use capture::{
    run_capture, CaptureEvent, CapturePhase, CaptureStateMachine, CaptureSupervisor, RunSummary,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CaptureConfig, DaemonConfig};
pub use detect::ChangeDetector;
pub use display::{DisplayConfig, DisplayHandle, DisplayServer, Hub};
pub use error::CaptureError;
pub use frame::{Frame, PixelLayout};
pub use ingest::{open_source, FrameSource, ScriptedSource, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use ingest::{V4l2Config, V4l2Source};
pub use input::{retake_mailbox, InputListener, KeySource, RetakeSender, ScriptedKeys};
pub use notify::{Notifier, SilentNotifier, TerminalBell};
pub use remote::{NullChannel, RemoteChannel, WireMessage, WsConfig, WsRemoteChannel};
pub use session::{CompletedObject, ObjectSession};
pub use sink::{prepare_output_dir, DirectorySink, FlushReceipt, ImageSink};
pub use state::{CaptureStatus, RemoteState, StatePatch, StatusHandle};
