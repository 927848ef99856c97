//! Capture status and its remote projection.
//!
//! The capture loop is the only writer of `RemoteState`. Everything else holds
//! a `StatusHandle`, which can read a snapshot and make exactly one change:
//! `waiting -> ready` (resume). A granted resume posts a token on a
//! single-slot channel that the loop blocks on while escalated, so one resume
//! satisfies exactly one wait.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::CaptureError;

/// Keys accepted in an external state patch.
pub const PATCH_KEYS: [&str; 3] = ["object_id", "image_number", "status"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    Ready,
    Capturing,
    Waiting,
    Processing,
    Error,
}

impl CaptureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Capturing => "capturing",
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ready" => Some(Self::Ready),
            "capturing" => Some(Self::Capturing),
            "waiting" => Some(Self::Waiting),
            "processing" => Some(Self::Processing),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether an external patch may set this status. `waiting` is entered
    /// only by the capture loop's inactivity escalation.
    pub fn is_patchable(self) -> bool {
        !matches!(self, Self::Waiting)
    }
}

impl std::fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible projection of the capture run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteState {
    pub object_id: u64,
    pub image_number: u32,
    pub status: CaptureStatus,
}

impl Default for RemoteState {
    fn default() -> Self {
        Self {
            object_id: 0,
            image_number: 0,
            status: CaptureStatus::Ready,
        }
    }
}

/// Validated partial update from an operator (HTTP or display client).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatePatch {
    pub object_id: Option<u64>,
    pub image_number: Option<u32>,
    pub status: Option<CaptureStatus>,
}

impl StatePatch {
    /// Validate a JSON patch. Nothing is applied when this fails.
    pub fn from_json(value: &Value) -> Result<Self, CaptureError> {
        let map = value
            .as_object()
            .ok_or_else(|| CaptureError::validation("state patch must be a JSON object"))?;
        if map.keys().any(|key| !PATCH_KEYS.contains(&key.as_str())) {
            return Err(CaptureError::validation("Invalid state keys"));
        }

        let mut patch = StatePatch::default();
        if let Some(object_id) = map.get("object_id") {
            patch.object_id = Some(
                object_id
                    .as_u64()
                    .ok_or_else(|| CaptureError::validation("Invalid object_id"))?,
            );
        }
        if let Some(image_number) = map.get("image_number") {
            let value = image_number
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| CaptureError::validation("Invalid image_number"))?;
            patch.image_number = Some(value);
        }
        if let Some(status) = map.get("status") {
            let parsed = status
                .as_str()
                .and_then(CaptureStatus::parse)
                .filter(|s| s.is_patchable())
                .ok_or_else(|| CaptureError::validation("Invalid status"))?;
            patch.status = Some(parsed);
        }
        Ok(patch)
    }

    pub fn apply(&self, state: &mut RemoteState) {
        if let Some(object_id) = self.object_id {
            state.object_id = object_id;
        }
        if let Some(image_number) = self.image_number {
            state.image_number = image_number;
        }
        if let Some(status) = self.status {
            state.status = status;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.object_id.is_none() && self.image_number.is_none() && self.status.is_none()
    }
}

/// Token posted when a resume is granted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumeRequested;

/// Outcome of blocking on a resume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeWait {
    Resumed,
    Cancelled,
}

struct StatusCell {
    state: Mutex<RemoteState>,
    resume_tx: SyncSender<ResumeRequested>,
}

impl StatusCell {
    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Writer side, owned by the capture loop.
pub struct StatusOwner {
    cell: Arc<StatusCell>,
    resume_rx: Receiver<ResumeRequested>,
}

/// Reader side with the single permitted external transition.
#[derive(Clone)]
pub struct StatusHandle {
    cell: Arc<StatusCell>,
}

pub fn status_cell(initial: RemoteState) -> (StatusOwner, StatusHandle) {
    let (resume_tx, resume_rx) = mpsc::sync_channel(1);
    let cell = Arc::new(StatusCell {
        state: Mutex::new(initial),
        resume_tx,
    });
    (
        StatusOwner {
            cell: cell.clone(),
            resume_rx,
        },
        StatusHandle { cell },
    )
}

impl StatusOwner {
    pub fn snapshot(&self) -> RemoteState {
        *self.cell.lock()
    }

    pub fn update(&self, f: impl FnOnce(&mut RemoteState)) -> RemoteState {
        let mut state = self.cell.lock();
        f(&mut state);
        *state
    }

    pub fn handle(&self) -> StatusHandle {
        StatusHandle {
            cell: self.cell.clone(),
        }
    }

    /// Block until a resume is granted or `shutdown` is raised.
    ///
    /// This is a blocking receive, woken immediately by a resume; `poll` only
    /// bounds how late a shutdown is noticed. The token is consumed, so the
    /// next wait needs a fresh resume.
    pub fn wait_for_resume(&self, poll: Duration, shutdown: &AtomicBool) -> ResumeWait {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return ResumeWait::Cancelled;
            }
            match self.resume_rx.recv_timeout(poll) {
                Ok(ResumeRequested) => return ResumeWait::Resumed,
                Err(RecvTimeoutError::Timeout) => continue,
                // Unreachable while `self` holds the cell, kept for completeness.
                Err(RecvTimeoutError::Disconnected) => return ResumeWait::Cancelled,
            }
        }
    }
}

impl StatusHandle {
    pub fn snapshot(&self) -> RemoteState {
        *self.cell.lock()
    }

    /// Grant a resume if the loop is escalated. Returns false (no-op) in any
    /// other status.
    pub fn request_resume(&self) -> bool {
        let mut state = self.cell.lock();
        if state.status != CaptureStatus::Waiting {
            return false;
        }
        state.status = CaptureStatus::Ready;
        match self.cell.resume_tx.try_send(ResumeRequested) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_serializes_lowercase() {
        let state = RemoteState {
            object_id: 3,
            image_number: 1,
            status: CaptureStatus::Capturing,
        };
        assert_eq!(
            serde_json::to_value(state).unwrap(),
            json!({"object_id": 3, "image_number": 1, "status": "capturing"})
        );
    }

    #[test]
    fn patch_rejects_unknown_keys_and_bad_status() {
        let err = StatePatch::from_json(&json!({"object_id": 1, "colour": "red"})).unwrap_err();
        assert_eq!(err, CaptureError::validation("Invalid state keys"));

        let err = StatePatch::from_json(&json!({"status": "bogus"})).unwrap_err();
        assert_eq!(err, CaptureError::validation("Invalid status"));

        // Waiting is entered by the capture loop only.
        assert!(StatePatch::from_json(&json!({"status": "waiting"})).is_err());
        assert!(StatePatch::from_json(&json!({"object_id": -1})).is_err());
        assert!(StatePatch::from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn patch_applies_only_present_fields() {
        let patch = StatePatch::from_json(&json!({"status": "processing"})).unwrap();
        let mut state = RemoteState {
            object_id: 4,
            image_number: 2,
            status: CaptureStatus::Ready,
        };
        patch.apply(&mut state);
        assert_eq!(state.object_id, 4);
        assert_eq!(state.image_number, 2);
        assert_eq!(state.status, CaptureStatus::Processing);
        assert!(StatePatch::from_json(&json!({})).unwrap().is_empty());
    }

    #[test]
    fn resume_only_honored_while_waiting() {
        let (owner, handle) = status_cell(RemoteState::default());
        assert!(!handle.request_resume(), "ready: no-op");

        owner.update(|s| s.status = CaptureStatus::Waiting);
        assert!(handle.request_resume());
        assert_eq!(handle.snapshot().status, CaptureStatus::Ready);
        assert!(!handle.request_resume(), "second resume coalesces");

        let shutdown = AtomicBool::new(false);
        assert_eq!(
            owner.wait_for_resume(Duration::from_millis(10), &shutdown),
            ResumeWait::Resumed
        );
    }

    #[test]
    fn one_resume_satisfies_one_wait() {
        let (owner, handle) = status_cell(RemoteState::default());
        owner.update(|s| s.status = CaptureStatus::Waiting);
        assert!(handle.request_resume());
        let shutdown = AtomicBool::new(false);
        assert_eq!(
            owner.wait_for_resume(Duration::from_millis(10), &shutdown),
            ResumeWait::Resumed
        );

        owner.update(|s| s.status = CaptureStatus::Waiting);
        shutdown.store(true, Ordering::SeqCst);
        assert_eq!(
            owner.wait_for_resume(Duration::from_millis(10), &shutdown),
            ResumeWait::Cancelled,
            "token was consumed by the first wait"
        );
    }

    #[test]
    fn resume_from_another_thread_wakes_promptly() {
        let (owner, handle) = status_cell(RemoteState::default());
        owner.update(|s| s.status = CaptureStatus::Waiting);
        let remote = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.request_resume()
        });
        let started = std::time::Instant::now();
        let shutdown = AtomicBool::new(false);
        let outcome = owner.wait_for_resume(Duration::from_secs(5), &shutdown);
        assert_eq!(outcome, ResumeWait::Resumed);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(remote.join().unwrap());
    }
}
