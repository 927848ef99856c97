//! Shared state and fan-out for connected display clients.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard};

use crate::remote::WireMessage;
use crate::state::{CaptureStatus, RemoteState, StatePatch};

/// Messages a slow client may fall behind by before it starts losing them.
const CLIENT_BACKLOG: usize = 64;

pub type ClientId = u64;

pub struct Hub {
    inner: Mutex<HubInner>,
}

struct HubInner {
    state: RemoteState,
    clients: HashMap<ClientId, SyncSender<String>>,
    next_id: ClientId,
}

impl Hub {
    pub fn new(initial: RemoteState) -> Self {
        Self {
            inner: Mutex::new(HubInner {
                state: initial,
                clients: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> RemoteState {
        self.lock().state
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Add a client. Its queue starts with the current state.
    pub fn register(&self) -> (ClientId, Receiver<String>) {
        let (tx, rx) = mpsc::sync_channel(CLIENT_BACKLOG);
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if let Some(text) = state_message(&inner.state) {
            let _ = tx.try_send(text);
        }
        inner.clients.insert(id, tx);
        log::debug!("display client {} registered ({} total)", id, inner.clients.len());
        (id, rx)
    }

    pub fn unregister(&self, id: ClientId) {
        let mut inner = self.lock();
        inner.clients.remove(&id);
        log::debug!("display client {} left ({} remaining)", id, inner.clients.len());
    }

    /// Apply a validated operator patch and broadcast the result to everyone,
    /// the capture client included.
    pub fn apply_patch(&self, patch: &StatePatch) -> RemoteState {
        let mut inner = self.lock();
        patch.apply(&mut inner.state);
        let state = inner.state;
        if let Some(text) = state_message(&state) {
            broadcast(&mut inner, &text, None);
        }
        log::info!(
            "state set to object {} image {} {}",
            state.object_id,
            state.image_number,
            state.status
        );
        state
    }

    /// Store a state snapshot published by a client and forward it to the
    /// others. Last writer wins.
    pub fn publish_state(&self, state: RemoteState, from: ClientId) {
        let mut inner = self.lock();
        inner.state = state;
        if let Some(text) = state_message(&state) {
            broadcast(&mut inner, &text, Some(from));
        }
    }

    /// Honour a resume only while capture is escalated.
    pub fn resume(&self) -> bool {
        let mut inner = self.lock();
        if inner.state.status != CaptureStatus::Waiting {
            return false;
        }
        inner.state.status = CaptureStatus::Ready;
        let state = inner.state;
        if let Some(text) = state_message(&state) {
            broadcast(&mut inner, &text, None);
        }
        true
    }

    /// Forward a preview message verbatim.
    pub fn relay(&self, text: &str, from: ClientId) {
        let mut inner = self.lock();
        broadcast(&mut inner, text, Some(from));
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("state", &self.state())
            .field("clients", &self.client_count())
            .finish()
    }
}

fn state_message(state: &RemoteState) -> Option<String> {
    match WireMessage::UpdateState(*state).encode() {
        Ok(text) => Some(text),
        Err(err) => {
            log::error!("{}", err);
            None
        }
    }
}

fn broadcast(inner: &mut HubInner, text: &str, except: Option<ClientId>) {
    inner.clients.retain(|id, tx| {
        if Some(*id) == except {
            return true;
        }
        match tx.try_send(text.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::debug!("display client {} lagging, message dropped", id);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &Receiver<String>) -> Vec<WireMessage> {
        rx.try_iter()
            .map(|text| WireMessage::decode(&text).unwrap())
            .collect()
    }

    #[test]
    fn new_client_receives_current_state() {
        let hub = Hub::new(RemoteState {
            object_id: 3,
            image_number: 1,
            status: CaptureStatus::Capturing,
        });
        let (_id, rx) = hub.register();
        assert_eq!(drain(&rx), vec![WireMessage::UpdateState(hub.state())]);
    }

    #[test]
    fn published_state_goes_to_other_clients_only() {
        let hub = Hub::new(RemoteState::default());
        let (capture, capture_rx) = hub.register();
        let (_display, display_rx) = hub.register();
        drain(&capture_rx);
        drain(&display_rx);

        let waiting = RemoteState {
            object_id: 1,
            image_number: 0,
            status: CaptureStatus::Waiting,
        };
        hub.publish_state(waiting, capture);
        assert!(drain(&capture_rx).is_empty());
        assert_eq!(drain(&display_rx), vec![WireMessage::UpdateState(waiting)]);
    }

    #[test]
    fn resume_only_while_waiting() {
        let hub = Hub::new(RemoteState::default());
        let (capture, capture_rx) = hub.register();
        drain(&capture_rx);
        assert!(!hub.resume());
        assert!(drain(&capture_rx).is_empty());

        hub.publish_state(
            RemoteState {
                status: CaptureStatus::Waiting,
                ..RemoteState::default()
            },
            capture,
        );
        assert!(hub.resume());
        assert_eq!(hub.state().status, CaptureStatus::Ready);
        assert_eq!(
            drain(&capture_rx),
            vec![WireMessage::UpdateState(RemoteState::default())]
        );
    }

    #[test]
    fn relay_skips_sender_and_prunes_gone_clients() {
        let hub = Hub::new(RemoteState::default());
        let (capture, capture_rx) = hub.register();
        let (_gone, gone_rx) = hub.register();
        drop(gone_rx);
        drain(&capture_rx);

        hub.relay(r#"{"event":"live_frame","data":"AA=="}"#, capture);
        assert!(drain(&capture_rx).is_empty());
        assert_eq!(hub.client_count(), 1);
    }
}
