use anyhow::Result;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use tungstenite::{Message, WebSocket};

use super::hub::{ClientId, Hub};
use crate::remote::{ClientRole, DebugNotice, WireMessage};
use crate::state::StatePatch;

const IO_POLL: Duration = Duration::from_millis(20);

/// Serve one WebSocket client until it leaves or the server stops.
pub(crate) fn serve_client(
    mut socket: WebSocket<TcpStream>,
    role: ClientRole,
    notices: &[DebugNotice],
    hub: Arc<Hub>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    socket.get_ref().set_read_timeout(Some(IO_POLL))?;
    for notice in notices {
        let text = WireMessage::DebugMessage(notice.clone()).encode()?;
        socket.send(Message::Text(text))?;
    }
    let (id, outbound) = hub.register();
    let result = pump(&mut socket, id, role, &outbound, &hub, &shutdown);
    hub.unregister(id);
    let _ = socket.close(None);
    let _ = socket.flush();
    result
}

fn pump(
    socket: &mut WebSocket<TcpStream>,
    id: ClientId,
    role: ClientRole,
    outbound: &Receiver<String>,
    hub: &Hub,
    shutdown: &AtomicBool,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        loop {
            match outbound.try_recv() {
                Ok(text) => socket.send(Message::Text(text))?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
        match socket.read() {
            Ok(Message::Text(text)) => handle_client_message(&text, id, role, hub),
            Ok(Message::Close(_)) => return Ok(()),
            Ok(_) => {}
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                return Ok(())
            }
            Err(err) => return Err(err.into()),
        }
    }
}

pub(crate) fn handle_client_message(text: &str, from: ClientId, role: ClientRole, hub: &Hub) {
    let msg = match WireMessage::decode(text) {
        Ok(msg) => msg,
        Err(err) => {
            log::debug!("display client {}: {}", from, err);
            return;
        }
    };
    match (role, msg) {
        (ClientRole::Capture, WireMessage::UpdateState(state)) => hub.publish_state(state, from),
        (ClientRole::Capture, msg) if msg.is_preview() => hub.relay(text, from),
        (ClientRole::Display, msg) if msg.is_preview() => {
            log::debug!("preview from display client {} dropped", from);
        }
        // A display's full snapshot is only an operator patch.
        (ClientRole::Display, WireMessage::UpdateState(state)) => match serde_json::to_value(state)
        {
            Ok(value) => apply_operator_patch(&value, from, hub),
            Err(err) => log::debug!("display client {}: {}", from, err),
        },
        (_, WireMessage::SetState(value)) => apply_operator_patch(&value, from, hub),
        (_, WireMessage::ResumeCapture) => {
            if hub.resume() {
                log::info!("resume requested by display client {}", from);
            } else {
                log::debug!("resume from display client {} ignored: not waiting", from);
            }
        }
        (_, msg) => log::debug!("display client {}: unexpected {}", from, msg.name()),
    }
}

fn apply_operator_patch(value: &serde_json::Value, from: ClientId, hub: &Hub) {
    match StatePatch::from_json(value) {
        Ok(patch) => {
            hub.apply_patch(&patch);
        }
        Err(err) => log::warn!("display client {} state update rejected: {}", from, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CaptureStatus, RemoteState};

    const WAITING: &str =
        r#"{"event":"update_state","data":{"object_id":99,"image_number":7,"status":"waiting"}}"#;

    #[test]
    fn set_state_is_validated_like_http() {
        let hub = Hub::new(RemoteState::default());
        let bogus = r#"{"event":"set_state","data":{"status":"bogus"}}"#;
        handle_client_message(bogus, 0, ClientRole::Display, &hub);
        assert_eq!(hub.state(), RemoteState::default());

        let patch = r#"{"event":"set_state","data":{"image_number":2}}"#;
        handle_client_message(patch, 0, ClientRole::Display, &hub);
        assert_eq!(hub.state().image_number, 2);
    }

    #[test]
    fn display_cannot_publish_capture_state() {
        let hub = Hub::new(RemoteState::default());
        let (display, display_rx) = hub.register();
        let _ = display_rx.try_iter().count();

        handle_client_message(WAITING, display, ClientRole::Display, &hub);
        assert_eq!(hub.state(), RemoteState::default());
        assert_eq!(display_rx.try_iter().count(), 0);

        // A permitted status from a display is applied as a patch.
        let processing = r#"{"event":"update_state","data":{"object_id":4,"image_number":1,"status":"processing"}}"#;
        handle_client_message(processing, display, ClientRole::Display, &hub);
        assert_eq!(
            hub.state(),
            RemoteState {
                object_id: 4,
                image_number: 1,
                status: CaptureStatus::Processing,
            }
        );
    }

    #[test]
    fn capture_client_state_is_stored() {
        let hub = Hub::new(RemoteState::default());
        let (capture, _capture_rx) = hub.register();
        handle_client_message(WAITING, capture, ClientRole::Capture, &hub);
        assert_eq!(hub.state().status, CaptureStatus::Waiting);
        assert_eq!(hub.state().object_id, 99);
    }

    #[test]
    fn previews_from_displays_are_not_relayed() {
        let hub = Hub::new(RemoteState::default());
        let (display, _display_rx) = hub.register();
        let (_other, other_rx) = hub.register();
        let _ = other_rx.try_iter().count();
        let preview = r#"{"event":"live_frame","data":"AA=="}"#;

        handle_client_message(preview, display, ClientRole::Display, &hub);
        assert_eq!(other_rx.try_iter().count(), 0);
        handle_client_message(preview, display, ClientRole::Capture, &hub);
        assert_eq!(other_rx.try_iter().count(), 1);
    }

    #[test]
    fn resume_capture_from_display_reaches_capture_client() {
        let hub = Hub::new(RemoteState::default());
        let (capture, capture_rx) = hub.register();
        let _ = capture_rx.try_iter().count();
        handle_client_message(
            r#"{"event":"update_state","data":{"object_id":1,"image_number":0,"status":"waiting"}}"#,
            capture,
            ClientRole::Capture,
            &hub,
        );
        let resume = r#"{"event":"resume_capture"}"#;
        handle_client_message(resume, capture + 1, ClientRole::Display, &hub);
        let got: Vec<_> = capture_rx.try_iter().collect();
        assert_eq!(got.len(), 1);
        let msg = WireMessage::decode(&got[0]).unwrap();
        match msg {
            WireMessage::UpdateState(state) => assert_eq!(state.status, CaptureStatus::Ready),
            other => panic!("unexpected {other:?}"),
        }
    }
}
