use anyhow::Result;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tungstenite::{Message, WebSocket};

use side_capture::remote::DebugNotice;
use side_capture::state::{status_cell, ResumeWait};
use side_capture::{
    CaptureStatus, DisplayConfig, DisplayServer, RemoteChannel, RemoteState, WireMessage,
    WsConfig, WsRemoteChannel,
};

fn loopback() -> DisplayConfig {
    DisplayConfig {
        addr: "127.0.0.1:0".to_string(),
    }
}

fn request(addr: SocketAddr, raw: &str) -> Result<(u16, String)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    stream.write_all(raw.as_bytes())?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

fn post_state(addr: SocketAddr, body: &str) -> Result<(u16, Value)> {
    let raw = format!(
        "POST /api/state HTTP/1.1\r\nHost: test\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let (status, body) = request(addr, &raw)?;
    Ok((status, serde_json::from_str(&body)?))
}

fn ws_client(addr: SocketAddr) -> Result<WebSocket<TcpStream>> {
    ws_client_at(addr, "/ws")
}

fn ws_client_at(addr: SocketAddr, path: &str) -> Result<WebSocket<TcpStream>> {
    let stream = TcpStream::connect(addr)?;
    let (mut socket, _) = tungstenite::client(format!("ws://{addr}{path}"), stream)
        .map_err(|e| anyhow::anyhow!("handshake: {e}"))?;
    socket
        .get_mut()
        .set_read_timeout(Some(Duration::from_secs(2)))?;
    Ok(socket)
}

fn next_message(socket: &mut WebSocket<TcpStream>) -> Result<WireMessage> {
    loop {
        if let Message::Text(text) = socket.read()? {
            return Ok(WireMessage::decode(&text)?);
        }
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn http_state_endpoints() -> Result<()> {
    let handle = DisplayServer::new(loopback()).spawn()?;
    let addr = handle.addr;

    let (status, body) = request(addr, "GET /health HTTP/1.1\r\nHost: test\r\n\r\n")?;
    assert_eq!(status, 200);
    assert_eq!(body, r#"{"status":"ok"}"#);

    let (status, body) = request(addr, "GET /api/state HTTP/1.1\r\nHost: test\r\n\r\n")?;
    assert_eq!(status, 200);
    let state: Value = serde_json::from_str(&body)?;
    assert_eq!(state, json!({"object_id": 0, "image_number": 0, "status": "ready"}));

    let (status, body) = post_state(addr, r#"{"object_id":7,"status":"processing"}"#)?;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["state"]["object_id"], 7);

    let (status, _) = request(addr, "DELETE /api/state HTTP/1.1\r\nHost: test\r\n\r\n")?;
    assert_eq!(status, 405);
    let (status, _) = request(addr, "GET /nope HTTP/1.1\r\nHost: test\r\n\r\n")?;
    assert_eq!(status, 404);

    handle.stop()?;
    Ok(())
}

#[test]
fn bogus_status_is_rejected_and_state_unchanged() -> Result<()> {
    let handle = DisplayServer::new(loopback()).spawn()?;
    let before = handle.hub().state();

    let (status, body) = post_state(handle.addr, r#"{"status":"bogus"}"#)?;
    assert_eq!(status, 400);
    assert_eq!(body, json!({"success": false, "error": "Invalid status"}));

    let (status, body) = post_state(handle.addr, r#"{"object_id":1,"shoe_size":44}"#)?;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Invalid state keys");

    assert_eq!(handle.hub().state(), before);
    handle.stop()?;
    Ok(())
}

#[test]
fn new_client_gets_current_state_and_hook_fires() -> Result<()> {
    let connects = Arc::new(AtomicUsize::new(0));
    let hook_count = connects.clone();
    let handle = DisplayServer::new(loopback())
        .on_client_connect(move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
            vec![DebugNotice::info("Starting capture thread...")]
        })
        .spawn()?;
    post_state(handle.addr, r#"{"object_id":3}"#)?;

    let mut display = ws_client(handle.addr)?;
    // Start-up notices come before the current state.
    assert_eq!(
        next_message(&mut display)?,
        WireMessage::DebugMessage(DebugNotice::info("Starting capture thread..."))
    );
    match next_message(&mut display)? {
        WireMessage::UpdateState(state) => assert_eq!(state.object_id, 3),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    // HTTP updates are broadcast to connected displays.
    post_state(handle.addr, r#"{"image_number":1,"status":"capturing"}"#)?;
    match next_message(&mut display)? {
        WireMessage::UpdateState(state) => {
            assert_eq!(state.image_number, 1);
            assert_eq!(state.status, CaptureStatus::Capturing);
        }
        other => panic!("unexpected {other:?}"),
    }

    display.close(None)?;
    handle.stop()?;
    Ok(())
}

#[test]
fn only_the_capture_client_publishes_state() -> Result<()> {
    let connects = Arc::new(AtomicUsize::new(0));
    let hook_count = connects.clone();
    let handle = DisplayServer::new(loopback())
        .on_client_connect(move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        })
        .spawn()?;
    let mut display = ws_client(handle.addr)?;
    let _initial = next_message(&mut display)?;

    let forged = WireMessage::UpdateState(RemoteState {
        object_id: 99,
        image_number: 7,
        status: CaptureStatus::Waiting,
    });
    display.send(Message::Text(forged.encode()?))?;
    // Messages from one client are handled in order; this one marks the end.
    display.send(Message::Text(
        WireMessage::SetState(json!({"image_number": 5})).encode()?,
    ))?;
    assert!(wait_until(|| handle.hub().state().image_number == 5));
    assert_eq!(handle.hub().state().status, CaptureStatus::Ready);
    assert_eq!(handle.hub().state().object_id, 0);

    let mut capture = ws_client_at(handle.addr, "/ws?role=capture")?;
    let _initial = next_message(&mut capture)?;
    capture.send(Message::Text(forged.encode()?))?;
    assert!(wait_until(|| handle.hub().state().status == CaptureStatus::Waiting));
    assert_eq!(handle.hub().state().object_id, 99);
    // Only the display connection starts capture.
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    display.close(None)?;
    capture.close(None)?;
    handle.stop()?;
    Ok(())
}

#[test]
fn display_resume_reaches_escalated_capture() -> Result<()> {
    let handle = DisplayServer::new(loopback()).spawn()?;
    let (owner, status) = status_cell(RemoteState::default());
    let cfg = WsConfig {
        url: format!("ws://{}/ws", handle.addr),
        ..WsConfig::default()
    };
    let mut channel = WsRemoteChannel::connect(&cfg, status)?;
    assert!(channel.is_connected());

    let mut display = ws_client(handle.addr)?;
    let _initial = next_message(&mut display)?;

    // Capture escalates and tells the hub.
    let waiting = owner.update(|s| s.status = CaptureStatus::Waiting);
    channel.publish_state(&waiting)?;
    match next_message(&mut display)? {
        WireMessage::UpdateState(state) => assert_eq!(state.status, CaptureStatus::Waiting),
        other => panic!("unexpected {other:?}"),
    }
    assert!(wait_until(|| handle.hub().state().status == CaptureStatus::Waiting));

    display.send(Message::Text(WireMessage::ResumeCapture.encode()?))?;
    let shutdown = AtomicBool::new(false);
    assert_eq!(
        owner.wait_for_resume(Duration::from_millis(50), &shutdown),
        ResumeWait::Resumed
    );
    assert_eq!(owner.snapshot().status, CaptureStatus::Ready);
    assert!(wait_until(|| handle.hub().state().status == CaptureStatus::Ready));

    channel.close();
    display.close(None)?;
    handle.stop()?;
    Ok(())
}

#[test]
fn previews_are_relayed_to_displays() -> Result<()> {
    let handle = DisplayServer::new(loopback()).spawn()?;
    let (_owner, status) = status_cell(RemoteState::default());
    let cfg = WsConfig {
        url: format!("ws://{}/ws", handle.addr),
        ..WsConfig::default()
    };
    let mut channel = WsRemoteChannel::connect(&cfg, status)?;
    let mut display = ws_client(handle.addr)?;
    let _initial = next_message(&mut display)?;
    assert!(wait_until(|| handle.hub().client_count() == 2));

    let frame = side_capture::Frame::gray(vec![128; 16 * 16], 16, 16)?;
    channel.publish_captured(&frame)?;
    match next_message(&mut display)? {
        WireMessage::CaptureFrame(payload) => assert!(!payload.is_empty()),
        other => panic!("unexpected {other:?}"),
    }

    channel.close();
    handle.stop()?;
    Ok(())
}
