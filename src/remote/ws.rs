//! WebSocket client to the display hub.
//!
//! The socket lives on one I/O thread. Publishers enqueue encoded messages on
//! a bounded channel and never block on the network: a full queue or a
//! dropped connection just loses that message. Inbound `resume_capture`, or an
//! `update_state` carrying `ready`, is turned into a resume request on the
//! status handle, which only has an effect while capture is escalated.

use anyhow::{anyhow, Context, Result};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tungstenite::{Message, WebSocket};
use url::Url;

use super::protocol::{ClientRole, WireMessage, ROLE_PARAM};
use super::RemoteChannel;
use crate::error::CaptureError;
use crate::frame::{Frame, DEFAULT_JPEG_QUALITY};
use crate::state::{CaptureStatus, RemoteState, StatusHandle};

const IO_POLL: Duration = Duration::from_millis(20);
const OUTBOUND_CAPACITY: usize = 32;

#[derive(Clone, Debug)]
pub struct WsConfig {
    pub url: String,
    pub connect_timeout: Duration,
    /// `None`: one attempt at startup, then stay disconnected.
    pub reconnect_interval: Option<Duration>,
    pub jpeg_quality: u8,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5000/ws".to_string(),
            connect_timeout: Duration::from_secs(2),
            reconnect_interval: None,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

pub struct WsRemoteChannel {
    outbound: SyncSender<String>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    quality: u8,
}

impl WsRemoteChannel {
    /// Dial the display and start the I/O thread.
    ///
    /// Fails when the first attempt fails and reconnect is disabled. With
    /// reconnect enabled the channel starts disconnected and keeps retrying.
    pub fn connect(config: &WsConfig, status: StatusHandle) -> Result<Self> {
        let mut url =
            Url::parse(&config.url).with_context(|| format!("display url {}", config.url))?;
        if url.scheme() != "ws" {
            return Err(anyhow!("display url scheme '{}' not supported", url.scheme()));
        }
        if !url.query_pairs().any(|(key, _)| key == ROLE_PARAM) {
            url.query_pairs_mut()
                .append_pair(ROLE_PARAM, ClientRole::Capture.as_str());
        }
        let socket = match dial(&url, config.connect_timeout) {
            Ok(socket) => {
                log::info!("connected to display at {}", url);
                Some(socket)
            }
            Err(err) if config.reconnect_interval.is_some() => {
                log::warn!("display unavailable ({:#}); will retry", err);
                None
            }
            Err(err) => return Err(err),
        };

        let (outbound, rx) = mpsc::sync_channel(OUTBOUND_CAPACITY);
        let connected = Arc::new(AtomicBool::new(socket.is_some()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let io = IoLoop {
            url,
            connect_timeout: config.connect_timeout,
            reconnect_interval: config.reconnect_interval,
            socket,
            outbound: rx,
            status,
            connected: connected.clone(),
            shutdown: shutdown.clone(),
        };
        let join = std::thread::Builder::new()
            .name("display-client".to_string())
            .spawn(move || io.run())?;

        Ok(Self {
            outbound,
            connected,
            shutdown,
            join: Some(join),
            quality: config.jpeg_quality,
        })
    }

    fn enqueue(&self, msg: WireMessage) -> Result<(), CaptureError> {
        if !self.is_connected() {
            return Err(CaptureError::transport("display not connected"));
        }
        let text = msg.encode()?;
        match self.outbound.try_send(text) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CaptureError::transport(format!(
                "outbound queue full, dropped {}",
                msg.name()
            ))),
            Err(TrySendError::Disconnected(_)) => {
                Err(CaptureError::transport("display client stopped"))
            }
        }
    }

    fn encode_frame(&self, frame: &Frame) -> Result<String, CaptureError> {
        frame
            .to_base64_jpeg(self.quality)
            .map_err(|e| CaptureError::transport(format!("encode preview: {e:#}")))
    }
}

impl RemoteChannel for WsRemoteChannel {
    fn publish_state(&mut self, state: &RemoteState) -> Result<(), CaptureError> {
        self.enqueue(WireMessage::UpdateState(*state))
    }

    fn publish_live(&mut self, frame: &Frame) -> Result<(), CaptureError> {
        // Skip the JPEG encode entirely while nobody is listening.
        if !self.is_connected() {
            return Err(CaptureError::transport("display not connected"));
        }
        let payload = self.encode_frame(frame)?;
        self.enqueue(WireMessage::LiveFrame(payload))
    }

    fn publish_captured(&mut self, frame: &Frame) -> Result<(), CaptureError> {
        if !self.is_connected() {
            return Err(CaptureError::transport("display not connected"));
        }
        let payload = self.encode_frame(frame)?;
        self.enqueue(WireMessage::CaptureFrame(payload))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::warn!("display client thread panicked");
            }
        }
    }
}

impl Drop for WsRemoteChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn dial(url: &Url, timeout: Duration) -> Result<WebSocket<TcpStream>> {
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("display url {} has no host", url))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("display url {} has no port", url))?;

    let mut last_err = None;
    let mut stream = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(err) => last_err = Some(err),
        }
    }
    let stream = match (stream, last_err) {
        (Some(stream), _) => stream,
        (None, Some(err)) => return Err(anyhow::Error::new(err).context(format!("connect {url}"))),
        (None, None) => return Err(anyhow!("{} resolved to no addresses", host)),
    };
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;

    let (socket, _response) = tungstenite::client(url.as_str(), stream)
        .map_err(|e| anyhow!("websocket handshake with {}: {}", url, e))?;
    socket.get_ref().set_read_timeout(Some(IO_POLL))?;
    Ok(socket)
}

struct IoLoop {
    url: Url,
    connect_timeout: Duration,
    reconnect_interval: Option<Duration>,
    socket: Option<WebSocket<TcpStream>>,
    outbound: Receiver<String>,
    status: StatusHandle,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl IoLoop {
    fn run(mut self) {
        let mut next_attempt = Instant::now();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if self.socket.is_none() {
                self.idle(&mut next_attempt);
                continue;
            }
            if let Err(err) = self.pump() {
                log::warn!("display connection lost: {:#}", err);
                self.socket = None;
                self.connected.store(false, Ordering::SeqCst);
                if let Some(interval) = self.reconnect_interval {
                    next_attempt = Instant::now() + interval;
                }
            }
        }
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None);
            let _ = socket.flush();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Disconnected: discard queued messages and retry when due.
    fn idle(&mut self, next_attempt: &mut Instant) {
        while self.outbound.try_recv().is_ok() {}
        if let Some(interval) = self.reconnect_interval {
            if Instant::now() >= *next_attempt {
                match dial(&self.url, self.connect_timeout) {
                    Ok(socket) => {
                        log::info!("reconnected to display at {}", self.url);
                        self.socket = Some(socket);
                        self.connected.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(err) => {
                        log::debug!("display reconnect failed: {:#}", err);
                        *next_attempt = Instant::now() + interval;
                    }
                }
            }
        }
        std::thread::sleep(IO_POLL);
    }

    /// Flush queued messages, then read for at most one poll interval.
    fn pump(&mut self) -> Result<()> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| anyhow!("not connected"))?;
        loop {
            match self.outbound.try_recv() {
                Ok(text) => socket.send(Message::Text(text))?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.shutdown.store(true, Ordering::SeqCst);
                    return Ok(());
                }
            }
        }
        match socket.read() {
            Ok(Message::Text(text)) => handle_inbound(&text, &self.status),
            Ok(Message::Close(_)) => return Err(anyhow!("closed by display")),
            Ok(_) => {}
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}

fn handle_inbound(text: &str, status: &StatusHandle) {
    let msg = match WireMessage::decode(text) {
        Ok(msg) => msg,
        Err(err) => {
            log::debug!("ignoring display message: {}", err);
            return;
        }
    };
    let wants_resume = match &msg {
        WireMessage::ResumeCapture => true,
        WireMessage::UpdateState(state) => state.status == CaptureStatus::Ready,
        _ => false,
    };
    if wants_resume && status.request_resume() {
        log::info!("resume received from display ({})", msg.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::status_cell;
    use std::net::TcpListener;

    #[test]
    fn inbound_ready_resumes_only_while_waiting() {
        let (owner, handle) = status_cell(RemoteState::default());
        handle_inbound(r#"{"event":"resume_capture"}"#, &handle);
        assert_eq!(owner.snapshot().status, CaptureStatus::Ready);

        owner.update(|s| s.status = CaptureStatus::Waiting);
        handle_inbound(
            r#"{"event":"update_state","data":{"object_id":0,"image_number":0,"status":"capturing"}}"#,
            &handle,
        );
        assert_eq!(owner.snapshot().status, CaptureStatus::Waiting);

        handle_inbound(
            r#"{"event":"update_state","data":{"object_id":0,"image_number":0,"status":"ready"}}"#,
            &handle,
        );
        assert_eq!(owner.snapshot().status, CaptureStatus::Ready);
    }

    #[test]
    fn connect_fails_without_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (_owner, handle) = status_cell(RemoteState::default());
        let cfg = WsConfig {
            url: format!("ws://{addr}/ws"),
            connect_timeout: Duration::from_millis(200),
            ..WsConfig::default()
        };
        assert!(WsRemoteChannel::connect(&cfg, handle).is_err());
    }

    #[test]
    fn reconnecting_channel_starts_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (_owner, handle) = status_cell(RemoteState::default());
        let cfg = WsConfig {
            url: format!("ws://{addr}/ws"),
            connect_timeout: Duration::from_millis(200),
            reconnect_interval: Some(Duration::from_secs(60)),
            ..WsConfig::default()
        };
        let mut channel = WsRemoteChannel::connect(&cfg, handle).unwrap();
        assert!(!channel.is_connected());
        let err = channel.publish_state(&RemoteState::default()).unwrap_err();
        assert_eq!(err.code(), "transport_error");
        channel.close();
    }

    #[test]
    fn rejects_secure_scheme() {
        let (_owner, handle) = status_cell(RemoteState::default());
        let cfg = WsConfig {
            url: "wss://display.local/ws".to_string(),
            ..WsConfig::default()
        };
        assert!(WsRemoteChannel::connect(&cfg, handle).is_err());
    }
}
