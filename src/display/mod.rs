//! Display hub: HTTP state endpoints and WebSocket fan-out.
//!
//! One listener serves both. A connection whose request head asks for a
//! WebSocket upgrade on `/ws` becomes a hub client; anything else is answered
//! as a single HTTP request and closed.

mod http;
pub mod hub;
mod socket;

use anyhow::{anyhow, Result};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::remote::protocol::{ClientRole, DebugNotice, ROLE_PARAM};
use crate::state::RemoteState;
use http::{handle_http, head_end, parse_head, read_request, write_json_response, MAX_REQUEST_BYTES};
pub use hub::{ClientId, Hub};

const HEAD_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs when a display connects; the notices it returns are sent to that
/// display ahead of the current state.
pub type ConnectHook = Arc<dyn Fn() -> Vec<DebugNotice> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct DisplayConfig {
    pub addr: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct DisplayHandle {
    pub addr: SocketAddr,
    hub: Arc<Hub>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl DisplayHandle {
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("display server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct DisplayServer {
    cfg: DisplayConfig,
    on_connect: Option<ConnectHook>,
}

impl DisplayServer {
    pub fn new(cfg: DisplayConfig) -> Self {
        Self {
            cfg,
            on_connect: None,
        }
    }

    /// Run `hook` every time a display client connects.
    pub fn on_client_connect(
        mut self,
        hook: impl Fn() -> Vec<DebugNotice> + Send + Sync + 'static,
    ) -> Self {
        let hook: ConnectHook = Arc::new(hook);
        self.on_connect = Some(hook);
        self
    }

    pub fn spawn(self) -> Result<DisplayHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let hub = Arc::new(Hub::new(RemoteState::default()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let hub_thread = hub.clone();
        let on_connect = self.on_connect;
        let join = std::thread::Builder::new()
            .name("display-server".to_string())
            .spawn(move || {
                if let Err(err) = run_server(listener, hub_thread, on_connect, shutdown_thread) {
                    log::error!("display server stopped: {}", err);
                }
            })?;
        log::info!("display hub listening on {}", addr);

        Ok(DisplayHandle {
            addr,
            hub,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(
    listener: TcpListener,
    hub: Arc<Hub>,
    on_connect: Option<ConnectHook>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        connections.retain(|conn| !conn.is_finished());
        match listener.accept() {
            Ok((stream, peer)) => {
                let hub = hub.clone();
                let on_connect = on_connect.clone();
                let shutdown = shutdown.clone();
                let conn = std::thread::Builder::new()
                    .name("display-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &hub, on_connect, shutdown) {
                            log::warn!("display request from {} failed: {:#}", peer, err);
                        }
                    })?;
                connections.push(conn);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    for conn in connections {
        let _ = conn.join();
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    hub: &Arc<Hub>,
    on_connect: Option<ConnectHook>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let head = peek_head(&stream)?;
    let request = parse_head(&head)?;

    if request.is_websocket_upgrade() && request.path == "/ws" {
        let role = ClientRole::from_param(request.query_param(ROLE_PARAM).as_deref());
        let peer = stream.peer_addr()?;
        let socket = tungstenite::accept(stream)
            .map_err(|e| anyhow!("websocket handshake: {}", e))?;
        log::info!("{} client connected from {}", role.as_str(), peer);
        let notices = match (role, on_connect) {
            (ClientRole::Display, Some(hook)) => hook(),
            _ => Vec::new(),
        };
        let result = socket::serve_client(socket, role, &notices, hub.clone(), shutdown);
        log::info!("{} client {} disconnected", role.as_str(), peer);
        return result;
    }

    let request = read_request(&mut stream)?;
    if request.is_websocket_upgrade() {
        return write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#);
    }
    handle_http(&mut stream, &request, hub)
}

/// Look at the request head without consuming it, so a WebSocket handshake
/// can still read it from the stream.
fn peek_head(stream: &TcpStream) -> Result<Vec<u8>> {
    stream.set_read_timeout(Some(HEAD_TIMEOUT))?;
    let deadline = Instant::now() + HEAD_TIMEOUT;
    let mut buf = vec![0u8; MAX_REQUEST_BYTES];
    loop {
        let n = stream.peek(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request head"));
        }
        if let Some(end) = head_end(&buf[..n]) {
            buf.truncate(end);
            return Ok(buf);
        }
        if n == buf.len() {
            return Err(anyhow!("request head too large"));
        }
        if Instant::now() >= deadline {
            return Err(anyhow!("timed out reading request head"));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
