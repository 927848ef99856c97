//! Operator retake input.
//!
//! A background listener maps the retake key to a `RetakeRequested` event on a
//! single-slot mailbox. Presses that arrive before the capture loop consumes
//! the pending request coalesce into it. The listener never touches capture
//! state and stops (joining its thread) on `stop` or drop.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Default operator retake key.
pub const DEFAULT_RETAKE_KEY: char = 'x';

const KEY_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetakeRequested;

#[derive(Clone)]
pub struct RetakeSender {
    tx: SyncSender<RetakeRequested>,
}

pub struct RetakeMailbox {
    rx: Receiver<RetakeRequested>,
}

pub fn retake_mailbox() -> (RetakeSender, RetakeMailbox) {
    let (tx, rx) = mpsc::sync_channel(1);
    (RetakeSender { tx }, RetakeMailbox { rx })
}

impl RetakeSender {
    /// Latch a retake. Returns false when one was already pending.
    pub fn post(&self) -> bool {
        match self.tx.try_send(RetakeRequested) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl RetakeMailbox {
    /// Consume the pending retake, if any.
    pub fn take(&self) -> Option<RetakeRequested> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Source of operator key presses.
pub trait KeySource: Send + 'static {
    /// Wait up to `timeout` for one key press.
    fn poll_key(&mut self, timeout: Duration) -> Result<Option<char>>;
}

/// Fixed key sequence, one key per poll.
pub struct ScriptedKeys {
    keys: VecDeque<char>,
}

impl ScriptedKeys {
    pub fn new(keys: impl IntoIterator<Item = char>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }
}

impl KeySource for ScriptedKeys {
    fn poll_key(&mut self, timeout: Duration) -> Result<Option<char>> {
        match self.keys.pop_front() {
            Some(key) => Ok(Some(key)),
            None => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}

/// Keys typed on the controlling terminal.
///
/// On Linux the terminal is switched to non-canonical, no-echo mode so single
/// key presses arrive without Enter; the previous mode is restored on drop.
pub struct StdinKeys {
    #[cfg(target_os = "linux")]
    saved: Option<libc::termios>,
}

impl StdinKeys {
    pub fn new() -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            use std::io::IsTerminal;
            let saved = if std::io::stdin().is_terminal() {
                Some(enter_key_mode()?)
            } else {
                None
            };
            Ok(Self { saved })
        }
        #[cfg(not(target_os = "linux"))]
        {
            log::warn!("retake key is not supported on this platform");
            Ok(Self {})
        }
    }
}

#[cfg(target_os = "linux")]
fn enter_key_mode() -> Result<libc::termios> {
    // SAFETY: tcgetattr/tcsetattr only read/write the termios struct we own.
    unsafe {
        let mut original: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(libc::STDIN_FILENO, &mut original) != 0 {
            return Err(anyhow!("tcgetattr failed: {}", std::io::Error::last_os_error()));
        }
        let mut raw = original;
        raw.c_lflag &= !(libc::ICANON | libc::ECHO);
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;
        if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) != 0 {
            return Err(anyhow!("tcsetattr failed: {}", std::io::Error::last_os_error()));
        }
        Ok(original)
    }
}

impl KeySource for StdinKeys {
    #[cfg(target_os = "linux")]
    fn poll_key(&mut self, timeout: Duration) -> Result<Option<char>> {
        let mut fds = libc::pollfd {
            fd: libc::STDIN_FILENO,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        // SAFETY: one valid pollfd, length 1.
        let ready = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(anyhow!("poll stdin: {}", err));
        }
        if ready == 0 || fds.revents & libc::POLLIN == 0 {
            if fds.revents & (libc::POLLHUP | libc::POLLERR) != 0 {
                return Err(anyhow!("stdin closed"));
            }
            return Ok(None);
        }
        let mut buf = [0u8; 1];
        // SAFETY: reading at most 1 byte into a 1-byte buffer.
        let n = unsafe { libc::read(libc::STDIN_FILENO, buf.as_mut_ptr().cast(), 1) };
        match n {
            1 => Ok(Some(buf[0] as char)),
            0 => Err(anyhow!("stdin closed")),
            _ => Err(anyhow!("read stdin: {}", std::io::Error::last_os_error())),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn poll_key(&mut self, timeout: Duration) -> Result<Option<char>> {
        std::thread::sleep(timeout);
        Ok(None)
    }
}

impl Drop for StdinKeys {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        {
            if let Some(original) = self.saved.take() {
                // SAFETY: restoring the termios captured in `enter_key_mode`.
                unsafe {
                    libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &original);
                }
            }
        }
    }
}

/// Background retake listener.
#[derive(Debug)]
pub struct InputListener {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl InputListener {
    pub fn spawn<K: KeySource>(mut keys: K, retake_key: char, sender: RetakeSender) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("retake-listener".to_string())
            .spawn(move || {
                while !shutdown_thread.load(Ordering::SeqCst) {
                    match keys.poll_key(KEY_POLL) {
                        Ok(Some(key)) if key.eq_ignore_ascii_case(&retake_key) => {
                            if sender.post() {
                                log::info!("retake requested");
                            } else {
                                log::debug!("retake already pending");
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            log::warn!("retake listener stopped: {}", err);
                            break;
                        }
                    }
                }
            })?;
        Ok(Self {
            shutdown,
            join: Some(join),
        })
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("retake listener thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for InputListener {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown_and_join() {
            log::warn!("{}", err);
        }
    }
}
