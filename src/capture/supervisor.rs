use anyhow::{anyhow, Result};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use super::{CaptureStateMachine, RunSummary};
use crate::config::DaemonConfig;
use crate::ingest::open_source;
use crate::input::{InputListener, StdinKeys};
use crate::notify::TerminalBell;
use crate::remote::{open_channel, DebugNotice, WsConfig};
use crate::sink::DirectorySink;

pub type Launcher = Arc<dyn Fn() -> Result<RunSummary> + Send + Sync>;

/// Starts at most one capture run at a time.
pub struct CaptureSupervisor {
    launcher: Launcher,
    current: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureSupervisor {
    pub fn new(launcher: impl Fn() -> Result<RunSummary> + Send + Sync + 'static) -> Self {
        let launcher: Launcher = Arc::new(launcher);
        Self {
            launcher,
            current: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a run unless one is active. Returns whether a run was started.
    pub fn ensure_started(&self) -> Result<bool> {
        let mut current = self.lock();
        if let Some(run) = current.as_ref() {
            if !run.is_finished() {
                log::debug!("capture already running");
                return Ok(false);
            }
        }
        if let Some(finished) = current.take() {
            let _ = finished.join();
        }
        let launcher = self.launcher.clone();
        let run = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || match launcher() {
                Ok(summary) => log::debug!("capture run finished: {:?}", summary),
                Err(err) => log::error!("capture run failed: {:#}", err),
            })?;
        *current = Some(run);
        log::info!("capture started");
        Ok(true)
    }

    /// Start capture on behalf of a connecting display and describe what
    /// happened for its debug panel.
    pub fn start_for_display(&self) -> Vec<DebugNotice> {
        let mut notices = vec![DebugNotice::info("Initializing capture system...")];
        match self.ensure_started() {
            Ok(true) => notices.push(DebugNotice::info("Starting capture thread...")),
            Ok(false) => notices.push(DebugNotice::info("Capture thread already running")),
            Err(err) => {
                log::error!("failed to start capture: {:#}", err);
                notices.push(DebugNotice::error(format!("Failed to start capture: {err:#}")));
            }
        }
        notices
    }

    pub fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .map(|run| !run.is_finished())
            .unwrap_or(false)
    }

    /// Wait for the current run, if any, to end.
    pub fn join(&self) -> Result<()> {
        let run = self.lock().take();
        if let Some(run) = run {
            run.join().map_err(|_| anyhow!("capture thread panicked"))?;
        }
        Ok(())
    }
}

/// One complete capture run wired from configuration: camera, image
/// directory, display link, terminal cue and retake key.
pub fn run_capture(cfg: &DaemonConfig, shutdown: Arc<AtomicBool>) -> Result<RunSummary> {
    let source = open_source(&cfg.camera.url, cfg.camera.width, cfg.camera.height)?;
    let sink = DirectorySink::new(cfg.output.images_dir.clone()).with_quality(cfg.output.jpeg_quality);
    let machine = CaptureStateMachine::new(cfg.capture.clone(), source, Box::new(sink))
        .with_notifier(Box::new(TerminalBell))
        .with_shutdown(shutdown);

    let ws = WsConfig {
        url: cfg.display.url.clone(),
        reconnect_interval: cfg.display.reconnect_interval,
        jpeg_quality: cfg.output.jpeg_quality,
        ..WsConfig::default()
    };
    let channel = open_channel(&ws, machine.status_handle());
    let mut machine = machine.with_channel(channel);

    // Declared after the machine so it is stopped first.
    let _listener = match StdinKeys::new()
        .and_then(|keys| InputListener::spawn(keys, cfg.retake_key, machine.retake_sender()))
    {
        Ok(listener) => {
            log::info!("press '{}' to retake", cfg.retake_key);
            Some(listener)
        }
        Err(err) => {
            log::warn!("retake key unavailable: {:#}", err);
            None
        }
    };

    machine.run()
}
