//! side_captured - multi-side object capture daemon
//!
//! This daemon:
//! 1. Serves the display hub (HTTP state endpoints + WebSocket fan-out)
//! 2. Starts capture when the first display connects (or at once with autostart)
//! 3. Captures every side of each object and writes the images to disk
//! 4. Stops cleanly on Ctrl-C, releasing the camera

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use side_capture::{
    prepare_output_dir, run_capture, CaptureSupervisor, DaemonConfig, DisplayConfig,
    DisplayServer,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-side object capture daemon")]
struct Args {
    /// Camera: stub://<name>, dir://<path> or a V4L2 device path.
    #[arg(long, env = "SIDE_CAPTURE_CAMERA")]
    camera: Option<String>,

    /// Directory the side images are written to.
    #[arg(long, env = "SIDE_CAPTURE_IMAGES_DIR")]
    images_dir: Option<PathBuf>,

    /// Delete and recreate the image directory before starting.
    #[arg(long)]
    clear_output_dir: bool,

    /// Sides captured per object.
    #[arg(long, env = "SIDE_CAPTURE_IMAGES_PER_OBJECT")]
    images_per_object: Option<usize>,

    /// Display hub listen address.
    #[arg(long, env = "SIDE_CAPTURE_DISPLAY_ADDR")]
    display_addr: Option<String>,

    /// WebSocket URL the capture loop publishes to.
    #[arg(long, env = "SIDE_CAPTURE_DISPLAY_URL")]
    display_url: Option<String>,

    /// Do not run the display hub in this process.
    #[arg(long)]
    no_display_server: bool,

    /// Start capturing immediately instead of waiting for a display.
    #[arg(long)]
    autostart: bool,
}

impl Args {
    fn apply(&self, cfg: &mut DaemonConfig) {
        if let Some(camera) = &self.camera {
            cfg.camera.url = camera.clone();
        }
        if let Some(dir) = &self.images_dir {
            cfg.output.images_dir = dir.clone();
        }
        if self.clear_output_dir {
            cfg.output.clear = true;
        }
        if let Some(count) = self.images_per_object {
            cfg.capture.images_per_object = count;
        }
        if let Some(addr) = &self.display_addr {
            cfg.display.addr = addr.clone();
        }
        if let Some(url) = &self.display_url {
            cfg.display.url = url.clone();
        }
        if self.autostart {
            cfg.autostart = true;
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = DaemonConfig::load()?;
    args.apply(&mut cfg);
    cfg.validate()?;
    prepare_output_dir(&cfg.output.images_dir, cfg.output.clear)?;

    log::info!(
        "side_captured {}: camera {}, {} sides per object, images in {}",
        env!("CARGO_PKG_VERSION"),
        cfg.camera.url,
        cfg.capture.images_per_object,
        cfg.output.images_dir.display()
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let cfg = Arc::new(cfg);
    let supervisor = Arc::new(CaptureSupervisor::new({
        let cfg = cfg.clone();
        let shutdown = shutdown.clone();
        move || run_capture(&cfg, shutdown.clone())
    }));

    let display = if args.no_display_server {
        None
    } else {
        let on_connect = supervisor.clone();
        let handle = DisplayServer::new(DisplayConfig {
            addr: cfg.display.addr.clone(),
        })
        .on_client_connect(move || on_connect.start_for_display())
        .spawn()?;
        Some(handle)
    };

    if cfg.autostart || display.is_none() {
        supervisor.ensure_started()?;
    } else {
        log::info!("waiting for a display to connect before starting capture");
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping capture...");
    shutdown.store(true, Ordering::SeqCst);
    supervisor.join()?;
    if let Some(display) = display {
        display.stop()?;
    }
    Ok(())
}
