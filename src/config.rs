use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{ChangeDetector, DEFAULT_MOVEMENT_THRESHOLD, DEFAULT_SIMILARITY_THRESHOLD};
use crate::frame::DEFAULT_JPEG_QUALITY;
use crate::input::DEFAULT_RETAKE_KEY;

const DEFAULT_CAMERA: &str = "stub://staging";
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_SIDE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CHECK_INTERVAL_MS: u64 = 500;
const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_SETTLE_DELAY_MS: u64 = 1500;
const DEFAULT_NEXT_SIDE_DELAY_MS: u64 = 1000;
const DEFAULT_IMAGES_PER_OBJECT: usize = 2;
const DEFAULT_IMAGES_DIR: &str = "./images/";
const DEFAULT_DISPLAY_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_DISPLAY_URL: &str = "ws://127.0.0.1:5000/ws";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DaemonConfigFile {
    camera: Option<String>,
    camera_width: Option<u32>,
    camera_height: Option<u32>,
    movement_threshold: Option<u32>,
    similarity_threshold: Option<f64>,
    side_timeout_secs: Option<u64>,
    inactivity_timeout_secs: Option<u64>,
    check_interval_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    settle_delay_ms: Option<u64>,
    next_side_delay_ms: Option<u64>,
    images_per_object: Option<usize>,
    images_dir: Option<PathBuf>,
    clear_output_dir: Option<bool>,
    display_addr: Option<String>,
    display_url: Option<String>,
    reconnect_interval_ms: Option<u64>,
    retake_key: Option<char>,
    jpeg_quality: Option<u8>,
    autostart: Option<bool>,
}

/// Timing and detection parameters of the capture state machine.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub detector: ChangeDetector,
    pub images_per_object: usize,
    pub side_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub check_interval: Duration,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub next_side_delay: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            detector: ChangeDetector::new(DEFAULT_MOVEMENT_THRESHOLD, DEFAULT_SIMILARITY_THRESHOLD),
            images_per_object: DEFAULT_IMAGES_PER_OBJECT,
            side_timeout: Duration::from_secs(DEFAULT_SIDE_TIMEOUT_SECS),
            inactivity_timeout: Duration::from_secs(DEFAULT_INACTIVITY_TIMEOUT_SECS),
            check_interval: Duration::from_millis(DEFAULT_CHECK_INTERVAL_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            next_side_delay: Duration::from_millis(DEFAULT_NEXT_SIDE_DELAY_MS),
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.images_per_object == 0 {
            return Err(anyhow!("images_per_object must be at least 1"));
        }
        let similarity = self.detector.similarity_threshold;
        if !(0.0..=1.0).contains(&similarity) {
            return Err(anyhow!(
                "similarity_threshold must be within [0, 1], got {}",
                similarity
            ));
        }
        if self.side_timeout.is_zero() {
            return Err(anyhow!("side_timeout_secs must be greater than zero"));
        }
        if self.inactivity_timeout.is_zero() {
            return Err(anyhow!("inactivity_timeout_secs must be greater than zero"));
        }
        if self.check_interval.is_zero() {
            return Err(anyhow!("check_interval_ms must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub images_dir: PathBuf,
    pub clear: bool,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct DisplaySettings {
    pub addr: String,
    pub url: String,
    /// `None` disables reconnect.
    pub reconnect_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub camera: CameraSettings,
    pub capture: CaptureConfig,
    pub output: OutputSettings,
    pub display: DisplaySettings,
    pub retake_key: char,
    pub autostart: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        // The empty file yields every default and cannot fail.
        Self::from_file(DaemonConfigFile::default())
    }
}

impl DaemonConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SIDE_CAPTURE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DaemonConfigFile) -> Self {
        let capture = CaptureConfig {
            detector: ChangeDetector::new(
                file.movement_threshold.unwrap_or(DEFAULT_MOVEMENT_THRESHOLD),
                file.similarity_threshold
                    .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
            ),
            images_per_object: file.images_per_object.unwrap_or(DEFAULT_IMAGES_PER_OBJECT),
            side_timeout: Duration::from_secs(
                file.side_timeout_secs.unwrap_or(DEFAULT_SIDE_TIMEOUT_SECS),
            ),
            inactivity_timeout: Duration::from_secs(
                file.inactivity_timeout_secs
                    .unwrap_or(DEFAULT_INACTIVITY_TIMEOUT_SECS),
            ),
            check_interval: Duration::from_millis(
                file.check_interval_ms.unwrap_or(DEFAULT_CHECK_INTERVAL_MS),
            ),
            poll_interval: Duration::from_millis(
                file.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            settle_delay: Duration::from_millis(
                file.settle_delay_ms.unwrap_or(DEFAULT_SETTLE_DELAY_MS),
            ),
            next_side_delay: Duration::from_millis(
                file.next_side_delay_ms.unwrap_or(DEFAULT_NEXT_SIDE_DELAY_MS),
            ),
        };
        Self {
            camera: CameraSettings {
                url: file.camera.unwrap_or_else(|| DEFAULT_CAMERA.to_string()),
                width: file.camera_width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: file.camera_height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
            },
            capture,
            output: OutputSettings {
                images_dir: file
                    .images_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGES_DIR)),
                clear: file.clear_output_dir.unwrap_or(false),
                jpeg_quality: file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            display: DisplaySettings {
                addr: file
                    .display_addr
                    .unwrap_or_else(|| DEFAULT_DISPLAY_ADDR.to_string()),
                url: file
                    .display_url
                    .unwrap_or_else(|| DEFAULT_DISPLAY_URL.to_string()),
                reconnect_interval: reconnect_interval(file.reconnect_interval_ms.unwrap_or(0)),
            },
            retake_key: file.retake_key.unwrap_or(DEFAULT_RETAKE_KEY),
            autostart: file.autostart.unwrap_or(false),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(camera) = env_string("SIDE_CAPTURE_CAMERA") {
            self.camera.url = camera;
        }
        if let Some(dir) = env_string("SIDE_CAPTURE_IMAGES_DIR") {
            self.output.images_dir = PathBuf::from(dir);
        }
        if let Some(addr) = env_string("SIDE_CAPTURE_DISPLAY_ADDR") {
            self.display.addr = addr;
        }
        if let Some(url) = env_string("SIDE_CAPTURE_DISPLAY_URL") {
            self.display.url = url;
        }
        if let Some(value) = env_parse::<u32>("SIDE_CAPTURE_MOVEMENT_THRESHOLD")? {
            self.capture.detector.movement_threshold = value;
        }
        if let Some(value) = env_parse::<f64>("SIDE_CAPTURE_SIMILARITY_THRESHOLD")? {
            self.capture.detector.similarity_threshold = value;
        }
        if let Some(value) = env_parse::<usize>("SIDE_CAPTURE_IMAGES_PER_OBJECT")? {
            self.capture.images_per_object = value;
        }
        if let Some(secs) = env_parse::<u64>("SIDE_CAPTURE_SIDE_TIMEOUT_SECS")? {
            self.capture.side_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SIDE_CAPTURE_INACTIVITY_TIMEOUT_SECS")? {
            self.capture.inactivity_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("SIDE_CAPTURE_RECONNECT_INTERVAL_MS")? {
            self.display.reconnect_interval = reconnect_interval(ms);
        }
        if let Some(clear) = env_parse::<bool>("SIDE_CAPTURE_CLEAR_OUTPUT_DIR")? {
            self.output.clear = clear;
        }
        if let Some(autostart) = env_parse::<bool>("SIDE_CAPTURE_AUTOSTART")? {
            self.autostart = autostart;
        }
        if let Some(key) = env_parse::<char>("SIDE_CAPTURE_RETAKE_KEY")? {
            self.retake_key = key;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.capture.validate()?;
        if self.camera.url.trim().is_empty() {
            return Err(anyhow!("camera must not be empty"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera_width and camera_height must be non-zero"));
        }
        if !(1..=100).contains(&self.output.jpeg_quality) {
            return Err(anyhow!(
                "jpeg_quality must be within 1..=100, got {}",
                self.output.jpeg_quality
            ));
        }
        if self.display.addr.trim().is_empty() || self.display.url.trim().is_empty() {
            return Err(anyhow!("display_addr and display_url must not be empty"));
        }
        Ok(())
    }
}

fn reconnect_interval(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", key, raw)),
        None => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<DaemonConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
