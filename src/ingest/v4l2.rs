//! V4L2 camera source.
//!
//! Opens a local device node (e.g., /dev/video0), negotiates a format the
//! normaliser understands (RGB3, then YUYV, then MJPG), and streams frames
//! through memory-mapped buffers.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{FrameSource, SourceStats};
use crate::frame::Frame;

/// Configuration for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device node, `/dev/video0` unless configured otherwise.
    pub device: String,
    /// Requested frame rate. Zero keeps the driver default.
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 15,
            width: 640,
            height: 480,
        }
    }
}

const PREFERRED_FOURCCS: [&[u8; 4]; 3] = [b"RGB3", b"YUYV", b"MJPG"];

pub struct V4l2Source {
    config: V4l2Config,
    state: Option<DeviceV4l2State>,
    format: PixelFormat,
    frame_count: u64,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            format: PixelFormat::Rgb24,
            frame_count: 0,
        }
    }

    fn negotiate(&self, device: &mut v4l::Device) -> Result<(v4l::Format, PixelFormat)> {
        use v4l::video::Capture;

        let base = device.format().context("read v4l2 format")?;
        for fourcc in PREFERRED_FOURCCS {
            let mut wanted = base;
            wanted.width = self.config.width;
            wanted.height = self.config.height;
            wanted.fourcc = v4l::FourCC::new(fourcc);
            match device.set_format(&wanted) {
                Ok(actual) => {
                    if let Some(format) = PixelFormat::from_fourcc(&actual.fourcc.repr) {
                        return Ok((actual, format));
                    }
                }
                Err(err) => {
                    log::debug!(
                        "V4l2Source: {} rejected {}: {}",
                        self.config.device,
                        String::from_utf8_lossy(fourcc),
                        err
                    );
                }
            }
        }
        Err(anyhow!(
            "v4l2 device {} offers no supported pixel format",
            self.config.device
        ))
    }
}

impl FrameSource for V4l2Source {
    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let path = self.config.device.as_str();
        let mut device =
            v4l::Device::with_path(path).with_context(|| format!("opening camera {path}"))?;
        let (format, pixel_format) = self.negotiate(&mut device)?;

        match self.config.target_fps {
            0 => {}
            fps => {
                let params = v4l::video::capture::Parameters::with_fps(fps);
                if let Err(err) = device.set_params(&params) {
                    log::warn!("V4l2Source: {path} kept its frame rate ({err})");
                }
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.format = pixel_format;

        let state = DeviceV4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: connected to {} ({}x{} {:?})",
            self.config.device,
            self.active_width,
            self.active_height,
            self.format
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let (buf, meta) = state
            .with_mut(|fields| fields.stream.next())
            .context("capture v4l2 frame")?;
        let used = (meta.bytesused as usize).min(buf.len());
        let payload = if used == 0 { buf } else { &buf[..used] };
        let rgb = normalize_to_rgb(payload, self.active_width, self.active_height, self.format)?;

        self.frame_count += 1;
        Frame::rgb(rgb, self.active_width, self.active_height)
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Source: released {}", self.config.device);
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.device.clone(),
        }
    }
}
