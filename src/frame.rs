//! Captured frames.
//!
//! - `Frame`: immutable pixel buffer shared by reference count. Produced by a
//!   `FrameSource`, read by the detector, the state machine, the remote channel
//!   and the image sink. Nothing mutates pixels after capture.
//! - JPEG/base64 encoding for previews and persisted sides.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Default JPEG quality for previews and saved sides.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Channel layout of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    Gray8,
    Rgb8,
}

impl PixelLayout {
    pub fn channels(self) -> usize {
        match self {
            PixelLayout::Gray8 => 1,
            PixelLayout::Rgb8 => 3,
        }
    }

    fn color_type(self) -> ExtendedColorType {
        match self {
            PixelLayout::Gray8 => ExtendedColorType::L8,
            PixelLayout::Rgb8 => ExtendedColorType::Rgb8,
        }
    }
}

/// Immutable frame. Cloning shares the pixel buffer.
#[derive(Clone)]
pub struct Frame {
    data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    /// Process-wide monotonic sequence number.
    pub seq: u64,
    /// Monotonic capture instant.
    pub captured_at: Instant,
}

impl std::fmt::Debug for Frame {
    // Pixel data is deliberately left out.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layout", &self.layout)
            .field("seq", &self.seq)
            .finish()
    }
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, layout: PixelLayout) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(layout.channels()))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
            layout,
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            captured_at: Instant::now(),
        })
    }

    pub fn rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        Self::new(data, width, height, PixelLayout::Rgb8)
    }

    pub fn gray(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        Self::new(data, width, height, PixelLayout::Gray8)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn channels(&self) -> usize {
        self.layout.channels()
    }

    pub fn same_shape(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height && self.layout == other.layout
    }

    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode(&self.data, self.width, self.height, self.layout.color_type())
            .context("encode frame as jpeg")?;
        Ok(out)
    }

    /// JPEG payload as standard base64, the preview wire format.
    pub fn to_base64_jpeg(&self, quality: u8) -> Result<String> {
        let jpeg = self.to_jpeg(quality)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_length_mismatch() {
        assert!(Frame::rgb(vec![0; 10], 2, 2).is_err());
        assert!(Frame::gray(vec![0; 4], 2, 2).is_ok());
        assert!(Frame::rgb(Vec::new(), 0, 0).is_err());
    }

    #[test]
    fn clones_share_pixels_and_sequence() {
        let frame = Frame::rgb(vec![7; 12], 2, 2).unwrap();
        let copy = frame.clone();
        assert_eq!(copy.seq, frame.seq);
        assert_eq!(copy.pixels().as_ptr(), frame.pixels().as_ptr());
    }

    #[test]
    fn sequence_numbers_increase() {
        let a = Frame::gray(vec![0; 4], 2, 2).unwrap();
        let b = Frame::gray(vec![0; 4], 2, 2).unwrap();
        assert!(b.seq > a.seq);
    }

    #[test]
    fn base64_preview_decodes_to_jpeg() {
        let frame = Frame::rgb(vec![128; 16 * 16 * 3], 16, 16).unwrap();
        let encoded = frame.to_base64_jpeg(DEFAULT_JPEG_QUALITY).unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
