use std::sync::Arc;

use anyhow::Error;
use chrono::Utc;
use image::RgbImage;
use thiserror::Error;

/// Immutable BGR8 frame captured from a video source.
///
/// Pixel storage is shared, so cloning a frame is cheap and every clone observes the same
/// bytes. Frames are never mutated after construction; transformations produce new frames.
#[derive(Clone)]
pub struct Frame {
    data: Arc<[u8]>,
    width: u32,
    height: u32,
    sequence: u64,
    timestamp_ms: i64,
    format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub const fn channels(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("video source reached end of stream")]
    EndOfStream,
    #[error("frame buffer holds {actual} bytes but {width}x{height} BGR needs {expected}")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Other(#[from] Error),
}

impl CaptureError {
    /// Transient errors are worth retrying; the source may still deliver frames.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::Read(_))
    }
}

impl Frame {
    /// Wraps a packed BGR buffer. The sequence number starts at zero and the timestamp is
    /// taken from the wall clock.
    pub fn from_bgr(data: Vec<u8>, width: u32, height: u32) -> Result<Self, CaptureError> {
        let expected = width as usize * height as usize * FrameFormat::Bgr8.channels();
        if data.len() != expected {
            return Err(CaptureError::BufferSize {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
            sequence: 0,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }

    /// Converts a decoded RGB image into a BGR frame.
    pub fn from_rgb_image(image: &RgbImage) -> Self {
        let mut data = Vec::with_capacity(image.as_raw().len());
        for pixel in image.pixels() {
            let [r, g, b] = pixel.0;
            data.extend_from_slice(&[b, g, r]);
        }
        Self {
            data: data.into(),
            width: image.width(),
            height: image.height(),
            sequence: 0,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        }
    }

    /// Returns an RGB copy of the pixels, suitable for the `image` crate.
    pub fn to_rgb_image(&self) -> RgbImage {
        let mut rgb = Vec::with_capacity(self.data.len());
        for px in self.data.chunks_exact(3) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        // Length is validated at construction, so the buffer always fits.
        RgbImage::from_raw(self.width, self.height, rgb).unwrap_or_default()
    }

    /// Builds a frame that inherits this frame's identity (sequence and timestamp) but carries
    /// new pixels, e.g. after a resize or projection.
    pub fn derive(&self, data: Vec<u8>, width: u32, height: u32) -> Result<Self, CaptureError> {
        let frame = Self::from_bgr(data, width, height)?;
        Ok(frame
            .with_sequence(self.sequence)
            .with_timestamp(self.timestamp_ms))
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// True when both frames share the same pixel storage.
    pub fn shares_pixels(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("timestamp_ms", &self.timestamp_ms)
            .finish()
    }
}
