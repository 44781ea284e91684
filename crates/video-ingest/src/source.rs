//! Source identifiers and the common reading contract shared by every backend.

use std::{path::PathBuf, time::Duration};

use tracing::{info, warn};

use crate::{
    ffmpeg::FfmpegSource,
    mjpeg::MjpegSource,
    sequence::ImageSequenceSource,
    types::{CaptureError, Frame},
};

/// A video source that yields frames one at a time.
///
/// `read_frame` may block for at most the source's read timeout. A
/// [`CaptureError::Read`] is transient and the caller is expected to retry;
/// [`CaptureError::EndOfStream`] means no further frames will arrive.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Releases the underlying device or process. Safe to call more than once.
    fn close(&mut self) {}

    fn describe(&self) -> &str;
}

/// Opens a [`FrameSource`] from a user-supplied identifier.
pub trait SourceOpener: Send + Sync {
    fn open(&self, identifier: &str) -> Result<Box<dyn FrameSource>, CaptureError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Local capture device by index. `webcam` maps to index 0.
    Device(u32),
    /// HTTP(S) multipart MJPEG stream.
    Mjpeg(String),
    /// RTSP stream decoded through ffmpeg.
    Rtsp(String),
    /// UDP stream decoded through ffmpeg.
    Udp(String),
    /// Directory of still images replayed in name order.
    ImageSequence(PathBuf),
    /// Any other path or URL ffmpeg can read, e.g. a recorded video file.
    File(String),
}

impl SourceKind {
    pub fn parse(identifier: &str) -> Self {
        let trimmed = identifier.trim();
        if trimmed.eq_ignore_ascii_case("webcam") {
            return SourceKind::Device(0);
        }
        if let Some(index) = parse_device_index(trimmed) {
            return SourceKind::Device(index);
        }
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return SourceKind::Mjpeg(trimmed.to_string());
        }
        if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            return SourceKind::Rtsp(trimmed.to_string());
        }
        if lower.starts_with("udp://") {
            return SourceKind::Udp(trimmed.to_string());
        }
        let path = PathBuf::from(trimmed);
        if path.is_dir() {
            return SourceKind::ImageSequence(path);
        }
        SourceKind::File(trimmed.to_string())
    }
}

/// Parse a `/dev/videoX` style URI or bare index and return the zero-based index if present.
pub fn parse_device_index(uri: &str) -> Option<u32> {
    if let Ok(index) = uri.parse::<u32>() {
        return Some(index);
    }
    let stripped = uri.strip_prefix("/dev/video")?;
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return stripped.parse::<u32>().ok();
    }
    None
}

/// Capture settings shared by all backends.
#[derive(Clone, Debug)]
pub struct SourceOptions {
    /// Requested capture width in pixels.
    pub width: u32,
    /// Requested capture height in pixels.
    pub height: u32,
    /// Upper bound on how long a single `read_frame` call may block.
    pub read_timeout: Duration,
    /// How long to wait for the first frame when validating a newly opened source.
    pub startup_timeout: Duration,
    /// Pacing between frames of an image sequence.
    pub sequence_interval: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            read_timeout: Duration::from_secs(1),
            startup_timeout: Duration::from_secs(5),
            sequence_interval: Duration::from_millis(100),
        }
    }
}

/// Opens sources with the built-in backends.
#[derive(Clone, Debug, Default)]
pub struct StandardOpener {
    pub options: SourceOptions,
}

impl StandardOpener {
    pub fn new(options: SourceOptions) -> Self {
        Self { options }
    }
}

impl SourceOpener for StandardOpener {
    fn open(&self, identifier: &str) -> Result<Box<dyn FrameSource>, CaptureError> {
        open_source(identifier, &self.options)
    }
}

/// Opens the source named by `identifier`.
///
/// Device indices fall back to the next index when the requested one cannot be opened.
pub fn open_source(
    identifier: &str,
    options: &SourceOptions,
) -> Result<Box<dyn FrameSource>, CaptureError> {
    let kind = SourceKind::parse(identifier);
    info!(source = identifier, kind = ?kind, "opening video source");
    match kind {
        SourceKind::Device(index) => {
            open_device_with_fallback(identifier, index, |idx| open_device(idx, options))
        }
        SourceKind::Mjpeg(url) => Ok(Box::new(MjpegSource::open(&url, options)?)),
        SourceKind::Rtsp(url) => Ok(Box::new(FfmpegSource::rtsp(&url, options)?)),
        SourceKind::Udp(url) => Ok(Box::new(FfmpegSource::udp(&url, options)?)),
        SourceKind::ImageSequence(dir) => Ok(Box::new(ImageSequenceSource::open(
            &dir,
            options.sequence_interval,
        )?)),
        SourceKind::File(path) => Ok(Box::new(FfmpegSource::file(&path, options)?)),
    }
}

/// Tries `index`, then `index + 1`, returning [`CaptureError::Open`] if both fail.
pub fn open_device_with_fallback<F>(
    identifier: &str,
    index: u32,
    mut open: F,
) -> Result<Box<dyn FrameSource>, CaptureError>
where
    F: FnMut(u32) -> Result<Box<dyn FrameSource>, CaptureError>,
{
    for candidate in [index, index.saturating_add(1)] {
        match open(candidate) {
            Ok(source) => {
                if candidate != index {
                    info!(requested = index, opened = candidate, "using fallback capture device");
                }
                return Ok(source);
            }
            Err(err) => warn!(device = candidate, error = %err, "capture device unavailable"),
        }
    }
    Err(CaptureError::Open {
        uri: identifier.to_string(),
    })
}

#[cfg(feature = "opencv")]
fn open_device(index: u32, options: &SourceOptions) -> Result<Box<dyn FrameSource>, CaptureError> {
    Ok(Box::new(crate::camera::OpenCvCamera::open(index, options)?))
}

#[cfg(not(feature = "opencv"))]
fn open_device(index: u32, options: &SourceOptions) -> Result<Box<dyn FrameSource>, CaptureError> {
    Ok(Box::new(FfmpegSource::v4l2(index, options)?))
}
