//! Frame sources for live panorama capture.
//!
//! Every backend implements [`FrameSource`] and yields immutable BGR [`Frame`]s. The
//! [`LatestFrameQueue`] hands frames from a producer thread to consumers that only care
//! about the newest one.

pub mod adjust;
#[cfg(feature = "opencv")]
pub mod camera;
pub mod ffmpeg;
pub mod mjpeg;
pub mod producer;
pub mod queue;
pub mod sequence;
pub mod source;
pub mod types;

pub use adjust::FrameAdjust;
pub use producer::{ProducerExit, ProducerStats, run_producer};
pub use queue::{LatestFrameQueue, PushOutcome};
pub use sequence::ImageSequenceSource;
pub use source::{
    FrameSource, SourceKind, SourceOpener, SourceOptions, StandardOpener, open_source,
    parse_device_index,
};
pub use types::{CaptureError, Frame, FrameFormat};
