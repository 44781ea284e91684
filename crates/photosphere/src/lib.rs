//! Live panorama capture.
//!
//! A producer thread reads the video source into a drop-oldest queue. The acceptance loop
//! keeps frames that differ enough from the last one, and the stitch scheduler fuses the
//! stored frames whenever new ones arrive, one fusion at a time. A single consumer owns the
//! [`CapturePipeline`] and the [`StatusBoard`]; the preview server only reads shared state
//! and forwards operator commands.

pub mod acceptance;
pub mod config;
pub mod events;
pub mod frame_store;
pub mod panorama;
pub mod pipeline;
pub mod preview;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod watchdog;

pub use acceptance::{AcceptanceGate, Verdict};
pub use config::{CaptureCliArgs, CaptureConfig, SessionSettings, StitcherBackend};
pub use events::{StatusBoard, StatusEvent};
pub use frame_store::{AppendOutcome, FrameStore};
pub use panorama::{PanoramaSlot, SaveError};
pub use pipeline::{CapturePipeline, PipelineError};
pub use runtime::{CaptureController, run};
pub use scheduler::{RunReport, StitchScheduler, StitchSignal};
pub use session::{SessionAction, SessionState};
