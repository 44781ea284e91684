//! Status events sent from worker loops to the single consumer that owns user-facing
//! state, and the board that consumer folds them into.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use pano_core::StitchFailure;
use serde::Serialize;

use crate::{session::SessionState, watchdog::Stage};

/// Frames at which the progress estimate reports 100%.
pub const FRAMES_FOR_FULL_CIRCLE: u64 = 30;

/// Rough completion estimate for a full rotation, in percent.
pub fn progress_percent(total_frames: u64) -> u8 {
    (total_frames.saturating_mul(100) / FRAMES_FOR_FULL_CIRCLE).min(100) as u8
}

/// Operator hint shown after a frame is captured.
pub fn capture_hint(total_frames: u64) -> &'static str {
    match total_frames {
        0 | 1 => "First frame captured - rotate slowly in one direction",
        2..=4 => "Keep rotating slowly",
        5..=14 => "360° panorama building",
        _ => "Nearly complete circle",
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StatusEvent {
    SessionStarted {
        source: String,
    },
    FrameAccepted {
        sequence: u64,
        total_frames: u64,
        stored: usize,
    },
    StitchStarted {
        frames: usize,
        loop_closed: bool,
    },
    StitchSucceeded {
        generation: u64,
        width: u32,
        height: u32,
        frames: usize,
    },
    StitchFailed {
        reason: StitchFailure,
    },
    StageStalled {
        stage: Stage,
    },
    SourceEnded,
    SourceFailed {
        message: String,
    },
    SessionStopped,
    SessionEnded,
    Cleared,
    Saved {
        path: PathBuf,
    },
    Warning {
        message: String,
    },
}

/// Board shared read-only with the preview server.
pub type SharedBoard = Arc<Mutex<StatusBoard>>;

#[derive(Clone, Debug, Serialize)]
pub struct StatusBoard {
    pub state: SessionState,
    pub source: Option<String>,
    pub total_frames: u64,
    pub stored_frames: usize,
    pub progress_percent: u8,
    pub capture_status: String,
    pub stitch_status: String,
    pub generation: u64,
    pub panorama_size: Option<(u32, u32)>,
    pub last_saved: Option<PathBuf>,
    pub warning: Option<String>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            source: None,
            total_frames: 0,
            stored_frames: 0,
            progress_percent: 0,
            capture_status: "Ready".to_string(),
            stitch_status: "Stitching: Idle".to_string(),
            generation: 0,
            panorama_size: None,
            last_saved: None,
            warning: None,
        }
    }
}

impl StatusBoard {
    pub fn apply(&mut self, event: &StatusEvent) {
        match event {
            StatusEvent::SessionStarted { source } => {
                let generation = self.generation;
                *self = StatusBoard {
                    state: SessionState::Capturing,
                    source: Some(source.clone()),
                    capture_status: "Capturing - hold steady for the first frame".to_string(),
                    generation,
                    ..StatusBoard::default()
                };
            }
            StatusEvent::FrameAccepted {
                total_frames,
                stored,
                ..
            } => {
                self.total_frames = *total_frames;
                self.stored_frames = *stored;
                self.progress_percent = progress_percent(*total_frames);
                self.capture_status =
                    format!("Frame {total_frames} captured - {}", capture_hint(*total_frames));
            }
            StatusEvent::StitchStarted { .. } => {
                self.stitch_status = "Stitching: Working...".to_string();
            }
            StatusEvent::StitchSucceeded {
                generation,
                width,
                height,
                ..
            } => {
                self.generation = *generation;
                self.panorama_size = Some((*width, *height));
                self.stitch_status = "Stitching: Success".to_string();
            }
            StatusEvent::StitchFailed { reason } => {
                self.stitch_status = format!("Stitching: {}", reason.status_message());
            }
            StatusEvent::StageStalled { stage } => {
                self.warning = Some(format!("{} stage stalled", stage.label()));
            }
            StatusEvent::SourceEnded => {
                self.warning = Some("Video source ended".to_string());
            }
            StatusEvent::SourceFailed { message } => {
                self.warning = Some(format!("Video source failed: {message}"));
            }
            StatusEvent::SessionStopped => {
                self.state = SessionState::Idle;
                self.capture_status = "Stopped".to_string();
            }
            StatusEvent::SessionEnded => {
                self.state = SessionState::Ended;
                self.capture_status = "Capture ended".to_string();
            }
            StatusEvent::Cleared => {
                self.total_frames = 0;
                self.stored_frames = 0;
                self.progress_percent = 0;
                self.panorama_size = None;
                self.capture_status = "Cleared".to_string();
                self.stitch_status = "Stitching: Idle".to_string();
            }
            StatusEvent::Saved { path } => {
                self.last_saved = Some(path.clone());
            }
            StatusEvent::Warning { message } => {
                self.warning = Some(message.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_saturates_at_thirty_frames() {
        assert_eq!(progress_percent(0), 0);
        assert_eq!(progress_percent(3), 10);
        assert_eq!(progress_percent(15), 50);
        assert_eq!(progress_percent(30), 100);
        assert_eq!(progress_percent(45), 100);
    }

    #[test]
    fn hints_follow_capture_count() {
        assert!(capture_hint(1).starts_with("First frame"));
        assert_eq!(capture_hint(4), "Keep rotating slowly");
        assert_eq!(capture_hint(5), "360° panorama building");
        assert_eq!(capture_hint(15), "Nearly complete circle");
    }

    #[test]
    fn failure_updates_status_but_keeps_panorama_info() {
        let mut board = StatusBoard::default();
        board.apply(&StatusEvent::SessionStarted {
            source: "webcam".into(),
        });
        board.apply(&StatusEvent::StitchSucceeded {
            generation: 4,
            width: 900,
            height: 300,
            frames: 5,
        });
        board.apply(&StatusEvent::StitchFailed {
            reason: StitchFailure::HomographyEstimationFailed,
        });
        assert_eq!(board.generation, 4);
        assert_eq!(board.panorama_size, Some((900, 300)));
        assert_eq!(board.stitch_status, "Stitching: Poor overlap - rotate slower");
    }

    #[test]
    fn board_serializes_for_status_endpoint() {
        let mut board = StatusBoard::default();
        board.apply(&StatusEvent::FrameAccepted {
            sequence: 12,
            total_frames: 6,
            stored: 6,
        });
        let json = serde_json::to_value(&board).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["progress_percent"], 20);
        assert_eq!(json["total_frames"], 6);
    }
}
