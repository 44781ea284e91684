//! Capture session lifecycle.
//!
//! A [`CaptureSession`] is built when capture starts and dropped when it stops; nothing
//! about a session outlives it except the panorama slot.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
};

use chrono::Utc;

use crate::{config::SessionSettings, frame_store::FrameStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Capturing,
    Ended,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Idle => "idle",
            SessionState::Capturing => "capturing",
            SessionState::Ended => "ended",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionAction {
    Start,
    Stop,
    End,
    Clear,
}

impl fmt::Display for SessionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionAction::Start => "start",
            SessionAction::Stop => "stop",
            SessionAction::End => "end",
            SessionAction::Clear => "clear",
        })
    }
}

impl SessionState {
    /// State reached by applying `action`, or `None` when the action is not allowed here.
    pub fn next(self, action: SessionAction) -> Option<SessionState> {
        use SessionAction::*;
        use SessionState::*;
        match (self, action) {
            (Idle | Ended, Start) => Some(Capturing),
            (_, Stop) => Some(Idle),
            (Capturing, End) => Some(Ended),
            (Idle | Ended, Clear) => Some(self),
            _ => None,
        }
    }
}

/// Counters updated by the acceptance loop and read by status consumers.
#[derive(Debug, Default)]
pub struct SessionCounters {
    total_frames: AtomicU64,
    last_capture_ms: AtomicI64,
}

impl SessionCounters {
    pub fn record_capture(&self) -> u64 {
        self.last_capture_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.total_frames.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Relaxed)
    }

    /// Wall-clock millis of the last accepted frame, or 0 before the first one.
    pub fn last_capture_ms(&self) -> i64 {
        self.last_capture_ms.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.total_frames.store(0, Ordering::Relaxed);
        self.last_capture_ms.store(0, Ordering::Relaxed);
    }
}

/// Everything one capture run shares between its loops.
#[derive(Debug)]
pub struct CaptureSession {
    pub settings: SessionSettings,
    pub store: Arc<FrameStore>,
    pub counters: Arc<SessionCounters>,
    pub started_ms: i64,
}

impl CaptureSession {
    pub fn new(settings: SessionSettings) -> Self {
        let store = Arc::new(FrameStore::new(settings.max_frames));
        Self {
            settings,
            store,
            counters: Arc::new(SessionCounters::default()),
            started_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Empties the frame store and zeroes the counters.
    pub fn reset(&self) {
        self.store.clear();
        self.counters.reset();
    }
}
