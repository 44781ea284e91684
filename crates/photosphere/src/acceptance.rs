//! Frame acceptance: decides which live frames join the panorama.
//!
//! The loop polls the live queue at a fixed cadence, runs each new frame through the
//! [`AcceptanceGate`] and, on acceptance, prepares the frame (downscale, optional
//! cylindrical pre-warp), stores it and signals the stitch scheduler.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use pano_core::{imaging::downscale_to_width, should_capture};
use tracing::{debug, info_span, warn};
use video_ingest::{Frame, LatestFrameQueue};

use crate::{
    config::SessionSettings,
    events::StatusEvent,
    frame_store::AppendOutcome,
    preview::LivePreview,
    scheduler::StitchSignal,
    session::CaptureSession,
    watchdog::{PipelineHealth, Stage},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// First frame of a session; nothing to compare against.
    Initial,
    Accept,
    TooSoon,
    StoreFull,
    NoSceneChange,
}

impl Verdict {
    pub fn is_accepted(self) -> bool {
        matches!(self, Verdict::Initial | Verdict::Accept)
    }

    /// Metrics label for rejections.
    pub fn label(self) -> &'static str {
        match self {
            Verdict::Initial => "initial",
            Verdict::Accept => "accepted",
            Verdict::TooSoon => "interval",
            Verdict::StoreFull => "store_full",
            Verdict::NoSceneChange => "no_scene_change",
        }
    }
}

/// Interval, capacity and scene-change checks, with the rolling previous frame.
#[derive(Debug)]
pub struct AcceptanceGate {
    threshold: f64,
    interval: std::time::Duration,
    previous: Option<Frame>,
    last_capture: Option<Instant>,
}

impl AcceptanceGate {
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            threshold: settings.scene_threshold,
            interval: settings.capture_interval,
            previous: None,
            last_capture: None,
        }
    }

    /// Judges `frame` observed at `now` against a store currently holding `stored` of
    /// `capacity` frames.
    ///
    /// Interval and capacity rejections leave the previous frame alone; a scene-change
    /// rejection replaces it with `frame`. An accepting verdict changes nothing until the
    /// frame is actually stored and [`record_capture`](Self::record_capture) is called.
    pub fn evaluate(
        &mut self,
        frame: &Frame,
        now: Instant,
        stored: usize,
        capacity: usize,
    ) -> Verdict {
        if let Some(last) = self.last_capture {
            if now.saturating_duration_since(last) < self.interval {
                return Verdict::TooSoon;
            }
        }
        if stored >= capacity {
            return Verdict::StoreFull;
        }
        let verdict = match &self.previous {
            None => Verdict::Initial,
            Some(previous) if should_capture(previous, frame, self.threshold) => Verdict::Accept,
            Some(_) => Verdict::NoSceneChange,
        };
        if verdict == Verdict::NoSceneChange {
            self.previous = Some(frame.clone());
        }
        verdict
    }

    /// Makes `frame` the reference and restarts the capture interval at `now`.
    pub fn record_capture(&mut self, frame: &Frame, now: Instant) {
        self.previous = Some(frame.clone());
        self.last_capture = Some(now);
    }

    pub fn reset(&mut self) {
        self.previous = None;
        self.last_capture = None;
    }
}

/// Downscales to `max_width` and optionally pre-warps onto a cylinder.
pub fn prepare_frame(frame: &Frame, settings: &SessionSettings) -> Result<Frame> {
    let frame = downscale_to_width(frame, settings.max_frame_width)
        .context("failed to downscale accepted frame")?;
    if !settings.cylindrical_warp {
        return Ok(frame);
    }
    settings
        .projection
        .warp(&frame)
        .context("cylindrical pre-warp failed")
}

/// State owned by the acceptance thread.
pub struct AcceptanceLoop {
    pub(crate) gate: AcceptanceGate,
    pub(crate) session: Arc<CaptureSession>,
    pub(crate) queue: LatestFrameQueue,
    pub(crate) live: Arc<LivePreview>,
    pub(crate) signal: StitchSignal,
    pub(crate) events: Sender<StatusEvent>,
    pub(crate) health: Arc<PipelineHealth>,
}

impl AcceptanceLoop {
    pub fn new(
        session: Arc<CaptureSession>,
        queue: LatestFrameQueue,
        live: Arc<LivePreview>,
        signal: StitchSignal,
        events: Sender<StatusEvent>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            gate: AcceptanceGate::new(&session.settings),
            session,
            queue,
            live,
            signal,
            events,
            health,
        }
    }

    /// Polls until `running` is cleared.
    pub fn run(mut self, running: Arc<AtomicBool>) {
        let span = info_span!(
            "capture.accept",
            poll_ms = self.session.settings.poll_interval.as_millis() as u64
        );
        let _guard = span.enter();
        while running.load(Ordering::Relaxed) {
            self.health.beat(Stage::Acceptance);
            if let Err(err) = self.tick(Instant::now()) {
                warn!("Acceptance loop error: {err:#}");
            }
            thread::sleep(self.session.settings.poll_interval);
        }
        debug!("acceptance loop stopped");
    }

    /// Processes the newest queued frame, if any. Returns the verdict for that frame.
    pub fn tick(&mut self, now: Instant) -> Result<Option<Verdict>> {
        let Some(frame) = self.queue.latest() else {
            return Ok(None);
        };
        self.live.publish(frame.clone());

        let store = &self.session.store;
        let verdict = self.gate.evaluate(&frame, now, store.len(), store.capacity());
        if !verdict.is_accepted() {
            if verdict != Verdict::TooSoon {
                metrics::counter!("photosphere_frames_rejected_total", "reason" => verdict.label())
                    .increment(1);
            }
            return Ok(Some(verdict));
        }

        self.accept(&frame, now)?;
        Ok(Some(verdict))
    }

    fn accept(&mut self, frame: &Frame, now: Instant) -> Result<()> {
        let prepared = prepare_frame(frame, &self.session.settings)?;
        let stored = match self.session.store.append(prepared) {
            AppendOutcome::Appended(len) => len,
            AppendOutcome::AtCapacity => {
                metrics::counter!("photosphere_frames_rejected_total", "reason" => "store_full")
                    .increment(1);
                return Ok(());
            }
        };
        self.gate.record_capture(frame, now);
        let total_frames = self.session.counters.record_capture();

        metrics::counter!("photosphere_frames_accepted_total").increment(1);
        metrics::gauge!("photosphere_frame_store_len").set(stored as f64);
        debug!(
            sequence = frame.sequence(),
            total_frames, stored, "frame accepted"
        );

        let _ = self.events.send(StatusEvent::FrameAccepted {
            sequence: frame.sequence(),
            total_frames,
            stored,
        });
        self.signal.request();
        Ok(())
    }
}
