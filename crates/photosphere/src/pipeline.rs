//! Capture pipeline controller tying together the producer, acceptance loop, stitch
//! scheduler and watchdog for one session at a time.
//!
//! The three capture units share only the live queue, the frame store and the stitch
//! signal. Stopping clears one running flag and joins the producer, acceptance and
//! watchdog threads; the producer closes the video source on its way out, so the camera
//! is released exactly once. A fusion run still in flight is not waited for beyond
//! [`STOP_GRACE`]: it finishes in the background and its result is dropped. The
//! in-progress flag is shared by every session's scheduler, so such a leftover run still
//! counts against the one-run-at-a-time limit.

use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use pano_core::Stitcher;
use thiserror::Error;
use tracing::{error, info, info_span, warn};
use video_ingest::{
    CaptureError, LatestFrameQueue, ProducerExit, ProducerStats, SourceOpener, run_producer,
};

use crate::{
    acceptance::AcceptanceLoop,
    config::CaptureConfig,
    events::StatusEvent,
    panorama::{PanoramaSlot, SaveError},
    preview::LivePreview,
    scheduler::StitchScheduler,
    session::{CaptureSession, SessionAction, SessionState},
    telemetry,
    watchdog::{PipelineHealth, spawn_watchdog},
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to open video source: {0}")]
    Connection(#[source] CaptureError),
    #[error(transparent)]
    Save(#[from] SaveError),
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        state: SessionState,
        action: SessionAction,
    },
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// How long stopping waits for an in-flight fusion run before leaving it behind.
pub const STOP_GRACE: Duration = Duration::from_millis(250);

/// Threads of a running session.
struct Workers {
    running: Arc<AtomicBool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    scheduler: Option<JoinHandle<()>>,
}

impl Workers {
    fn spawn<F>(&mut self, name: &'static str, thread_name: &str, f: F) -> Result<(), PipelineError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = telemetry::spawn_thread(thread_name, f)
            .map_err(|source| PipelineError::Spawn { name, source })?;
        self.handles.push((name, handle));
        Ok(())
    }

    fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        for (name, handle) in self.handles {
            if handle.join().is_err() {
                error!("{name} thread panicked");
            }
        }
        let Some(scheduler) = self.scheduler else {
            return;
        };
        let deadline = Instant::now() + STOP_GRACE;
        while !scheduler.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if !scheduler.is_finished() {
            warn!("stitch run still in flight; finishing in the background");
        } else if scheduler.join().is_err() {
            error!("scheduler thread panicked");
        }
    }
}

pub struct CapturePipeline {
    config: CaptureConfig,
    opener: Arc<dyn SourceOpener>,
    stitcher: Arc<dyn Stitcher>,
    panorama: Arc<PanoramaSlot>,
    live: Arc<LivePreview>,
    stitch_in_progress: Arc<AtomicBool>,
    events: Sender<StatusEvent>,
    state: SessionState,
    session: Option<Arc<CaptureSession>>,
    workers: Option<Workers>,
}

impl CapturePipeline {
    pub fn new(
        config: CaptureConfig,
        opener: Arc<dyn SourceOpener>,
        stitcher: Arc<dyn Stitcher>,
        events: Sender<StatusEvent>,
    ) -> Self {
        Self {
            config,
            opener,
            stitcher,
            panorama: Arc::new(PanoramaSlot::new()),
            live: Arc::new(LivePreview::default()),
            stitch_in_progress: Arc::new(AtomicBool::new(false)),
            events,
            state: SessionState::Idle,
            session: None,
            workers: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn panorama(&self) -> Arc<PanoramaSlot> {
        self.panorama.clone()
    }

    pub fn live(&self) -> Arc<LivePreview> {
        self.live.clone()
    }

    /// The current session, kept after `end` so its frames and counters stay readable.
    pub fn session(&self) -> Option<&Arc<CaptureSession>> {
        self.session.as_ref()
    }

    /// True while any fusion run is in flight, including one left over from a stopped
    /// session.
    pub fn is_stitching(&self) -> bool {
        self.stitch_in_progress.load(Ordering::Acquire)
    }

    pub fn total_frames(&self) -> u64 {
        self.session
            .as_ref()
            .map_or(0, |session| session.counters.total_frames())
    }

    fn transition(&self, action: SessionAction) -> Result<SessionState, PipelineError> {
        self.state
            .next(action)
            .ok_or(PipelineError::InvalidTransition {
                state: self.state,
                action,
            })
    }

    fn emit(&self, event: StatusEvent) {
        let _ = self.events.send(event);
    }

    /// Opens the source and launches the capture threads with fresh session state.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        let next = self.transition(SessionAction::Start)?;
        let source = self
            .opener
            .open(&self.config.source)
            .map_err(PipelineError::Connection)?;

        let session = Arc::new(CaptureSession::new(self.config.session.clone()));
        self.panorama.reset();
        self.live.clear();
        metrics::gauge!("photosphere_frame_store_len").set(0.0);

        let queue = LatestFrameQueue::new(self.config.queue_capacity);
        let running = Arc::new(AtomicBool::new(true));
        let producer_stats = Arc::new(ProducerStats::default());
        let health = Arc::new(PipelineHealth::new(producer_stats.clone()));
        let scheduler = Arc::new(
            StitchScheduler::new(
                session.store.clone(),
                self.panorama.clone(),
                self.stitcher.clone(),
                &session.settings,
            )
            .with_run_flag(self.stitch_in_progress.clone())
            .with_events(self.events.clone()),
        );
        let acceptance = AcceptanceLoop::new(
            session.clone(),
            queue.clone(),
            self.live.clone(),
            scheduler.signal(),
            self.events.clone(),
            health.clone(),
        );

        // Announced before any worker can report frames for this session.
        self.emit(StatusEvent::SessionStarted {
            source: self.config.source.clone(),
        });
        let mut workers = Workers {
            running: running.clone(),
            handles: Vec::with_capacity(3),
            scheduler: None,
        };
        let launched = (|| -> Result<(), PipelineError> {
            let producer_running = running.clone();
            let producer_events = self.events.clone();
            let adjust = self.config.adjust;
            let label = self.config.source.clone();
            workers.spawn("producer", "photosphere-producer", move || {
                let span = info_span!("capture.producer", source = %label);
                let _guard = span.enter();
                let exit = run_producer(source, queue, producer_running, adjust, producer_stats);
                let event = match exit {
                    ProducerExit::Stopped => return,
                    ProducerExit::EndOfStream => StatusEvent::SourceEnded,
                    ProducerExit::Failed(message) => StatusEvent::SourceFailed { message },
                };
                let _ = producer_events.send(event);
            })?;

            let acceptance_running = running.clone();
            workers.spawn("acceptance", "photosphere-accept", move || {
                acceptance.run(acceptance_running)
            })?;

            let scheduler_running = running.clone();
            let scheduler_health = health.clone();
            let handle = telemetry::spawn_thread("photosphere-stitch", move || {
                scheduler.run_loop(&scheduler_running, Some(&scheduler_health))
            })
            .map_err(|source| PipelineError::Spawn {
                name: "scheduler",
                source,
            })?;
            workers.scheduler = Some(handle);

            let watchdog = spawn_watchdog(health, running.clone(), self.events.clone())
                .map_err(|source| PipelineError::Spawn {
                    name: "watchdog",
                    source,
                })?;
            workers.handles.push(("watchdog", watchdog));
            Ok(())
        })();
        if let Err(err) = launched {
            workers.shutdown();
            self.emit(StatusEvent::SessionStopped);
            return Err(err);
        }

        info!(source = %self.config.source, stitcher = self.stitcher.name(), "capture started");
        self.session = Some(session);
        self.workers = Some(workers);
        self.state = next;
        Ok(())
    }

    fn shutdown_workers(&mut self) {
        if let Some(workers) = self.workers.take() {
            workers.shutdown();
        }
    }

    /// Stops capture, releases the source and discards the session.
    pub fn stop(&mut self) -> Result<(), PipelineError> {
        let next = self.transition(SessionAction::Stop)?;
        if self.state == SessionState::Idle && self.workers.is_none() {
            return Ok(());
        }
        self.shutdown_workers();
        self.session = None;
        self.state = next;
        info!("capture stopped");
        self.emit(StatusEvent::SessionStopped);
        Ok(())
    }

    /// Stops the capture loops but keeps the session and the last panorama for export.
    pub fn end(&mut self) -> Result<(), PipelineError> {
        let next = self.transition(SessionAction::End)?;
        self.shutdown_workers();
        self.state = next;
        info!(total_frames = self.total_frames(), "capture ended");
        self.emit(StatusEvent::SessionEnded);
        Ok(())
    }

    /// Ends the session and writes the panorama. Without a panorama nothing changes and
    /// [`SaveError::NoPanorama`] is returned.
    pub fn end_and_save(&mut self, path: Option<&Path>) -> Result<PathBuf, PipelineError> {
        self.transition(SessionAction::End)?;
        if self.panorama.snapshot().is_empty() {
            warn!("No panorama to save");
            return Err(SaveError::NoPanorama.into());
        }
        self.end()?;
        self.save(path)
    }

    /// Writes the current panorama to `path`, or to the configured output.
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf, PipelineError> {
        let target = path.unwrap_or(&self.config.output);
        let written = self.panorama.save(target)?;
        self.emit(StatusEvent::Saved {
            path: written.clone(),
        });
        Ok(written)
    }

    /// Resets frames, counters and the panorama without reopening the source.
    pub fn clear(&mut self) -> Result<(), PipelineError> {
        self.transition(SessionAction::Clear)?;
        if let Some(session) = &self.session {
            session.reset();
        }
        self.panorama.reset();
        self.live.clear();
        metrics::gauge!("photosphere_frame_store_len").set(0.0);
        info!("session cleared");
        self.emit(StatusEvent::Cleared);
        Ok(())
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.shutdown_workers();
    }
}
