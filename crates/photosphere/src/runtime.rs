//! Capture run entry point and the consumer loop that owns the pipeline.
//!
//! Worker loops never touch user-facing state. They send [`StatusEvent`]s here, and the
//! preview server sends [`ControlRequest`]s; this loop is the only writer of the status
//! board and the only caller of pipeline operations.

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex, Once, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, never, select};
use pano_core::Stitcher;
use tracing::{error, info, warn};
use video_ingest::{SourceOpener, StandardOpener};

use crate::{
    config::CaptureConfig,
    events::{SharedBoard, StatusBoard, StatusEvent},
    panorama::SaveError,
    pipeline::{CapturePipeline, PipelineError},
    server::{ControlCommand, ControlRequest, ServerState, spawn_preview_server},
    session::SessionState,
    telemetry,
};

/// How often the consumer checks the shutdown flag when no messages arrive.
const UI_TICK: Duration = Duration::from_millis(100);

/// Runs a capture session until Ctrl+C, or until the source ends when no preview server
/// is keeping the process alive.
pub fn run(config: CaptureConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();
    let run_span = tracing::info_span!(
        "photosphere.capture",
        source = %config.source,
        stitcher = ?config.stitcher,
        warp = config.session.cylindrical_warp,
        loop_closure = config.session.loop_closure
    );
    let _run_span_guard = run_span.enter();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let stitcher: Arc<dyn Stitcher> = Arc::from(config.stitcher.build()?);
    let opener: Arc<dyn SourceOpener> =
        Arc::new(StandardOpener::new(config.source_options.clone()));
    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let (control_tx, control_rx) = crossbeam_channel::unbounded::<ControlRequest>();

    let preview_addr = config.preview_addr;
    let pipeline = CapturePipeline::new(config, opener, stitcher, event_tx);
    let board: SharedBoard = Arc::new(Mutex::new(StatusBoard::default()));

    let server = match preview_addr {
        Some(addr) => Some(spawn_preview_server(
            addr,
            ServerState::new(
                pipeline.live(),
                pipeline.panorama(),
                board.clone(),
                control_tx,
            ),
        )?),
        None => {
            drop(control_tx);
            None
        }
    };

    let mut controller = CaptureController::new(pipeline, board);
    controller
        .pipeline
        .start()
        .context("failed to start capture")?;
    let outcome = controller.drive(&event_rx, &control_rx, &shutdown, server.is_some());

    if let Some(server) = server {
        server.stop();
    }
    outcome
}

/// Owns the pipeline and the status board.
pub struct CaptureController {
    pipeline: CapturePipeline,
    board: SharedBoard,
}

impl CaptureController {
    pub fn new(pipeline: CapturePipeline, board: SharedBoard) -> Self {
        Self { pipeline, board }
    }

    pub fn pipeline(&self) -> &CapturePipeline {
        &self.pipeline
    }

    pub fn board(&self) -> StatusBoard {
        self.board
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pumps events and commands until shutdown is requested, or the session finishes on
    /// its own and `keep_serving` is false.
    pub fn drive(
        &mut self,
        events: &Receiver<StatusEvent>,
        controls: &Receiver<ControlRequest>,
        shutdown: &AtomicBool,
        keep_serving: bool,
    ) -> Result<()> {
        // A disconnected receiver is always ready; park it on `never` instead.
        let mut events = events.clone();
        let mut controls = controls.clone();
        loop {
            select! {
                recv(events) -> event => match event {
                    Ok(event) => self.handle_event(event),
                    Err(_) => events = never(),
                },
                recv(controls) -> request => match request {
                    Ok(request) => {
                        let reply = self.handle_command(request.command);
                        let _ = request.reply.send(reply);
                    }
                    Err(_) => controls = never(),
                },
                default(UI_TICK) => {}
            }

            if shutdown.load(Ordering::SeqCst) {
                info!("shutdown requested");
                self.finish();
                break;
            }
            if !keep_serving && self.pipeline.state() != SessionState::Capturing {
                break;
            }
        }
        // Events emitted while finishing still belong on the board.
        for event in events.try_iter() {
            self.handle_event(event);
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: StatusEvent) {
        match &event {
            StatusEvent::FrameAccepted {
                total_frames,
                stored,
                ..
            } => info!(total_frames, stored, "frame captured"),
            StatusEvent::StitchFailed { reason } => {
                warn!("Stitching: {}", reason.status_message())
            }
            StatusEvent::StageStalled { stage } => warn!("{} stage stalled", stage.label()),
            StatusEvent::SourceFailed { message } => warn!("Video source failed: {message}"),
            _ => {}
        }
        self.board
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(&event);

        let source_gone = matches!(
            event,
            StatusEvent::SourceEnded | StatusEvent::SourceFailed { .. }
        );
        if source_gone && self.pipeline.state() == SessionState::Capturing {
            info!("video source is gone; finishing session");
            self.finish();
        }
    }

    pub fn handle_command(&mut self, command: ControlCommand) -> Result<String, String> {
        let result = match command {
            ControlCommand::Start => self.pipeline.start().map(|()| "capture started".to_string()),
            ControlCommand::Clear => self.pipeline.clear().map(|()| "cleared".to_string()),
            ControlCommand::End { path } => self
                .pipeline
                .end_and_save(path.as_deref())
                .map(|path| format!("saved {}", path.display())),
            ControlCommand::Save { path } => self
                .pipeline
                .save(path.as_deref())
                .map(|path| format!("saved {}", path.display())),
        };
        result.map_err(|err| {
            warn!("Control command failed: {err}");
            err.to_string()
        })
    }

    /// Ends an active session, saving the panorama to the configured output when there
    /// is one and simply stopping otherwise.
    pub fn finish(&mut self) -> Option<PathBuf> {
        if self.pipeline.state() != SessionState::Capturing {
            return None;
        }
        match self.pipeline.end_and_save(None) {
            Ok(path) => {
                info!(path = %path.display(), "panorama written");
                Some(path)
            }
            Err(PipelineError::Save(SaveError::NoPanorama)) => {
                warn!("No panorama to save; stopping capture");
                if let Err(err) = self.pipeline.stop() {
                    error!("Failed to stop capture: {err}");
                }
                None
            }
            Err(err) => {
                error!("Failed to save panorama: {err}");
                None
            }
        }
    }
}
