//! Coalesced, single-flight scheduling of fusion runs.
//!
//! Requests latch into a one-slot channel, so any number of requests made while a run
//! is in flight collapse into a single pending run. A compare-and-swap flag guarantees
//! at most one run at a time even when [`StitchScheduler::run_if_idle`] is called from
//! several threads. The flag can be shared between schedulers so that a run left over
//! from a stopped session still blocks the next session's first run.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use pano_core::{
    LoopClosureCheck, LoopClosureDetector, StitchFailure, StitchOutcome, Stitcher,
    loop_closure::MIN_LOOP_FRAMES,
};
use tracing::{debug, error, info, info_span, warn};
use video_ingest::Frame;

use crate::{
    config::SessionSettings,
    events::StatusEvent,
    frame_store::FrameStore,
    panorama::PanoramaSlot,
    watchdog::{PipelineHealth, Stage},
};

/// Poll period of the scheduler loop while another run holds the shared flag.
const BUSY_BACKOFF: Duration = Duration::from_millis(50);

/// Boolean latch carried over a bounded(1) channel.
#[derive(Clone, Debug)]
pub struct StitchSignal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for StitchSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StitchSignal {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self { tx, rx }
    }

    /// Latches a request. Returns false when one was already pending.
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Waits up to `timeout` for a request and consumes it.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunReport {
    /// Another run holds the in-progress flag.
    Busy,
    NotEnoughFrames { stored: usize, required: usize },
    Fused {
        generation: u64,
        frames: usize,
        loop_closed: bool,
    },
    Failed {
        reason: StitchFailure,
        frames: usize,
        loop_closed: bool,
    },
    /// The session stopped while fusing; the result was dropped.
    Discarded { frames: usize },
}

/// Clears the in-progress flag when the run ends, however it ends.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct StitchScheduler {
    store: Arc<FrameStore>,
    panorama: Arc<PanoramaSlot>,
    stitcher: Arc<dyn Stitcher>,
    loop_detector: Option<Arc<dyn LoopClosureCheck>>,
    min_frames: usize,
    wrap_frames: usize,
    wait_timeout: Duration,
    in_progress: Arc<AtomicBool>,
    signal: StitchSignal,
    events: Option<Sender<StatusEvent>>,
}

impl StitchScheduler {
    pub fn new(
        store: Arc<FrameStore>,
        panorama: Arc<PanoramaSlot>,
        stitcher: Arc<dyn Stitcher>,
        settings: &SessionSettings,
    ) -> Self {
        let loop_detector: Option<Arc<dyn LoopClosureCheck>> = if settings.loop_closure {
            Some(Arc::new(LoopClosureDetector::default()))
        } else {
            None
        };
        Self {
            store,
            panorama,
            stitcher,
            loop_detector,
            min_frames: settings.min_frames_before_stitch,
            wrap_frames: settings.wrap_frames,
            wait_timeout: settings.scheduler_timeout,
            in_progress: Arc::new(AtomicBool::new(false)),
            signal: StitchSignal::new(),
            events: None,
        }
    }

    /// Replaces the loop-closure check; `None` disables wraparound duplication.
    pub fn with_loop_detector(mut self, detector: Option<Arc<dyn LoopClosureCheck>>) -> Self {
        self.loop_detector = detector;
        self
    }

    /// Uses `flag` as the in-progress marker, shared with every scheduler holding it.
    pub fn with_run_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.in_progress = flag;
        self
    }

    pub fn with_events(mut self, events: Sender<StatusEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Handle used by producers of work to post requests.
    pub fn signal(&self) -> StitchSignal {
        self.signal.clone()
    }

    pub fn request_stitch(&self) -> bool {
        self.signal.request()
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    fn emit(&self, event: StatusEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Runs one fusion attempt unless one is already in flight or too few frames are stored.
    pub fn run_if_idle(&self) -> RunReport {
        self.run_once(&|| true)
    }

    /// Like [`run_if_idle`](Self::run_if_idle), but the result is only published while
    /// `current()` holds.
    fn run_once(&self, current: &dyn Fn() -> bool) -> RunReport {
        let required = self.min_frames;
        let stored = self.store.len();
        if stored < required {
            return RunReport::NotEnoughFrames { stored, required };
        }
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return RunReport::Busy;
        }
        let _in_progress = InProgress(self.in_progress.as_ref());

        let mut frames = self.store.snapshot();
        if frames.len() < required {
            return RunReport::NotEnoughFrames {
                stored: frames.len(),
                required,
            };
        }

        let span = info_span!("stitch.run", frames = frames.len(), stitcher = self.stitcher.name());
        let _guard = span.enter();

        let loop_closed = self.close_loop(&mut frames);
        let frame_count = frames.len();
        self.emit(StatusEvent::StitchStarted {
            frames: frame_count,
            loop_closed,
        });

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.stitcher.fuse(&frames)))
            .unwrap_or_else(|_| {
                error!("stitcher panicked; treating the run as failed");
                StitchOutcome::Failure(StitchFailure::Unknown(-1))
            });
        metrics::histogram!("photosphere_stitch_seconds").record(started.elapsed().as_secs_f64());

        match outcome {
            StitchOutcome::Success(image) => {
                let (width, height) = image.dimensions();
                let Some(generation) = self.panorama.publish_success_if(image, current) else {
                    return self.discard(frame_count);
                };
                metrics::counter!("photosphere_stitch_runs_total", "outcome" => "success")
                    .increment(1);
                info!(generation, width, height, frames = frame_count, "panorama updated");
                self.emit(StatusEvent::StitchSucceeded {
                    generation,
                    width,
                    height,
                    frames: frame_count,
                });
                RunReport::Fused {
                    generation,
                    frames: frame_count,
                    loop_closed,
                }
            }
            StitchOutcome::Failure(reason) => {
                if !self.panorama.publish_failure_if(reason, current) {
                    return self.discard(frame_count);
                }
                metrics::counter!("photosphere_stitch_runs_total", "outcome" => reason.label())
                    .increment(1);
                warn!(code = reason.code(), "Stitching failed: {}", reason.status_message());
                self.emit(StatusEvent::StitchFailed { reason });
                RunReport::Failed {
                    reason,
                    frames: frame_count,
                    loop_closed,
                }
            }
        }
    }

    fn discard(&self, frames: usize) -> RunReport {
        metrics::counter!("photosphere_stitch_runs_total", "outcome" => "discarded").increment(1);
        info!(frames, "session stopped during fusion; result discarded");
        RunReport::Discarded { frames }
    }

    /// Appends the leading frames when the detector reports a closed circle.
    fn close_loop(&self, frames: &mut Vec<Frame>) -> bool {
        let Some(detector) = &self.loop_detector else {
            return false;
        };
        if frames.len() <= MIN_LOOP_FRAMES || !detector.is_loop_closed(frames) {
            return false;
        }
        let lead: Vec<Frame> = frames.iter().take(self.wrap_frames).cloned().collect();
        debug!(appended = lead.len(), "full circle detected; duplicating leading frames");
        frames.extend(lead);
        true
    }

    /// Serves requests until `running` is cleared. Blocks at most the wait timeout
    /// between checks, plus the duration of an in-flight run. Results finished after
    /// `running` was cleared are discarded.
    pub fn run_loop(&self, running: &AtomicBool, health: Option<&PipelineHealth>) {
        let current = || running.load(Ordering::SeqCst);
        while running.load(Ordering::Relaxed) {
            if let Some(health) = health {
                health.beat(Stage::Scheduler);
            }
            // A run held by another scheduler sharing the flag; leave requests pending.
            if self.is_running() {
                thread::sleep(self.wait_timeout.min(BUSY_BACKOFF));
                continue;
            }
            if !self.signal.wait(self.wait_timeout) || !running.load(Ordering::Relaxed) {
                continue;
            }
            let report = self.run_once(&current);
            if report == RunReport::Busy {
                self.signal.request();
            }
            debug!(?report, "stitch request handled");
        }
        debug!("stitch scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use image::{Rgb, RgbImage};

    use super::*;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Duration,
        last_len: AtomicUsize,
    }

    impl Stitcher for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn fuse(&self, frames: &[Frame]) -> StitchOutcome {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_len.store(frames.len(), Ordering::SeqCst);
            thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);
            StitchOutcome::Success(RgbImage::from_pixel(4, 2, Rgb([frames.len() as u8, 0, 0])))
        }
    }

    struct Failing(StitchFailure);

    impl Stitcher for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn fuse(&self, _frames: &[Frame]) -> StitchOutcome {
            StitchOutcome::Failure(self.0)
        }
    }

    struct Panicking;

    impl Stitcher for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn fuse(&self, _frames: &[Frame]) -> StitchOutcome {
            panic!("fusion blew up");
        }
    }

    struct AlwaysClosed;

    impl LoopClosureCheck for AlwaysClosed {
        fn is_loop_closed(&self, _frames: &[Frame]) -> bool {
            true
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::from_bgr(vec![seq as u8; 3], 1, 1).unwrap().with_sequence(seq)
    }

    fn settings(min_frames: usize) -> SessionSettings {
        SessionSettings {
            min_frames_before_stitch: min_frames,
            loop_closure: false,
            scheduler_timeout: Duration::from_millis(20),
            ..SessionSettings::default()
        }
    }

    fn scheduler(stitcher: Arc<dyn Stitcher>, min_frames: usize) -> (StitchScheduler, Arc<FrameStore>, Arc<PanoramaSlot>) {
        let store = Arc::new(FrameStore::new(50));
        let panorama = Arc::new(PanoramaSlot::new());
        let scheduler = StitchScheduler::new(store.clone(), panorama.clone(), stitcher, &settings(min_frames));
        (scheduler, store, panorama)
    }

    #[test]
    fn requests_collapse_into_one_pending_run() {
        let signal = StitchSignal::new();
        assert!(signal.request());
        assert!(!signal.request());
        assert!(!signal.request());
        assert!(signal.wait(Duration::from_millis(1)));
        assert!(!signal.wait(Duration::from_millis(1)));
    }

    #[test]
    fn no_run_until_minimum_frames_are_stored() {
        let stitcher = Arc::new(Counting::default());
        let (scheduler, store, _) = scheduler(stitcher.clone(), 3);

        store.append(frame(0));
        store.append(frame(1));
        assert_eq!(
            scheduler.run_if_idle(),
            RunReport::NotEnoughFrames {
                stored: 2,
                required: 3
            }
        );
        assert_eq!(stitcher.calls.load(Ordering::SeqCst), 0);

        store.append(frame(2));
        assert!(matches!(scheduler.run_if_idle(), RunReport::Fused { generation: 1, frames: 3, .. }));
        assert_eq!(stitcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_keeps_previous_panorama() {
        let (good, store, panorama) = scheduler(Arc::new(Counting::default()), 1);
        store.append(frame(0));
        good.run_if_idle();
        let before = panorama.snapshot();

        let failing = StitchScheduler::new(
            store,
            panorama.clone(),
            Arc::new(Failing(StitchFailure::HomographyEstimationFailed)),
            &settings(1),
        );
        assert!(matches!(
            failing.run_if_idle(),
            RunReport::Failed {
                reason: StitchFailure::HomographyEstimationFailed,
                ..
            }
        ));
        let after = panorama.snapshot();
        assert_eq!(after.generation, before.generation);
        assert!(Arc::ptr_eq(after.image.as_ref().unwrap(), before.image.as_ref().unwrap()));
        assert_eq!(after.last_failure, Some(StitchFailure::HomographyEstimationFailed));
    }

    #[test]
    fn panic_in_stitcher_clears_the_flag() {
        let (scheduler, store, panorama) = scheduler(Arc::new(Panicking), 1);
        store.append(frame(0));
        assert!(matches!(
            scheduler.run_if_idle(),
            RunReport::Failed {
                reason: StitchFailure::Unknown(-1),
                ..
            }
        ));
        assert!(!scheduler.is_running());
        assert_eq!(panorama.generation(), 0);
        // A second attempt is allowed, proving the flag was released.
        assert!(matches!(scheduler.run_if_idle(), RunReport::Failed { .. }));
    }

    #[test]
    fn concurrent_callers_never_overlap() {
        let stitcher = Arc::new(Counting {
            delay: Duration::from_millis(30),
            ..Counting::default()
        });
        let (scheduler, store, _) = scheduler(stitcher.clone(), 1);
        store.append(frame(0));
        let scheduler = Arc::new(scheduler);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let scheduler = scheduler.clone();
                thread::spawn(move || {
                    (0..5)
                        .map(|_| scheduler.run_if_idle())
                        .filter(|report| *report == RunReport::Busy)
                        .count()
                })
            })
            .collect();
        let busy: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(stitcher.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(stitcher.calls.load(Ordering::SeqCst) + busy, 40);
    }

    #[test]
    fn shared_flag_keeps_runs_exclusive_across_schedulers() {
        let flag = Arc::new(AtomicBool::new(false));
        let slow = Arc::new(Counting {
            delay: Duration::from_millis(150),
            ..Counting::default()
        });
        let (first, store, _) = scheduler(slow.clone(), 1);
        let first = Arc::new(first.with_run_flag(flag.clone()));
        let fast = Arc::new(Counting::default());
        let second = StitchScheduler::new(
            store.clone(),
            Arc::new(PanoramaSlot::new()),
            fast.clone(),
            &settings(1),
        )
        .with_run_flag(flag);
        store.append(frame(0));

        let worker = {
            let first = first.clone();
            thread::spawn(move || first.run_if_idle())
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while slow.calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(second.run_if_idle(), RunReport::Busy);
        assert!(second.is_running());
        assert!(matches!(worker.join().unwrap(), RunReport::Fused { .. }));

        assert!(matches!(second.run_if_idle(), RunReport::Fused { .. }));
        assert_eq!(fast.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn result_finishing_after_stop_is_discarded() {
        let stitcher = Arc::new(Counting {
            delay: Duration::from_millis(150),
            ..Counting::default()
        });
        let (scheduler, store, panorama) = scheduler(stitcher.clone(), 1);
        let (tx, rx) = crossbeam_channel::unbounded();
        let scheduler = Arc::new(scheduler.with_events(tx));
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let scheduler = scheduler.clone();
            let running = running.clone();
            thread::spawn(move || scheduler.run_loop(&running, None))
        };
        store.append(frame(0));
        scheduler.request_stitch();
        let deadline = Instant::now() + Duration::from_secs(2);
        while stitcher.calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        running.store(false, Ordering::SeqCst);
        worker.join().unwrap();

        assert_eq!(stitcher.calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_running());
        let snapshot = panorama.snapshot();
        assert_eq!(snapshot.generation, 0);
        assert_eq!(snapshot.attempts, 0);
        assert!(
            !rx.try_iter()
                .any(|event| matches!(event, StatusEvent::StitchSucceeded { .. }))
        );
    }

    #[test]
    fn closed_loop_appends_leading_frames() {
        let stitcher = Arc::new(Counting::default());
        let (scheduler, store, _) = scheduler(stitcher.clone(), 3);
        let scheduler = scheduler.with_loop_detector(Some(Arc::new(AlwaysClosed)));

        for seq in 0..10 {
            store.append(frame(seq));
        }
        // Exactly ten frames is not enough to consult the detector.
        assert!(matches!(scheduler.run_if_idle(), RunReport::Fused { frames: 10, loop_closed: false, .. }));

        store.append(frame(10));
        assert!(matches!(scheduler.run_if_idle(), RunReport::Fused { frames: 14, loop_closed: true, .. }));
        assert_eq!(stitcher.last_len.load(Ordering::SeqCst), 14);
    }

    #[test]
    fn loop_serves_pending_request_and_stops_promptly() {
        let stitcher = Arc::new(Counting::default());
        let (scheduler, store, panorama) = scheduler(stitcher.clone(), 1);
        let (tx, rx) = crossbeam_channel::unbounded();
        let scheduler = Arc::new(scheduler.with_events(tx));
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let scheduler = scheduler.clone();
            let running = running.clone();
            thread::spawn(move || scheduler.run_loop(&running, None))
        };

        store.append(frame(0));
        scheduler.request_stitch();
        let deadline = Instant::now() + Duration::from_secs(2);
        while panorama.generation() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        running.store(false, Ordering::SeqCst);
        let stop_requested = Instant::now();
        worker.join().unwrap();

        assert!(stop_requested.elapsed() < Duration::from_secs(1));
        assert_eq!(panorama.generation(), 1);
        let events: Vec<StatusEvent> = rx.try_iter().collect();
        assert!(matches!(events.first(), Some(StatusEvent::StitchStarted { frames: 1, .. })));
        assert!(matches!(events.last(), Some(StatusEvent::StitchSucceeded { generation: 1, .. })));
    }
}
