//! Camera reader loop feeding a [`LatestFrameQueue`].

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::{
    adjust::FrameAdjust,
    queue::{LatestFrameQueue, PushOutcome},
    source::FrameSource,
    types::CaptureError,
};

/// Pause after a transient read failure before trying again.
pub const READ_RETRY_DELAY: Duration = Duration::from_millis(30);

/// Counters the producer updates while running. Shared with health monitoring.
#[derive(Debug, Default)]
pub struct ProducerStats {
    frames: AtomicU64,
    read_errors: AtomicU64,
    last_frame_ms: AtomicI64,
}

impl ProducerStats {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn read_errors(&self) -> u64 {
        self.read_errors.load(Ordering::Relaxed)
    }

    /// Wall-clock millis of the last successfully read frame, or 0 before the first one.
    pub fn last_frame_ms(&self) -> i64 {
        self.last_frame_ms.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProducerExit {
    /// The running flag was cleared.
    Stopped,
    /// The source reported it has no more frames.
    EndOfStream,
    /// The source failed in a way retrying cannot fix.
    Failed(String),
}

/// Reads frames until `running` is cleared, the source ends or it fails permanently,
/// stamping each frame with a sequence number and pushing it into `queue`. Transient read
/// errors are retried after [`READ_RETRY_DELAY`]. The source is closed exactly once, on
/// exit.
pub fn run_producer(
    mut source: Box<dyn FrameSource>,
    queue: LatestFrameQueue,
    running: Arc<AtomicBool>,
    adjust: FrameAdjust,
    stats: Arc<ProducerStats>,
) -> ProducerExit {
    let label = source.describe().to_string();
    info!(source = %label, "producer started");
    let mut sequence: u64 = 0;

    let exit = loop {
        if !running.load(Ordering::Relaxed) {
            break ProducerExit::Stopped;
        }
        match source.read_frame() {
            Ok(frame) => {
                let frame = match adjust.apply(frame.with_sequence(sequence)) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "frame adjustment failed");
                        continue;
                    }
                };
                sequence += 1;
                stats.frames.fetch_add(1, Ordering::Relaxed);
                stats
                    .last_frame_ms
                    .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                metrics::counter!("photosphere_frames_captured_total").increment(1);
                if queue.push(frame) == PushOutcome::ReplacedOldest {
                    metrics::counter!("photosphere_frames_dropped_total").increment(1);
                }
            }
            Err(CaptureError::EndOfStream) => {
                info!(source = %label, "source reached end of stream");
                break ProducerExit::EndOfStream;
            }
            Err(err) => {
                stats.read_errors.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("photosphere_source_read_errors_total").increment(1);
                if !err.is_transient() {
                    error!(source = %label, error = %err, "video source failed");
                    break ProducerExit::Failed(err.to_string());
                }
                warn!(source = %label, error = %err, "frame read failed; retrying");
                thread::sleep(READ_RETRY_DELAY);
            }
        }
    };

    source.close();
    debug!(source = %label, frames = sequence, ?exit, "producer stopped");
    exit
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::types::Frame;

    struct Scripted {
        script: VecDeque<Result<Frame, CaptureError>>,
        closes: Arc<AtomicU64>,
    }

    impl FrameSource for Scripted {
        fn read_frame(&mut self) -> Result<Frame, CaptureError> {
            self.script.pop_front().unwrap_or(Err(CaptureError::EndOfStream))
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn describe(&self) -> &str {
            "scripted"
        }
    }

    fn pixel(v: u8) -> Frame {
        Frame::from_bgr(vec![v; 3], 1, 1).unwrap()
    }

    #[test]
    fn read_errors_are_retried_and_source_closed_once() {
        let closes = Arc::new(AtomicU64::new(0));
        let source = Scripted {
            script: VecDeque::from(vec![
                Ok(pixel(1)),
                Err(CaptureError::Read("glitch".into())),
                Ok(pixel(2)),
            ]),
            closes: closes.clone(),
        };
        let queue = LatestFrameQueue::new(5);
        let stats = Arc::new(ProducerStats::default());
        let exit = run_producer(
            Box::new(source),
            queue.clone(),
            Arc::new(AtomicBool::new(true)),
            FrameAdjust::default(),
            stats.clone(),
        );

        assert_eq!(exit, ProducerExit::EndOfStream);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(stats.frames(), 2);
        assert_eq!(stats.read_errors(), 1);
        let latest = queue.latest().unwrap();
        assert_eq!(latest.sequence(), 1);
        assert_eq!(latest.data()[0], 2);
    }

    #[test]
    fn permanent_errors_end_the_producer() {
        let closes = Arc::new(AtomicU64::new(0));
        let source = Scripted {
            script: VecDeque::from(vec![
                Ok(pixel(1)),
                Err(CaptureError::Open {
                    uri: "/dev/video0".into(),
                }),
                Ok(pixel(2)),
            ]),
            closes: closes.clone(),
        };
        let queue = LatestFrameQueue::new(5);
        let stats = Arc::new(ProducerStats::default());
        let running = Arc::new(AtomicBool::new(true));
        let exit = run_producer(
            Box::new(source),
            queue.clone(),
            running.clone(),
            FrameAdjust::default(),
            stats.clone(),
        );

        match exit {
            ProducerExit::Failed(message) => assert!(message.contains("/dev/video0")),
            other => panic!("unexpected exit: {other:?}"),
        }
        // Returned on its own, without the running flag being cleared.
        assert!(running.load(Ordering::SeqCst));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(stats.frames(), 1);
        assert_eq!(stats.read_errors(), 1);
        assert_eq!(queue.latest().unwrap().data()[0], 1);
    }

    #[test]
    fn cleared_flag_stops_before_reading() {
        let closes = Arc::new(AtomicU64::new(0));
        let source = Scripted {
            script: VecDeque::from(vec![Ok(pixel(1))]),
            closes: closes.clone(),
        };
        let queue = LatestFrameQueue::new(2);
        let exit = run_producer(
            Box::new(source),
            queue.clone(),
            Arc::new(AtomicBool::new(false)),
            FrameAdjust::default(),
            Arc::new(ProducerStats::default()),
        );
        assert_eq!(exit, ProducerExit::Stopped);
        assert!(queue.is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
