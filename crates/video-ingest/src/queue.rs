use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};

use crate::types::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full and its oldest frame was discarded to make room.
    ReplacedOldest,
}

/// Bounded frame hand-off between a producer and a consumer that only cares about the
/// newest frame.
///
/// Pushing never blocks: when full, the oldest queued frame is evicted. Reading drains the
/// queue and yields the most recent frame.
#[derive(Clone)]
pub struct LatestFrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    dropped: Arc<AtomicU64>,
}

impl LatestFrameQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn push(&self, frame: Frame) -> PushOutcome {
        let mut pending = frame;
        let mut outcome = PushOutcome::Queued;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return outcome,
                Err(TrySendError::Full(frame)) => {
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        outcome = PushOutcome::ReplacedOldest;
                    }
                    pending = frame;
                }
                // Unreachable while `self` holds the receiver.
                Err(TrySendError::Disconnected(_)) => return outcome,
            }
        }
    }

    /// Drains everything queued and returns the newest frame, if any.
    pub fn latest(&self) -> Option<Frame> {
        let mut newest = None;
        loop {
            match self.rx.try_recv() {
                Ok(frame) => newest = Some(frame),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return newest,
            }
        }
    }

    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(1)
    }

    /// Frames evicted since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
