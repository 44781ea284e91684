use std::sync::{Mutex, MutexGuard, PoisonError};

use video_ingest::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The frame was stored; carries the new length.
    Appended(usize),
    /// The store is full and the frame was discarded.
    AtCapacity,
}

/// Ordered, capped collection of accepted frames.
///
/// One writer appends while readers take whole snapshots under the same lock, so a
/// snapshot never observes a half-finished append.
#[derive(Debug)]
pub struct FrameStore {
    frames: Mutex<Vec<Frame>>,
    capacity: usize,
}

impl FrameStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(Vec::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Frame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, frame: Frame) -> AppendOutcome {
        let mut frames = self.lock();
        if frames.len() >= self.capacity {
            return AppendOutcome::AtCapacity;
        }
        frames.push(frame);
        AppendOutcome::Appended(frames.len())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of the current frame list. Pixel buffers are shared, not duplicated.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn frame(seq: u64) -> Frame {
        Frame::from_bgr(vec![0; 3], 1, 1).unwrap().with_sequence(seq)
    }

    #[test]
    fn appends_past_capacity_are_ignored() {
        let store = FrameStore::new(3);
        for seq in 0..3 {
            assert_eq!(store.append(frame(seq)), AppendOutcome::Appended(seq as usize + 1));
        }
        assert_eq!(store.append(frame(3)), AppendOutcome::AtCapacity);
        assert_eq!(store.len(), 3);
        assert!(store.is_full());
        let sequences: Vec<u64> = store.snapshot().iter().map(Frame::sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn snapshot_is_detached_from_later_appends() {
        let store = FrameStore::new(10);
        store.append(frame(0));
        let snapshot = store.snapshot();
        store.append(frame(1));
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].shares_pixels(&store.snapshot()[0]));
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn concurrent_readers_never_see_more_than_capacity() {
        let store = Arc::new(FrameStore::new(25));
        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for seq in 0..200 {
                    store.append(frame(seq));
                }
            })
        };
        for _ in 0..200 {
            let snapshot = store.snapshot();
            assert!(snapshot.len() <= 25);
            assert!(snapshot.windows(2).all(|w| w[0].sequence() < w[1].sequence()));
        }
        writer.join().unwrap();
        assert_eq!(store.len(), 25);
    }
}
