//! Detects that a rotating capture has come back around to where it started.

use std::panic::{self, AssertUnwindSafe};

use image::GrayImage;
use tracing::debug;
use video_ingest::Frame;

use crate::{
    features::{Features, Sift, ratio_matches},
    imaging::luminance,
};

/// Fewer frames than this cannot have covered a full circle.
pub const MIN_LOOP_FRAMES: usize = 10;
/// Each end must yield more descriptors than this to be compared.
pub const MIN_DESCRIPTORS: usize = 10;
/// A loop is closed when more ratio-test matches than this survive.
pub const MIN_GOOD_MATCHES: usize = 20;
pub const MATCH_RATIO: f32 = 0.7;

/// Source of local features for grayscale images.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, image: &GrayImage) -> Features;
}

impl FeatureExtractor for Sift {
    fn extract(&self, image: &GrayImage) -> Features {
        self.detect_and_compute(image)
    }
}

/// Decides whether the newest frame overlaps the first one.
pub trait LoopClosureCheck: Send + Sync {
    fn is_loop_closed(&self, frames: &[Frame]) -> bool;
}

pub struct LoopClosureDetector<E = Sift> {
    extractor: E,
    ratio: f32,
    min_matches: usize,
}

impl Default for LoopClosureDetector<Sift> {
    fn default() -> Self {
        Self::new(Sift::new())
    }
}

impl<E: FeatureExtractor> LoopClosureDetector<E> {
    pub fn new(extractor: E) -> Self {
        Self {
            extractor,
            ratio: MATCH_RATIO,
            min_matches: MIN_GOOD_MATCHES,
        }
    }

    fn compare(&self, first: &Frame, last: &Frame) -> bool {
        let first_features = self.extractor.extract(&luminance(first));
        let last_features = self.extractor.extract(&luminance(last));
        if first_features.len() <= MIN_DESCRIPTORS || last_features.len() <= MIN_DESCRIPTORS {
            debug!(
                first = first_features.len(),
                last = last_features.len(),
                "too few descriptors for loop closure"
            );
            return false;
        }
        let good = ratio_matches(&first_features, &last_features, self.ratio);
        debug!(good_matches = good.len(), "loop closure comparison");
        good.len() > self.min_matches
    }
}

impl<E: FeatureExtractor> LoopClosureCheck for LoopClosureDetector<E> {
    /// Any failure inside feature extraction or matching counts as "not closed".
    fn is_loop_closed(&self, frames: &[Frame]) -> bool {
        if frames.len() < MIN_LOOP_FRAMES {
            return false;
        }
        let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
            return false;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| self.compare(first, last))) {
            Ok(closed) => closed,
            Err(_) => {
                debug!("loop closure check panicked; treating as open");
                false
            }
        }
    }
}
