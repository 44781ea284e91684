//! Scene-change heuristic deciding whether a live frame differs enough from the last one.

use image::{GrayImage, imageops};
use video_ingest::Frame;

use crate::imaging::{luminance, scaled_height};

/// Frames wider than this are downscaled before comparison.
pub const GATE_WIDTH: u32 = 320;

/// Mean absolute luminance difference between two frames, in 8-bit levels.
///
/// When `previous` is wider than [`GATE_WIDTH`], both frames are shrunk to that width with the
/// previous frame's aspect ratio. Otherwise `current` is resized to match `previous` when their
/// sizes differ.
pub fn mean_luminance_difference(previous: &Frame, current: &Frame) -> f64 {
    let prev = luminance(previous);
    let cur = luminance(current);
    let (target_w, target_h) = if prev.width() > GATE_WIDTH {
        (GATE_WIDTH, scaled_height(prev.width(), prev.height(), GATE_WIDTH))
    } else {
        (prev.width(), prev.height())
    };
    let prev = fit(prev, target_w, target_h);
    let cur = fit(cur, target_w, target_h);
    mean_abs_diff(&prev, &cur)
}

/// True iff the mean luminance difference strictly exceeds `threshold`.
pub fn should_capture(previous: &Frame, current: &Frame, threshold: f64) -> bool {
    mean_luminance_difference(previous, current) > threshold
}

fn fit(image: GrayImage, width: u32, height: u32) -> GrayImage {
    if image.width() == width && image.height() == height {
        image
    } else {
        imageops::resize(&image, width, height, imageops::FilterType::Triangle)
    }
}

fn mean_abs_diff(a: &GrayImage, b: &GrayImage) -> f64 {
    let total: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&x, &y)| x.abs_diff(y) as u64)
        .sum();
    let count = a.as_raw().len().max(1);
    total as f64 / count as f64
}
