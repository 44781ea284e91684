//! Contract for the image fusion black box, plus the built-in implementations.

use image::RgbImage;
use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;
use video_ingest::Frame;

use crate::{
    features::{Features, Sift, ratio_matches},
    imaging::luminance,
};

/// Why a fusion attempt produced no image.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum StitchFailure {
    #[error("need more images")]
    NeedMoreImages,
    #[error("homography estimation failed")]
    HomographyEstimationFailed,
    #[error("camera parameter adjustment failed")]
    CameraParamsAdjustFailed,
    #[error("stitcher error code {0}")]
    Unknown(i32),
}

impl StitchFailure {
    /// Numeric status, matching the conventional stitcher status codes.
    pub fn code(&self) -> i32 {
        match self {
            StitchFailure::NeedMoreImages => 1,
            StitchFailure::HomographyEstimationFailed => 2,
            StitchFailure::CameraParamsAdjustFailed => 3,
            StitchFailure::Unknown(code) => *code,
        }
    }

    /// Short operator-facing hint shown in the status line.
    pub fn status_message(&self) -> String {
        match self {
            StitchFailure::NeedMoreImages => "Need more images".to_string(),
            StitchFailure::HomographyEstimationFailed => "Poor overlap - rotate slower".to_string(),
            StitchFailure::CameraParamsAdjustFailed => "Camera adjust fail".to_string(),
            StitchFailure::Unknown(code) => format!("Error {code}"),
        }
    }

    /// Stable label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            StitchFailure::NeedMoreImages => "need_more_images",
            StitchFailure::HomographyEstimationFailed => "homography_failed",
            StitchFailure::CameraParamsAdjustFailed => "camera_params_failed",
            StitchFailure::Unknown(_) => "unknown",
        }
    }
}

pub enum StitchOutcome {
    /// Fused panorama in RGB order.
    Success(RgbImage),
    Failure(StitchFailure),
}

impl std::fmt::Debug for StitchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StitchOutcome::Success(image) => {
                write!(f, "Success({}x{})", image.width(), image.height())
            }
            StitchOutcome::Failure(reason) => write!(f, "Failure({reason:?})"),
        }
    }
}

/// Fuses an ordered frame sequence into one panorama.
///
/// Implementations must tolerate being called repeatedly with a growing input.
pub trait Stitcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn fuse(&self, frames: &[Frame]) -> StitchOutcome;
}

/// Fuses cylindrically pre-warped frames from a camera panning about its vertical axis by
/// estimating a pure translation between consecutive frames.
pub struct TranslationStitcher {
    sift: Sift,
    ratio: f32,
    min_matches: usize,
    inlier_tolerance: f32,
    max_canvas_width: u32,
}

impl Default for TranslationStitcher {
    fn default() -> Self {
        Self {
            sift: Sift::new().with_max_features(400),
            ratio: 0.7,
            min_matches: 8,
            inlier_tolerance: 3.0,
            max_canvas_width: 20_000,
        }
    }
}

impl TranslationStitcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of frame `b`'s origin in frame `a`'s coordinates.
    fn pair_offset(&self, a: &Features, b: &Features) -> Result<(f32, f32), StitchFailure> {
        let good = ratio_matches(a, b, self.ratio);
        if good.len() < self.min_matches {
            return Err(StitchFailure::HomographyEstimationFailed);
        }
        let shifts: Vec<(f32, f32)> = good
            .iter()
            .map(|m| {
                let (ka, kb) = (&a.keypoints[m.query], &b.keypoints[m.train]);
                (ka.x - kb.x, ka.y - kb.y)
            })
            .collect();
        let dx = median(shifts.iter().map(|s| s.0).collect());
        let dy = median(shifts.iter().map(|s| s.1).collect());

        let inliers: Vec<&(f32, f32)> = shifts
            .iter()
            .filter(|(sx, sy)| (sx - dx).abs() <= self.inlier_tolerance && (sy - dy).abs() <= self.inlier_tolerance)
            .collect();
        if inliers.len() < self.min_matches {
            return Err(StitchFailure::HomographyEstimationFailed);
        }
        let n = inliers.len() as f32;
        let mean_x = inliers.iter().map(|s| s.0).sum::<f32>() / n;
        let mean_y = inliers.iter().map(|s| s.1).sum::<f32>() / n;
        Ok((mean_x, mean_y))
    }
}

impl Stitcher for TranslationStitcher {
    fn name(&self) -> &'static str {
        "translation"
    }

    fn fuse(&self, frames: &[Frame]) -> StitchOutcome {
        if frames.len() < 2 {
            return StitchOutcome::Failure(StitchFailure::NeedMoreImages);
        }
        if frames.iter().any(Frame::is_empty) {
            return StitchOutcome::Failure(StitchFailure::Unknown(-1));
        }

        let features: Vec<Features> = frames
            .par_iter()
            .map(|frame| self.sift.detect_and_compute(&luminance(frame)))
            .collect();

        let mut offsets = Vec::with_capacity(frames.len() - 1);
        for pair in features.windows(2) {
            match self.pair_offset(&pair[0], &pair[1]) {
                Ok(offset) => offsets.push(offset),
                Err(reason) => return StitchOutcome::Failure(reason),
            }
        }

        // A pan sweeps one way; mixed directions mean the frames are out of order or unrelated.
        let forward = offsets.iter().filter(|(dx, _)| *dx > 1.0).count();
        let backward = offsets.iter().filter(|(dx, _)| *dx < -1.0).count();
        if forward > 0 && backward > 0 {
            debug!(forward, backward, "inconsistent pan direction");
            return StitchOutcome::Failure(StitchFailure::CameraParamsAdjustFailed);
        }

        let mut positions = Vec::with_capacity(frames.len());
        let (mut x, mut y) = (0.0f32, 0.0f32);
        positions.push((x, y));
        for (dx, dy) in &offsets {
            x += dx;
            y += dy;
            positions.push((x, y));
        }

        match composite(frames, &positions, self.max_canvas_width) {
            Some(image) => StitchOutcome::Success(image),
            None => StitchOutcome::Failure(StitchFailure::CameraParamsAdjustFailed),
        }
    }
}

fn median(mut values: Vec<f32>) -> f32 {
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Feathered average of all frames placed at integer offsets on a shared canvas. Pure black
/// pixels (the pre-warp border) carry no weight.
fn composite(frames: &[Frame], positions: &[(f32, f32)], max_width: u32) -> Option<RgbImage> {
    let min_x = positions.iter().map(|p| p.0).fold(f32::INFINITY, f32::min);
    let min_y = positions.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
    let origins: Vec<(i64, i64)> = positions
        .iter()
        .map(|(x, y)| ((x - min_x).round() as i64, (y - min_y).round() as i64))
        .collect();
    let width = frames
        .iter()
        .zip(&origins)
        .map(|(f, o)| o.0 + f.width() as i64)
        .max()?;
    let height = frames
        .iter()
        .zip(&origins)
        .map(|(f, o)| o.1 + f.height() as i64)
        .max()?;
    if width <= 0 || height <= 0 || width > max_width as i64 || height > max_width as i64 {
        return None;
    }
    let (width, height) = (width as usize, height as usize);

    let mut sums = vec![0.0f32; width * height * 3];
    let mut weights = vec![0.0f32; width * height];
    for (frame, &(ox, oy)) in frames.iter().zip(&origins) {
        let fw = frame.width() as usize;
        for (row, line) in frame.data().chunks_exact(fw * 3).enumerate() {
            let cy = oy as usize + row;
            for (col, px) in line.chunks_exact(3).enumerate() {
                if px.iter().all(|&v| v == 0) {
                    continue;
                }
                let edge = col.min(fw - 1 - col) as f32 + 1.0;
                let idx = cy * width + ox as usize + col;
                weights[idx] += edge;
                for c in 0..3 {
                    sums[idx * 3 + c] += px[c] as f32 * edge;
                }
            }
        }
    }

    let mut image = RgbImage::new(width as u32, height as u32);
    for (idx, pixel) in image.pixels_mut().enumerate() {
        let w = weights[idx];
        if w > 0.0 {
            let bgr = [
                sums[idx * 3] / w,
                sums[idx * 3 + 1] / w,
                sums[idx * 3 + 2] / w,
            ];
            pixel.0 = [
                bgr[2].round() as u8,
                bgr[1].round() as u8,
                bgr[0].round() as u8,
            ];
        }
    }
    Some(image)
}

#[cfg(feature = "opencv")]
pub use self::opencv_backend::OpenCvStitcher;

#[cfg(feature = "opencv")]
mod opencv_backend {
    use opencv::{
        core::{Mat, MatTraitConstManual, Vector},
        prelude::*,
        stitching::{Stitcher as CvStitcher, Stitcher_Mode, Stitcher_Status},
    };
    use tracing::warn;
    use video_ingest::Frame;

    use super::{StitchFailure, StitchOutcome, Stitcher};

    /// OpenCV's feature-based stitcher in affine (SCANS) mode.
    #[derive(Default)]
    pub struct OpenCvStitcher;

    impl OpenCvStitcher {
        fn run(&self, frames: &[Frame]) -> opencv::Result<StitchOutcome> {
            let mut images = Vector::<Mat>::new();
            for frame in frames {
                let flat = Mat::from_slice(frame.data())?;
                let shaped = flat.reshape(3, frame.height() as i32)?;
                images.push(shaped.try_clone()?);
            }

            let mut stitcher = CvStitcher::create(Stitcher_Mode::SCANS)?;
            let mut pano = Mat::default();
            let status = stitcher.stitch(&images, &mut pano)?;
            let outcome = match status {
                Stitcher_Status::OK => {
                    let size = pano.size()?;
                    let data = pano.data_bytes()?;
                    let mut rgb = Vec::with_capacity(data.len());
                    for px in data.chunks_exact(3) {
                        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                    }
                    match image::RgbImage::from_raw(size.width as u32, size.height as u32, rgb) {
                        Some(image) => StitchOutcome::Success(image),
                        None => StitchOutcome::Failure(StitchFailure::Unknown(-1)),
                    }
                }
                Stitcher_Status::ERR_NEED_MORE_IMGS => {
                    StitchOutcome::Failure(StitchFailure::NeedMoreImages)
                }
                Stitcher_Status::ERR_HOMOGRAPHY_EST_FAIL => {
                    StitchOutcome::Failure(StitchFailure::HomographyEstimationFailed)
                }
                Stitcher_Status::ERR_CAMERA_PARAMS_ADJUST_FAIL => {
                    StitchOutcome::Failure(StitchFailure::CameraParamsAdjustFailed)
                }
            };
            Ok(outcome)
        }
    }

    impl Stitcher for OpenCvStitcher {
        fn name(&self) -> &'static str {
            "opencv"
        }

        fn fuse(&self, frames: &[Frame]) -> StitchOutcome {
            match self.run(frames) {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(error = %err, "OpenCV stitcher raised an error");
                    StitchOutcome::Failure(StitchFailure::Unknown(err.code))
                }
            }
        }
    }
}
