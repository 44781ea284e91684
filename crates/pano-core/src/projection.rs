//! Perspective and cylindrical coordinate mapping.
//!
//! Two directions are provided: [`cylindrical_warp`] pre-warps a captured perspective frame
//! onto a cylinder before it is stored, and [`build_spherical_sampling_map`] computes, for a
//! virtual camera looking into a stored panorama, which panorama pixel every view pixel
//! samples.

use std::f64::consts::PI;

use thiserror::Error;
use video_ingest::Frame;

use crate::remap::{BorderMode, SamplingMap, remap_packed3};

/// Horizontal field of view assumed for typical webcams when no calibration is available.
pub const DEFAULT_FOV_DEGREES: f64 = 68.5;

/// Vertical angle covered by a stored panorama's rows.
pub const DEFAULT_VERTICAL_COVERAGE: f64 = PI / 3.0;

/// Fill color for destination pixels whose source lies outside the frame.
pub const WARP_BORDER: [u8; 3] = [0, 0, 0];

#[derive(Debug, Error, PartialEq)]
pub enum ProjectionError {
    #[error("degenerate projection input: {0}")]
    DegenerateInput(String),
}

/// Camera model used for the cylindrical pre-warp.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProjectionParams {
    /// Horizontal field of view of the capturing camera, in degrees.
    pub fov_degrees: f64,
}

impl Default for ProjectionParams {
    fn default() -> Self {
        Self {
            fov_degrees: DEFAULT_FOV_DEGREES,
        }
    }
}

impl ProjectionParams {
    /// Rejects fields of view outside (0, 180) degrees.
    pub fn new(fov_degrees: f64) -> Result<Self, ProjectionError> {
        validate_fov(fov_degrees)?;
        Ok(Self { fov_degrees })
    }

    pub fn warp(&self, frame: &Frame) -> Result<Frame, ProjectionError> {
        cylindrical_warp(frame, self.fov_degrees)
    }
}

/// Focal length in pixels of a pinhole camera `width` pixels wide with the given FOV.
pub fn focal_length(width: u32, fov_degrees: f64) -> Result<f64, ProjectionError> {
    validate_fov(fov_degrees)?;
    if width == 0 {
        return Err(ProjectionError::DegenerateInput("zero-width image".into()));
    }
    Ok(width as f64 / (2.0 * (fov_degrees.to_radians() / 2.0).tan()))
}

fn validate_fov(fov_degrees: f64) -> Result<(), ProjectionError> {
    if !fov_degrees.is_finite() || fov_degrees <= 0.0 || fov_degrees >= 180.0 {
        return Err(ProjectionError::DegenerateInput(format!(
            "field of view {fov_degrees} must lie strictly between 0 and 180 degrees"
        )));
    }
    Ok(())
}

fn validate_size(width: u32, height: u32, what: &str) -> Result<(), ProjectionError> {
    if width == 0 || height == 0 {
        return Err(ProjectionError::DegenerateInput(format!(
            "{what} size {width}x{height} has no pixels"
        )));
    }
    Ok(())
}

/// Builds the source-coordinate map used by [`cylindrical_warp`].
///
/// With `L = w / (2·tan(fov/2))` and centered destination coordinates `(xc, yc)`:
/// `θ = xc / L`, `x' = L·θ + w/2`, `y' = yc·L / sqrt(xc² + L²) + h/2`.
pub fn cylindrical_map(width: u32, height: u32, fov_degrees: f64) -> Result<SamplingMap, ProjectionError> {
    validate_size(width, height, "frame")?;
    let focal = focal_length(width, fov_degrees)?;
    let (half_w, half_h) = (width as f64 / 2.0, height as f64 / 2.0);

    let len = width as usize * height as usize;
    let mut map_x = Vec::with_capacity(len);
    let mut map_y = Vec::with_capacity(len);
    for y in 0..height {
        let yc = y as f64 - half_h;
        for x in 0..width {
            let xc = x as f64 - half_w;
            let theta = xc / focal;
            let h_cyl = yc / (xc * xc + focal * focal).sqrt() * focal;
            map_x.push((focal * theta + half_w) as f32);
            map_y.push((h_cyl + half_h) as f32);
        }
    }
    SamplingMap::new(width, height, map_x, map_y)
}

/// Warps `frame` onto a cylinder. The output keeps the input's size, sequence and timestamp;
/// pixels whose source falls outside the frame are black.
pub fn cylindrical_warp(frame: &Frame, fov_degrees: f64) -> Result<Frame, ProjectionError> {
    let map = cylindrical_map(frame.width(), frame.height(), fov_degrees)?;
    let data = remap_packed3(
        frame.data(),
        frame.width(),
        frame.height(),
        &map,
        BorderMode::Constant(WARP_BORDER),
    );
    frame
        .derive(data, frame.width(), frame.height())
        .map_err(|err| ProjectionError::DegenerateInput(err.to_string()))
}

/// Virtual camera looking into a stored panorama.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewParams {
    pub yaw_degrees: f64,
    pub pitch_degrees: f64,
    pub fov_degrees: f64,
    pub view_width: u32,
    pub view_height: u32,
    /// Vertical angle (radians) spanned by the panorama's rows.
    pub vertical_coverage: f64,
}

impl ViewParams {
    pub fn new(yaw_degrees: f64, pitch_degrees: f64, fov_degrees: f64, view_width: u32, view_height: u32) -> Self {
        Self {
            yaw_degrees,
            pitch_degrees,
            fov_degrees,
            view_width,
            view_height,
            vertical_coverage: DEFAULT_VERTICAL_COVERAGE,
        }
    }
}

/// Computes, for every view pixel, the panorama coordinate it samples.
///
/// View pixels are normalized to `[-1, 1]`, turned into a ray through a pinhole of
/// `focal = 1/tan(fov/2)`, rotated by yaw about the vertical axis then by pitch about the
/// horizontal axis, and converted to azimuth/elevation. Azimuth spans the panorama width;
/// elevation spans `vertical_coverage` centered on the horizon. Coordinates are clamped to the
/// panorama bounds.
pub fn build_spherical_sampling_map(
    source_width: u32,
    source_height: u32,
    view: &ViewParams,
) -> Result<SamplingMap, ProjectionError> {
    validate_size(source_width, source_height, "panorama")?;
    validate_size(view.view_width, view.view_height, "view")?;
    validate_fov(view.fov_degrees)?;
    if !(view.vertical_coverage.is_finite() && view.vertical_coverage > 0.0) {
        return Err(ProjectionError::DegenerateInput(format!(
            "vertical coverage {} must be positive",
            view.vertical_coverage
        )));
    }

    let focal = 1.0 / (view.fov_degrees.to_radians() / 2.0).tan();
    let (sin_yaw, cos_yaw) = view.yaw_degrees.to_radians().sin_cos();
    let (sin_pitch, cos_pitch) = view.pitch_degrees.to_radians().sin_cos();
    let (src_w, src_h) = (source_width as f64, source_height as f64);
    let half_vw = view.view_width as f64 / 2.0;
    let half_vh = view.view_height as f64 / 2.0;
    let coverage = view.vertical_coverage;

    let len = view.view_width as usize * view.view_height as usize;
    let mut map_x = Vec::with_capacity(len);
    let mut map_y = Vec::with_capacity(len);

    for row in 0..view.view_height {
        let v = (row as f64 - half_vh) / half_vh;
        for col in 0..view.view_width {
            let u = (col as f64 - half_vw) / half_vw;

            let (x, y, z) = (u / focal, v / focal, 1.0);
            let norm = (x * x + y * y + z * z).sqrt();
            let (x, y, z) = (x / norm, y / norm, z / norm);

            // Yaw about the vertical axis.
            let x_yaw = x * cos_yaw + z * sin_yaw;
            let z_yaw = -x * sin_yaw + z * cos_yaw;
            // Pitch about the horizontal axis.
            let y_pitch = y * cos_pitch - z_yaw * sin_pitch;
            let z_pitch = y * sin_pitch + z_yaw * cos_pitch;

            let azimuth = x_yaw.atan2(z_pitch);
            let elevation = y_pitch.clamp(-1.0, 1.0).asin();

            let src_x = (azimuth + PI) / (2.0 * PI) * src_w;
            let src_y = (elevation + coverage / 2.0) / coverage * src_h;

            map_x.push(src_x.clamp(0.0, src_w - 1.0) as f32);
            map_y.push(src_y.clamp(0.0, src_h - 1.0) as f32);
        }
    }

    SamplingMap::new(view.view_width, view.view_height, map_x, map_y)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = ((x * 7 + y * 13) % 251) as u8;
                data.extend_from_slice(&[v, v.wrapping_mul(3), 255 - v]);
            }
        }
        Frame::from_bgr(data, width, height).unwrap()
    }

    #[test]
    fn focal_length_matches_pinhole_model() {
        let focal = focal_length(640, 90.0).unwrap();
        assert!((focal - 320.0).abs() < 1e-9);
    }

    #[test]
    fn warp_is_deterministic() {
        let frame = textured(64, 48);
        let a = cylindrical_warp(&frame, DEFAULT_FOV_DEGREES).unwrap();
        let b = cylindrical_warp(&frame, DEFAULT_FOV_DEGREES).unwrap();
        assert_eq!(a.data(), b.data());
        assert_eq!((a.width(), a.height()), (64, 48));
    }

    #[test]
    fn warp_keeps_center_row_and_column() {
        let frame = textured(64, 48);
        let warped = cylindrical_warp(&frame, DEFAULT_FOV_DEGREES).unwrap();
        let idx = |x: u32, y: u32| ((y * 64 + x) * 3) as usize;
        for y in 0..48 {
            let i = idx(32, y);
            assert_eq!(&warped.data()[i..i + 3], &frame.data()[i..i + 3]);
        }
        for x in 0..64 {
            let i = idx(x, 24);
            assert_eq!(&warped.data()[i..i + 3], &frame.data()[i..i + 3]);
        }
    }

    #[test]
    fn warp_compresses_rows_towards_the_horizon_at_the_edges() {
        let map = cylindrical_map(100, 80, DEFAULT_FOV_DEGREES).unwrap();
        let (sx, sy) = map.get(0, 0);
        assert!(sx.abs() < 1e-3);
        // Top-left samples closer to the center row than its own row.
        assert!(sy > 0.0 && sy < 40.0);
    }

    #[test]
    fn warp_keeps_frame_identity() {
        let frame = textured(8, 8).with_sequence(11);
        let warped = cylindrical_warp(&frame, 60.0).unwrap();
        assert_eq!(warped.sequence(), 11);
        assert_eq!(warped.timestamp_ms(), frame.timestamp_ms());
    }

    #[test]
    fn degenerate_inputs_are_rejected() {
        assert!(matches!(
            cylindrical_map(0, 10, 60.0),
            Err(ProjectionError::DegenerateInput(_))
        ));
        assert!(cylindrical_map(10, 10, 0.0).is_err());
        assert!(cylindrical_map(10, 10, 180.0).is_err());
        assert!(build_spherical_sampling_map(0, 10, &ViewParams::new(0.0, 0.0, 90.0, 4, 4)).is_err());
        assert!(build_spherical_sampling_map(10, 10, &ViewParams::new(0.0, 0.0, 90.0, 0, 4)).is_err());
        assert!(build_spherical_sampling_map(10, 10, &ViewParams::new(0.0, 0.0, -5.0, 4, 4)).is_err());
        assert!(ProjectionParams::new(180.0).is_err());
        assert!(ProjectionParams::new(f64::NAN).is_err());
        assert_eq!(ProjectionParams::new(68.5), Ok(ProjectionParams::default()));
    }

    #[test]
    fn forward_view_center_samples_panorama_center() {
        let view = ViewParams::new(0.0, 0.0, 90.0, 100, 100);
        let map = build_spherical_sampling_map(2000, 600, &view).unwrap();
        let (sx, sy) = map.get(50, 50);
        assert!((sx - 1000.0).abs() < 1.0, "sx = {sx}");
        assert!((sy - 300.0).abs() < 1.0, "sy = {sy}");
    }

    #[test]
    fn yaw_shifts_azimuth() {
        let view = ViewParams::new(90.0, 0.0, 90.0, 100, 100);
        let map = build_spherical_sampling_map(2000, 600, &view).unwrap();
        let (sx, _) = map.get(50, 50);
        // A quarter turn moves a quarter of the panorama width.
        assert!((sx - 1500.0).abs() < 1.0, "sx = {sx}");
    }

    #[test]
    fn samples_stay_within_bounds() {
        let view = ViewParams::new(359.0, 45.0, 150.0, 64, 48);
        let map = build_spherical_sampling_map(300, 100, &view).unwrap();
        assert!(map.map_x().iter().all(|&x| (0.0..=299.0).contains(&x)));
        assert!(map.map_y().iter().all(|&y| (0.0..=99.0).contains(&y)));
    }
}
