//! Dense resampling of packed 3-channel images through per-pixel coordinate maps.

use rayon::prelude::*;

use crate::projection::ProjectionError;

/// How samples that fall outside the source are resolved.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BorderMode {
    /// Out-of-range taps read this color.
    Constant([u8; 3]),
    /// Coordinates wrap around both axes.
    Wrap,
}

/// Per-output-pixel source coordinates, stored row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingMap {
    width: u32,
    height: u32,
    map_x: Vec<f32>,
    map_y: Vec<f32>,
}

impl SamplingMap {
    pub fn new(
        width: u32,
        height: u32,
        map_x: Vec<f32>,
        map_y: Vec<f32>,
    ) -> Result<Self, ProjectionError> {
        let len = width as usize * height as usize;
        if len == 0 || map_x.len() != len || map_y.len() != len {
            return Err(ProjectionError::DegenerateInput(format!(
                "sampling map of {width}x{height} needs {len} entries per axis"
            )));
        }
        Ok(Self {
            width,
            height,
            map_x,
            map_y,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn map_x(&self) -> &[f32] {
        &self.map_x
    }

    pub fn map_y(&self) -> &[f32] {
        &self.map_y
    }

    /// Source coordinate sampled by output pixel `(x, y)`.
    pub fn get(&self, x: u32, y: u32) -> (f32, f32) {
        let idx = (y * self.width + x) as usize;
        (self.map_x[idx], self.map_y[idx])
    }
}

/// Bilinearly resamples `src` (packed 3 bytes per pixel, `src_width` x `src_height`) through
/// `map`, producing a packed buffer of the map's dimensions.
pub fn remap_packed3(
    src: &[u8],
    src_width: u32,
    src_height: u32,
    map: &SamplingMap,
    border: BorderMode,
) -> Vec<u8> {
    debug_assert_eq!(src.len(), src_width as usize * src_height as usize * 3);
    let out_w = map.width as usize;
    let mut dst = vec![0u8; out_w * map.height as usize * 3];
    if src_width == 0 || src_height == 0 {
        return dst;
    }

    dst.par_chunks_mut(out_w * 3)
        .enumerate()
        .for_each(|(y, row)| {
            let base = y * out_w;
            for x in 0..out_w {
                let sx = map.map_x[base + x];
                let sy = map.map_y[base + x];
                let px = sample_bilinear(src, src_width, src_height, sx, sy, border);
                row[x * 3..x * 3 + 3].copy_from_slice(&px);
            }
        });

    dst
}

fn sample_bilinear(src: &[u8], width: u32, height: u32, sx: f32, sy: f32, border: BorderMode) -> [u8; 3] {
    if !sx.is_finite() || !sy.is_finite() {
        return match border {
            BorderMode::Constant(color) => color,
            _ => [0; 3],
        };
    }
    let x0 = sx.floor();
    let y0 = sy.floor();
    let fx = sx - x0;
    let fy = sy - y0;
    let x0 = x0 as i64;
    let y0 = y0 as i64;

    let taps = [
        (x0, y0, (1.0 - fx) * (1.0 - fy)),
        (x0 + 1, y0, fx * (1.0 - fy)),
        (x0, y0 + 1, (1.0 - fx) * fy),
        (x0 + 1, y0 + 1, fx * fy),
    ];

    let mut acc = [0.0f32; 3];
    for (tx, ty, weight) in taps {
        if weight == 0.0 {
            continue;
        }
        let px = fetch(src, width, height, tx, ty, border);
        for c in 0..3 {
            acc[c] += px[c] as f32 * weight;
        }
    }
    acc.map(|v| (v + 0.5).clamp(0.0, 255.0) as u8)
}

fn fetch(src: &[u8], width: u32, height: u32, x: i64, y: i64, border: BorderMode) -> [u8; 3] {
    let (w, h) = (width as i64, height as i64);
    let (x, y) = match border {
        BorderMode::Constant(color) => {
            if x < 0 || y < 0 || x >= w || y >= h {
                return color;
            }
            (x, y)
        }
        BorderMode::Wrap => (x.rem_euclid(w), y.rem_euclid(h)),
    };
    let idx = ((y * w + x) * 3) as usize;
    [src[idx], src[idx + 1], src[idx + 2]]
}
