//! Scale-invariant keypoints with 128-d gradient descriptors, and ratio-test matching.
//!
//! The detector follows the classic difference-of-Gaussians construction: a Gaussian scale
//! space per octave, extrema of adjacent DoG layers filtered by contrast and edge response,
//! a dominant gradient orientation per keypoint, and a 4x4x8 orientation histogram
//! descriptor. Sub-pixel refinement and multiple orientations per keypoint are omitted.

use std::f32::consts::{PI, SQRT_2};

use image::GrayImage;
use rayon::prelude::*;

use crate::imaging::gray_to_f32;

pub const DESCRIPTOR_LEN: usize = 128;

const DESCR_WIDTH: usize = 4;
const DESCR_BINS: usize = 8;
const DESCR_SCALE: f32 = 3.0;
const DESCR_MAG_CLAMP: f32 = 0.2;
const ORI_BINS: usize = 36;
const ORI_SIGMA_FACTOR: f32 = 1.5;
const ORI_RADIUS_FACTOR: f32 = 3.0;
const IMAGE_BORDER: usize = 5;
const INPUT_BLUR: f32 = 0.5;
const MIN_OCTAVE_SIZE: usize = 2 * IMAGE_BORDER + 6;

pub type Descriptor = [f32; DESCRIPTOR_LEN];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    pub size: f32,
    /// Dominant gradient orientation in radians.
    pub angle: f32,
    pub response: f32,
    pub octave: usize,
}

/// Keypoints and their descriptors, index-aligned.
#[derive(Clone, Debug, Default)]
pub struct Features {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl Features {
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

pub struct Sift {
    pub n_octaves: usize,
    pub n_layers: usize,
    pub sigma: f32,
    pub contrast_threshold: f32,
    pub edge_threshold: f32,
    /// Strongest keypoints kept, ranked by DoG response.
    pub max_features: usize,
}

impl Default for Sift {
    fn default() -> Self {
        Self {
            n_octaves: 4,
            n_layers: 3,
            sigma: 1.6,
            contrast_threshold: 0.04,
            edge_threshold: 10.0,
            max_features: 500,
        }
    }
}

#[derive(Clone)]
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    fn blur(&self, sigma: f32) -> Plane {
        let kernel = gaussian_kernel(sigma);
        let radius = (kernel.len() / 2) as isize;
        let (w, h) = (self.width as isize, self.height as isize);

        let mut tmp = vec![0.0f32; self.data.len()];
        tmp.par_chunks_mut(self.width)
            .enumerate()
            .for_each(|(y, row)| {
                let src = &self.data[y * self.width..(y + 1) * self.width];
                for (x, out) in row.iter_mut().enumerate() {
                    let mut acc = 0.0;
                    for (i, k) in kernel.iter().enumerate() {
                        let sx = (x as isize + i as isize - radius).clamp(0, w - 1);
                        acc += k * src[sx as usize];
                    }
                    *out = acc;
                }
            });

        let mut data = vec![0.0f32; self.data.len()];
        data.par_chunks_mut(self.width)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, out) in row.iter_mut().enumerate() {
                    let mut acc = 0.0;
                    for (i, k) in kernel.iter().enumerate() {
                        let sy = (y as isize + i as isize - radius).clamp(0, h - 1);
                        acc += k * tmp[sy as usize * self.width + x];
                    }
                    *out = acc;
                }
            });

        Plane {
            width: self.width,
            height: self.height,
            data,
        }
    }

    fn half(&self) -> Plane {
        let width = self.width / 2;
        let height = self.height / 2;
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(self.at(x * 2, y * 2));
            }
        }
        Plane {
            width,
            height,
            data,
        }
    }

    fn minus(&self, other: &Plane) -> Plane {
        Plane {
            width: self.width,
            height: self.height,
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| a - b)
                .collect(),
        }
    }

    /// Central-difference gradient as (magnitude, orientation), if `(x, y)` is interior.
    fn gradient(&self, x: isize, y: isize) -> Option<(f32, f32)> {
        if x < 1 || y < 1 || x >= self.width as isize - 1 || y >= self.height as isize - 1 {
            return None;
        }
        let (x, y) = (x as usize, y as usize);
        let gx = self.at(x + 1, y) - self.at(x - 1, y);
        let gy = self.at(x, y + 1) - self.at(x, y - 1);
        Some(((gx * gx + gy * gy).sqrt(), gy.atan2(gx)))
    }
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as isize;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-((i * i) as f32) / denom).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

struct Candidate {
    keypoint: KeyPoint,
    octave: usize,
    layer: usize,
    x: usize,
    y: usize,
}

impl Sift {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_features(mut self, max_features: usize) -> Self {
        self.max_features = max_features;
        self
    }

    pub fn detect_and_compute(&self, image: &GrayImage) -> Features {
        let base = Plane {
            width: image.width() as usize,
            height: image.height() as usize,
            data: gray_to_f32(image),
        };
        if base.width < MIN_OCTAVE_SIZE || base.height < MIN_OCTAVE_SIZE || self.n_layers == 0 {
            return Features::default();
        }

        let k = 2.0f32.powf(1.0 / self.n_layers as f32);
        let layer_sigmas: Vec<f32> = (0..self.n_layers + 3)
            .map(|i| self.sigma * k.powi(i as i32))
            .collect();
        let increments: Vec<f32> = layer_sigmas
            .windows(2)
            .map(|pair| (pair[1] * pair[1] - pair[0] * pair[0]).sqrt())
            .collect();

        let first_blur = (self.sigma * self.sigma - INPUT_BLUR * INPUT_BLUR)
            .max(0.01)
            .sqrt();
        let mut octave_base = base.blur(first_blur);
        let mut pyramid: Vec<Vec<Plane>> = Vec::with_capacity(self.n_octaves);
        let mut candidates = Vec::new();

        for octave in 0..self.n_octaves {
            if octave_base.width < MIN_OCTAVE_SIZE || octave_base.height < MIN_OCTAVE_SIZE {
                break;
            }
            let mut gauss = Vec::with_capacity(self.n_layers + 3);
            gauss.push(octave_base.clone());
            for inc in &increments {
                let next = gauss[gauss.len() - 1].blur(*inc);
                gauss.push(next);
            }
            let dog: Vec<Plane> = gauss.windows(2).map(|pair| pair[1].minus(&pair[0])).collect();
            self.find_extrema(&dog, octave, &layer_sigmas, &mut candidates);

            octave_base = gauss[self.n_layers].half();
            pyramid.push(gauss);
        }

        candidates.sort_by(|a, b| b.keypoint.response.total_cmp(&a.keypoint.response));
        candidates.truncate(self.max_features);

        let described: Vec<(KeyPoint, Descriptor)> = candidates
            .par_iter()
            .map(|c| {
                let plane = &pyramid[c.octave][c.layer];
                let scale = layer_sigmas[c.layer];
                let angle = dominant_orientation(plane, c.x, c.y, scale);
                let descriptor = describe(plane, c.x, c.y, scale, angle);
                (KeyPoint { angle, ..c.keypoint }, descriptor)
            })
            .collect();

        let (keypoints, descriptors) = described.into_iter().unzip();
        Features {
            keypoints,
            descriptors,
        }
    }

    fn find_extrema(&self, dog: &[Plane], octave: usize, layer_sigmas: &[f32], out: &mut Vec<Candidate>) {
        let threshold = 0.5 * self.contrast_threshold / self.n_layers as f32;
        let edge = self.edge_threshold;
        let octave_scale = (1usize << octave) as f32;

        for layer in 1..=self.n_layers {
            let (below, here, above) = (&dog[layer - 1], &dog[layer], &dog[layer + 1]);
            for y in IMAGE_BORDER..here.height - IMAGE_BORDER {
                for x in IMAGE_BORDER..here.width - IMAGE_BORDER {
                    let v = here.at(x, y);
                    if v.abs() <= threshold || !is_extremum(below, here, above, x, y, v) {
                        continue;
                    }

                    let dxx = here.at(x + 1, y) + here.at(x - 1, y) - 2.0 * v;
                    let dyy = here.at(x, y + 1) + here.at(x, y - 1) - 2.0 * v;
                    let dxy = (here.at(x + 1, y + 1) - here.at(x - 1, y + 1) - here.at(x + 1, y - 1)
                        + here.at(x - 1, y - 1))
                        / 4.0;
                    let trace = dxx + dyy;
                    let det = dxx * dyy - dxy * dxy;
                    if det <= 0.0 || trace * trace * edge >= (edge + 1.0) * (edge + 1.0) * det {
                        continue;
                    }

                    out.push(Candidate {
                        keypoint: KeyPoint {
                            x: x as f32 * octave_scale,
                            y: y as f32 * octave_scale,
                            size: 2.0 * layer_sigmas[layer] * octave_scale,
                            angle: 0.0,
                            response: v.abs(),
                            octave,
                        },
                        octave,
                        layer,
                        x,
                        y,
                    });
                }
            }
        }
    }
}

fn is_extremum(below: &Plane, here: &Plane, above: &Plane, x: usize, y: usize, v: f32) -> bool {
    let maximum = v > 0.0;
    for plane in [below, here, above] {
        for ny in y - 1..=y + 1 {
            for nx in x - 1..=x + 1 {
                if std::ptr::eq(plane, here) && nx == x && ny == y {
                    continue;
                }
                let n = plane.at(nx, ny);
                if (maximum && n > v) || (!maximum && n < v) {
                    return false;
                }
            }
        }
    }
    true
}

fn dominant_orientation(plane: &Plane, x: usize, y: usize, scale: f32) -> f32 {
    let sigma = ORI_SIGMA_FACTOR * scale;
    let radius = (ORI_RADIUS_FACTOR * sigma).round() as isize;
    let denom = 2.0 * sigma * sigma;
    let mut hist = [0.0f32; ORI_BINS];

    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let Some((mag, ori)) = plane.gradient(x as isize + dx, y as isize + dy) else {
                continue;
            };
            let weight = (-((dx * dx + dy * dy) as f32) / denom).exp();
            let bin = ((ori + PI) / (2.0 * PI) * ORI_BINS as f32).round() as usize % ORI_BINS;
            hist[bin] += weight * mag;
        }
    }

    let smoothed: Vec<f32> = (0..ORI_BINS)
        .map(|i| {
            let at = |offset: isize| hist[(i as isize + offset).rem_euclid(ORI_BINS as isize) as usize];
            (at(-2) + at(2)) / 16.0 + (at(-1) + at(1)) * 4.0 / 16.0 + at(0) * 6.0 / 16.0
        })
        .collect();

    let (best, _) = smoothed
        .iter()
        .enumerate()
        .fold((0, f32::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
    let left = smoothed[(best + ORI_BINS - 1) % ORI_BINS];
    let right = smoothed[(best + 1) % ORI_BINS];
    let peak = smoothed[best];
    let denom = left - 2.0 * peak + right;
    let offset = if denom.abs() > f32::EPSILON {
        0.5 * (left - right) / denom
    } else {
        0.0
    };
    (best as f32 + offset) * 2.0 * PI / ORI_BINS as f32 - PI
}

fn describe(plane: &Plane, x: usize, y: usize, scale: f32, angle: f32) -> Descriptor {
    let d = DESCR_WIDTH as f32;
    let hist_width = DESCR_SCALE * scale;
    let radius = (hist_width * SQRT_2 * (d + 1.0) * 0.5).round() as isize;
    let (sin_t, cos_t) = angle.sin_cos();
    let weight_denom = 2.0 * (0.5 * d) * (0.5 * d);
    let bins_per_rad = DESCR_BINS as f32 / (2.0 * PI);
    let mut hist = [0.0f32; DESCRIPTOR_LEN];

    for i in -radius..=radius {
        for j in -radius..=radius {
            let x_rot = (j as f32 * cos_t + i as f32 * sin_t) / hist_width;
            let y_rot = (-(j as f32) * sin_t + i as f32 * cos_t) / hist_width;
            let rbin = y_rot + d / 2.0 - 0.5;
            let cbin = x_rot + d / 2.0 - 0.5;
            if rbin <= -1.0 || rbin >= d || cbin <= -1.0 || cbin >= d {
                continue;
            }
            let Some((mag, ori)) = plane.gradient(x as isize + j, y as isize + i) else {
                continue;
            };
            let weight = (-(x_rot * x_rot + y_rot * y_rot) / weight_denom).exp();
            let obin = (ori - angle).rem_euclid(2.0 * PI) * bins_per_rad;
            accumulate(&mut hist, rbin, cbin, obin, mag * weight);
        }
    }

    normalize(&mut hist);
    for v in hist.iter_mut() {
        *v = v.min(DESCR_MAG_CLAMP);
    }
    normalize(&mut hist);
    hist
}

/// Trilinear distribution of `value` over the row, column and orientation bins.
fn accumulate(hist: &mut Descriptor, rbin: f32, cbin: f32, obin: f32, value: f32) {
    let (r0, c0, o0) = (rbin.floor(), cbin.floor(), obin.floor());
    let (fr, fc, fo) = (rbin - r0, cbin - c0, obin - o0);
    let (r0, c0, o0) = (r0 as isize, c0 as isize, o0 as isize);

    for (dr, wr) in [(0, 1.0 - fr), (1, fr)] {
        let r = r0 + dr;
        if r < 0 || r >= DESCR_WIDTH as isize {
            continue;
        }
        for (dc, wc) in [(0, 1.0 - fc), (1, fc)] {
            let c = c0 + dc;
            if c < 0 || c >= DESCR_WIDTH as isize {
                continue;
            }
            for (dor, wo) in [(0, 1.0 - fo), (1, fo)] {
                let o = (o0 + dor).rem_euclid(DESCR_BINS as isize) as usize;
                let idx = (r as usize * DESCR_WIDTH + c as usize) * DESCR_BINS + o;
                hist[idx] += value * wr * wc * wo;
            }
        }
    }
}

fn normalize(hist: &mut Descriptor) {
    let norm = hist.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        hist.iter_mut().for_each(|v| *v /= norm);
    }
}

/// One candidate correspondence between a query and a train descriptor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DescriptorMatch {
    pub query: usize,
    pub train: usize,
    pub distance: f32,
}

fn l2_distance(a: &Descriptor, b: &Descriptor) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// For every query descriptor, the `k` nearest train descriptors by L2 distance, nearest first.
pub fn knn_match(query: &[Descriptor], train: &[Descriptor], k: usize) -> Vec<Vec<DescriptorMatch>> {
    query
        .par_iter()
        .enumerate()
        .map(|(query_idx, q)| {
            let mut distances: Vec<(usize, f32)> = train
                .iter()
                .enumerate()
                .map(|(idx, t)| (idx, l2_distance(q, t)))
                .collect();
            distances.sort_by(|a, b| a.1.total_cmp(&b.1));
            distances
                .into_iter()
                .take(k)
                .map(|(train_idx, distance)| DescriptorMatch {
                    query: query_idx,
                    train: train_idx,
                    distance,
                })
                .collect()
        })
        .collect()
}

/// Keeps nearest matches that are clearly better than the runner-up:
/// `best.distance < ratio * second.distance`.
pub fn filter_by_ratio_test(matches: &[Vec<DescriptorMatch>], ratio: f32) -> Vec<DescriptorMatch> {
    matches
        .iter()
        .filter_map(|knn| match knn.as_slice() {
            [best, second, ..] if best.distance < ratio * second.distance => Some(*best),
            _ => None,
        })
        .collect()
}

/// Knn (k = 2) matching followed by the ratio test.
pub fn ratio_matches(query: &Features, train: &Features, ratio: f32) -> Vec<DescriptorMatch> {
    if query.is_empty() || train.len() < 2 {
        return Vec::new();
    }
    filter_by_ratio_test(&knn_match(&query.descriptors, &train.descriptors, 2), ratio)
}
