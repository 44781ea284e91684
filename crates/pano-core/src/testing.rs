//! Deterministic synthetic images for tests.

use image::GrayImage;
use video_ingest::Frame;

const BLOCK: u32 = 6;

/// Blocky pseudo-random texture value at global coordinate `(x, y)`.
pub fn texture_value(x: u32, y: u32, seed: u64) -> u8 {
    let mut h = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (((x / BLOCK) as u64) << 32 | (y / BLOCK) as u64);
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h as u8
}

pub fn textured_gray(width: u32, height: u32, seed: u64) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| image::Luma([texture_value(x, y, seed)]))
}

/// Gray-on-BGR window of the texture starting at column `x0`.
pub fn texture_window(x0: u32, width: u32, height: u32, seed: u64) -> Frame {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            let v = texture_value(x0 + x, y, seed);
            data.extend_from_slice(&[v, v, v]);
        }
    }
    Frame::from_bgr(data, width, height).expect("buffer sized for frame")
}

pub fn textured_frame(width: u32, height: u32, seed: u64) -> Frame {
    texture_window(0, width, height, seed)
}

pub fn uniform_frame(width: u32, height: u32, value: u8) -> Frame {
    Frame::from_bgr(vec![value; (width * height * 3) as usize], width, height)
        .expect("buffer sized for frame")
}
