//! Display sink helpers: the latest live frame, the capture overlay and JPEG encoding.

use std::sync::{Mutex, MutexGuard, PoisonError};

use image::{ImageResult, Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use pano_core::overlay::{GLYPH_HEIGHT, draw_text, fill_circle, shade_rect};
use video_ingest::Frame;

use crate::events::progress_percent;

pub const JPEG_QUALITY: u8 = 85;

const REC_RED: Rgb<u8> = Rgb([255, 0, 0]);
const COUNT_GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const PROGRESS_CYAN: Rgb<u8> = Rgb([0, 255, 255]);

/// Most recent frame seen by the acceptance loop, for display only.
#[derive(Debug, Default)]
pub struct LivePreview {
    frame: Mutex<Option<Frame>>,
}

impl LivePreview {
    fn lock(&self) -> MutexGuard<'_, Option<Frame>> {
        self.frame.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, frame: Frame) {
        *self.lock() = Some(frame);
    }

    pub fn latest(&self) -> Option<Frame> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }
}

/// Draws the recording indicator, frame count and progress on a working copy of `frame`.
pub fn render_overlay(frame: &Frame, total_frames: u64, recording: bool) -> RgbImage {
    let mut image = frame.to_rgb_image();
    let height = image.height() as i32;
    let width = image.width() as i32;

    if recording {
        fill_circle(&mut image, 20, 20, 8, REC_RED);
        draw_text(&mut image, 35, 20 - GLYPH_HEIGHT, "REC", REC_RED, 2);
    }

    let scale = 2;
    let line = GLYPH_HEIGHT * scale + 6;
    shade_rect(&mut image, 0, height - 2 * line - 6, width - 1, height - 1);
    draw_text(
        &mut image,
        10,
        height - 2 * line,
        &format!("PROGRESS: {}%", progress_percent(total_frames)),
        PROGRESS_CYAN,
        scale,
    );
    draw_text(
        &mut image,
        10,
        height - line,
        &format!("FRAMES: {total_frames}"),
        COUNT_GREEN,
        scale,
    );
    image
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut buffer = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buffer)
}
