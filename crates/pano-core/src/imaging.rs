//! Small pixel helpers shared by the gate, the detectors and the stitchers.

use image::{GrayImage, ImageBuffer, Luma, Rgb, imageops};
use video_ingest::{CaptureError, Frame};

/// BT.601 luma of a BGR frame in 14-bit fixed point, rounded to nearest.
pub fn luminance(frame: &Frame) -> GrayImage {
    let data = frame
        .data()
        .chunks_exact(3)
        .map(|px| {
            let (b, g, r) = (px[0] as u32, px[1] as u32, px[2] as u32);
            ((r * 4899 + g * 9617 + b * 1868 + 8192) >> 14) as u8
        })
        .collect();
    GrayImage::from_raw(frame.width(), frame.height(), data).unwrap_or_default()
}

/// Resizes a frame with a triangle (bilinear) filter, keeping its sequence and timestamp.
pub fn resize_frame(frame: &Frame, width: u32, height: u32) -> Result<Frame, CaptureError> {
    if frame.width() == width && frame.height() == height {
        return Ok(frame.clone());
    }
    // Channel order is irrelevant to the filter, so BGR bytes are resized as-is.
    let buffer: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_raw(frame.width(), frame.height(), frame.data().to_vec()).ok_or(
            CaptureError::BufferSize {
                width: frame.width(),
                height: frame.height(),
                expected: frame.width() as usize * frame.height() as usize * 3,
                actual: frame.data().len(),
            },
        )?;
    let resized = imageops::resize(&buffer, width, height, imageops::FilterType::Triangle);
    frame.derive(resized.into_raw(), width, height)
}

/// Height of a `width`-wide image that keeps the aspect ratio of `src_width` x `src_height`.
pub fn scaled_height(src_width: u32, src_height: u32, width: u32) -> u32 {
    if src_width == 0 {
        return 0;
    }
    ((src_height as f64 * width as f64 / src_width as f64) as u32).max(1)
}

/// Shrinks frames wider than `max_width`, preserving aspect ratio. Narrower frames pass through.
pub fn downscale_to_width(frame: &Frame, max_width: u32) -> Result<Frame, CaptureError> {
    if frame.width() <= max_width {
        return Ok(frame.clone());
    }
    let height = scaled_height(frame.width(), frame.height(), max_width);
    resize_frame(frame, max_width, height)
}

/// Copies a gray image into an `f32` buffer scaled to `[0, 1]`.
pub fn gray_to_f32(image: &GrayImage) -> Vec<f32> {
    image
        .pixels()
        .map(|&Luma([v])| v as f32 / 255.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luminance_of_gray_is_identity() {
        let frame = Frame::from_bgr(vec![0, 0, 0, 77, 77, 77, 255, 255, 255], 3, 1).unwrap();
        let gray = luminance(&frame);
        assert_eq!(gray.as_raw(), &vec![0, 77, 255]);
    }

    #[test]
    fn luminance_weights_green_highest() {
        let blue = Frame::from_bgr(vec![255, 0, 0], 1, 1).unwrap();
        let green = Frame::from_bgr(vec![0, 255, 0], 1, 1).unwrap();
        let red = Frame::from_bgr(vec![0, 0, 255], 1, 1).unwrap();
        let (b, g, r) = (luminance(&blue)[(0, 0)].0[0], luminance(&green)[(0, 0)].0[0], luminance(&red)[(0, 0)].0[0]);
        assert_eq!((b, g, r), (29, 150, 76));
    }

    #[test]
    fn downscale_preserves_aspect_and_identity() {
        let frame = Frame::from_bgr(vec![90; 1600 * 900 * 3], 1600, 900)
            .unwrap()
            .with_sequence(3);
        let small = downscale_to_width(&frame, 800).unwrap();
        assert_eq!((small.width(), small.height()), (800, 450));
        assert_eq!(small.sequence(), 3);
        assert!(small.data().iter().all(|&v| v == 90));

        let narrow = Frame::from_bgr(vec![1; 12], 2, 2).unwrap();
        assert!(downscale_to_width(&narrow, 800).unwrap().shares_pixels(&narrow));
    }
}
