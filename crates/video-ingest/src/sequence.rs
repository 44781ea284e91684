use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use tracing::debug;

use crate::{
    source::FrameSource,
    types::{CaptureError, Frame},
};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "tif"];

/// Replays a directory of still images as if they were live frames.
pub struct ImageSequenceSource {
    label: String,
    paths: Vec<PathBuf>,
    cursor: usize,
    interval: Duration,
    last_read: Option<Instant>,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path, interval: Duration) -> Result<Self, CaptureError> {
        let entries = fs::read_dir(dir)
            .with_context(|| format!("reading image directory {}", dir.display()))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| has_image_extension(path))
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(CaptureError::Open {
                uri: dir.display().to_string(),
            });
        }
        debug!(dir = %dir.display(), images = paths.len(), "image sequence opened");
        Ok(Self::from_paths(dir.display().to_string(), paths, interval))
    }

    pub fn from_paths(label: String, paths: Vec<PathBuf>, interval: Duration) -> Self {
        Self {
            label,
            paths,
            cursor: 0,
            interval,
            last_read: None,
        }
    }

    pub fn remaining(&self) -> usize {
        self.paths.len() - self.cursor
    }
}

impl FrameSource for ImageSequenceSource {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let Some(path) = self.paths.get(self.cursor) else {
            return Err(CaptureError::EndOfStream);
        };
        if let Some(last) = self.last_read {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }
        self.cursor += 1;
        self.last_read = Some(Instant::now());
        let image = image::open(path)
            .map_err(|err| CaptureError::Read(format!("{}: {err}", path.display())))?;
        Ok(Frame::from_rgb_image(&image.into_rgb8()))
    }

    fn describe(&self) -> &str {
        &self.label
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    #[test]
    fn replays_images_in_name_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 2, Rgb([0, 0, 255]))
            .save(dir.path().join("b.png"))
            .unwrap();
        RgbImage::from_pixel(4, 2, Rgb([255, 0, 0]))
            .save(dir.path().join("a.png"))
            .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = ImageSequenceSource::open(dir.path(), Duration::ZERO).unwrap();
        assert_eq!(source.remaining(), 2);
        let first = source.read_frame().unwrap();
        assert_eq!(&first.data()[..3], &[0, 0, 255]);
        let second = source.read_frame().unwrap();
        assert_eq!(&second.data()[..3], &[255, 0, 0]);
        assert!(matches!(source.read_frame(), Err(CaptureError::EndOfStream)));
    }

    #[test]
    fn empty_directory_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageSequenceSource::open(dir.path(), Duration::ZERO),
            Err(CaptureError::Open { .. })
        ));
    }
}
