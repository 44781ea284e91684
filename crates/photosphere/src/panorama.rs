//! The single current-panorama slot written by the stitch scheduler.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use image::{ImageFormat, RgbImage};
use pano_core::StitchFailure;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("no panorama to save")]
    NoPanorama,
    #[error("unsupported output format `{0}`; use .jpg, .jpeg or .png")]
    UnsupportedFormat(String),
    #[error("failed to encode panorama: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to write panorama: {0}")]
    Io(#[from] io::Error),
}

/// Read-only copy of the slot.
#[derive(Clone, Debug, Default)]
pub struct PanoramaSnapshot {
    /// Last successfully fused panorama.
    pub image: Option<Arc<RgbImage>>,
    /// Incremented on every successful publish; never decreases.
    pub generation: u64,
    /// Reason of the most recent failed attempt, cleared by the next success.
    pub last_failure: Option<StitchFailure>,
    /// Fusion attempts since the last reset.
    pub attempts: u64,
}

impl PanoramaSnapshot {
    pub fn is_empty(&self) -> bool {
        self.image.is_none()
    }
}

#[derive(Debug, Default)]
pub struct PanoramaSlot {
    state: Mutex<PanoramaSnapshot>,
}

impl PanoramaSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PanoramaSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a new panorama and returns its generation.
    pub fn publish_success(&self, image: RgbImage) -> u64 {
        let mut state = self.lock();
        Self::store_success(&mut state, image)
    }

    /// Stores `image` only if `current()` still holds once the slot is locked, so a
    /// result from a stopped session cannot land after the slot was reset.
    pub fn publish_success_if(
        &self,
        image: RgbImage,
        current: impl FnOnce() -> bool,
    ) -> Option<u64> {
        let mut state = self.lock();
        current().then(|| Self::store_success(&mut state, image))
    }

    fn store_success(state: &mut PanoramaSnapshot, image: RgbImage) -> u64 {
        state.generation += 1;
        state.attempts += 1;
        state.image = Some(Arc::new(image));
        state.last_failure = None;
        state.generation
    }

    /// Records a failed attempt. The previous image and generation stay untouched.
    pub fn publish_failure(&self, reason: StitchFailure) {
        self.publish_failure_if(reason, || true);
    }

    /// Records a failed attempt if `current()` still holds under the lock.
    pub fn publish_failure_if(
        &self,
        reason: StitchFailure,
        current: impl FnOnce() -> bool,
    ) -> bool {
        let mut state = self.lock();
        if !current() {
            return false;
        }
        state.attempts += 1;
        state.last_failure = Some(reason);
        true
    }

    pub fn snapshot(&self) -> PanoramaSnapshot {
        self.lock().clone()
    }

    pub fn image(&self) -> Option<Arc<RgbImage>> {
        self.lock().image.clone()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Drops the image and failure state. The generation counter keeps counting so that
    /// readers comparing generations never see it go backwards.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.image = None;
        state.last_failure = None;
        state.attempts = 0;
    }

    /// Writes the current panorama to `path`, returning the path actually written.
    ///
    /// A path without an extension gets `.jpg`. An empty slot is rejected before the
    /// filesystem is touched.
    pub fn save(&self, path: &Path) -> Result<PathBuf, SaveError> {
        let image = self.image().ok_or(SaveError::NoPanorama)?;
        let (path, format) = resolve_output(path)?;

        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        image.write_to(&mut writer, format)?;
        writer.flush()?;

        info!(
            path = %path.display(),
            width = image.width(),
            height = image.height(),
            "panorama saved"
        );
        Ok(path)
    }
}

/// Applies the default extension and maps it to an encoder.
pub fn resolve_output(path: &Path) -> Result<(PathBuf, ImageFormat), SaveError> {
    let path = match path.extension() {
        Some(_) => path.to_path_buf(),
        None => path.with_extension("jpg"),
    };
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let format = match ext.as_str() {
        "jpg" | "jpeg" => ImageFormat::Jpeg,
        "png" => ImageFormat::Png,
        _ => return Err(SaveError::UnsupportedFormat(ext)),
    };
    Ok((path, format))
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    fn image(value: u8) -> RgbImage {
        RgbImage::from_pixel(8, 4, Rgb([value, value, value]))
    }

    #[test]
    fn failure_keeps_previous_image_and_generation() {
        let slot = PanoramaSlot::new();
        assert_eq!(slot.publish_success(image(10)), 1);
        slot.publish_failure(StitchFailure::HomographyEstimationFailed);

        let snapshot = slot.snapshot();
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(snapshot.last_failure, Some(StitchFailure::HomographyEstimationFailed));
        assert_eq!(snapshot.image.unwrap().get_pixel(0, 0).0, [10, 10, 10]);
    }

    #[test]
    fn generation_survives_reset() {
        let slot = PanoramaSlot::new();
        slot.publish_success(image(1));
        slot.publish_success(image(2));
        slot.reset();
        assert!(slot.snapshot().is_empty());
        assert_eq!(slot.generation(), 2);
        assert_eq!(slot.publish_success(image(3)), 3);
    }

    #[test]
    fn stale_results_are_not_published() {
        let slot = PanoramaSlot::new();
        assert_eq!(slot.publish_success_if(image(5), || true), Some(1));
        assert_eq!(slot.publish_success_if(image(6), || false), None);
        assert!(!slot.publish_failure_if(StitchFailure::NeedMoreImages, || false));

        let snapshot = slot.snapshot();
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.attempts, 1);
        assert_eq!(snapshot.last_failure, None);
        assert_eq!(snapshot.image.unwrap().get_pixel(0, 0).0, [5, 5, 5]);
    }

    #[test]
    fn saving_empty_slot_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("pano.jpg");
        let slot = PanoramaSlot::new();
        assert!(matches!(slot.save(&target), Err(SaveError::NoPanorama)));
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn save_defaults_to_jpeg_extension() {
        let dir = tempfile::tempdir().unwrap();
        let slot = PanoramaSlot::new();
        slot.publish_success(image(200));
        let written = slot.save(&dir.path().join("pano")).unwrap();
        assert_eq!(written, dir.path().join("pano.jpg"));
        let decoded = image::open(&written).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 4));
    }

    #[test]
    fn png_round_trips_exactly_and_other_formats_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let slot = PanoramaSlot::new();
        slot.publish_success(image(77));
        let written = slot.save(&dir.path().join("pano.PNG")).unwrap();
        let decoded = image::open(&written).unwrap().to_rgb8();
        assert_eq!(decoded, image(77));

        let refused = dir.path().join("pano.bmp");
        assert!(matches!(slot.save(&refused), Err(SaveError::UnsupportedFormat(ext)) if ext == "bmp"));
        assert!(!refused.exists());
    }
}
