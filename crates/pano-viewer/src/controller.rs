//! Navigation over a static panorama with a cached sampling map.

use image::{Rgb, RgbImage};
use pano_core::{
    BorderMode, ProjectionError, SamplingMap, build_spherical_sampling_map,
    overlay::{GLYPH_HEIGHT, draw_text, shade_rect, text_width},
    remap_packed3,
};
use tracing::debug;

use crate::navigation::{InputEvent, NavigationState};

const HUD_ORIGIN: i32 = 10;
const HUD_SCALE: i32 = 2;
const HUD_PAD: i32 = 4;
const HUD_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

struct CachedMap {
    state: NavigationState,
    map: SamplingMap,
}

pub struct NavigationController {
    panorama: RgbImage,
    state: NavigationState,
    cache: Option<CachedMap>,
    regenerations: u64,
}

impl NavigationController {
    pub fn new(panorama: RgbImage, state: NavigationState) -> Self {
        Self {
            panorama,
            state,
            cache: None,
            regenerations: 0,
        }
    }

    pub fn state(&self) -> &NavigationState {
        &self.state
    }

    pub fn panorama(&self) -> &RgbImage {
        &self.panorama
    }

    /// Number of times the sampling map has been rebuilt.
    pub fn map_regenerations(&self) -> u64 {
        self.regenerations
    }

    /// Applies an input event. Returns `false` when the viewer should quit.
    pub fn handle(&mut self, event: InputEvent) -> bool {
        self.state.apply(event)
    }

    /// The sampling map for the current state, rebuilt only when the state changed.
    pub fn sampling_map(&mut self) -> Result<&SamplingMap, ProjectionError> {
        let size = self.panorama.dimensions();
        cached_map(&mut self.cache, &self.state, size, &mut self.regenerations)
    }

    /// Resamples the panorama for the current look direction, without the HUD.
    pub fn render_view(&mut self) -> Result<RgbImage, ProjectionError> {
        let (width, height) = self.panorama.dimensions();
        let map = cached_map(
            &mut self.cache,
            &self.state,
            (width, height),
            &mut self.regenerations,
        )?;
        // Horizontal wrap keeps the seam at azimuth ±180° continuous.
        let data = remap_packed3(self.panorama.as_raw(), width, height, map, BorderMode::Wrap);
        RgbImage::from_raw(map.width(), map.height(), data).ok_or_else(|| {
            ProjectionError::DegenerateInput("remapped view has the wrong size".into())
        })
    }

    /// Renders the current view with the yaw/pitch/FOV readout.
    pub fn render(&mut self) -> Result<RgbImage, ProjectionError> {
        let mut view = self.render_view()?;
        draw_hud(&mut view, &self.state);
        Ok(view)
    }
}

fn cached_map<'a>(
    cache: &'a mut Option<CachedMap>,
    state: &NavigationState,
    (source_width, source_height): (u32, u32),
    regenerations: &mut u64,
) -> Result<&'a SamplingMap, ProjectionError> {
    let cached = match cache.take() {
        Some(cached) if cached.state == *state => cached,
        _ => {
            let map = build_spherical_sampling_map(source_width, source_height, &state.view_params())?;
            *regenerations += 1;
            debug!(
                yaw = state.yaw(),
                pitch = state.pitch(),
                fov = state.fov(),
                "sampling map rebuilt"
            );
            CachedMap { state: *state, map }
        }
    };
    Ok(&cache.insert(cached).map)
}

/// Draws the navigation readout in the top-left corner on a shaded band.
pub fn draw_hud(image: &mut RgbImage, state: &NavigationState) {
    let text = state.to_string();
    shade_rect(
        image,
        HUD_ORIGIN - HUD_PAD,
        HUD_ORIGIN - HUD_PAD,
        HUD_ORIGIN + text_width(&text, HUD_SCALE) + HUD_PAD,
        HUD_ORIGIN + GLYPH_HEIGHT * HUD_SCALE + HUD_PAD,
    );
    draw_text(image, HUD_ORIGIN, HUD_ORIGIN, &text, HUD_COLOR, HUD_SCALE);
}
