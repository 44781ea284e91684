//! Virtual camera state for looking around inside a cylindrical panorama.

use std::fmt;

use pano_core::ViewParams;

pub const MAX_PITCH: f64 = 45.0;
pub const MIN_FOV: f64 = 30.0;
pub const MAX_FOV: f64 = 150.0;
pub const DEFAULT_FOV: f64 = 90.0;
/// Degrees of rotation per dragged pixel.
pub const DRAG_SENSITIVITY: f64 = 0.5;
/// Degrees per arrow key press.
pub const KEY_STEP: f64 = 5.0;
/// Degrees of field of view per zoom step.
pub const FOV_STEP: f64 = 5.0;

/// User input the viewer reacts to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InputEvent {
    /// Pointer dragged by `(dx, dy)` pixels with the button held.
    Drag { dx: f64, dy: f64 },
    Left,
    Right,
    Up,
    Down,
    /// Widen the field of view (`+`).
    WidenFov,
    /// Narrow the field of view (`-`).
    NarrowFov,
    /// Look straight ahead again. The field of view is kept.
    Reset,
    Resize { width: u32, height: u32 },
    Quit,
}

impl InputEvent {
    /// Maps a key press to an event. Arrow keys are named `left`, `right`, `up`, `down`.
    pub fn from_key(key: &str) -> Option<Self> {
        let event = match key {
            "q" | "Q" | "esc" | "escape" => InputEvent::Quit,
            "r" | "R" => InputEvent::Reset,
            "+" | "=" => InputEvent::WidenFov,
            "-" => InputEvent::NarrowFov,
            "left" => InputEvent::Left,
            "right" => InputEvent::Right,
            "up" => InputEvent::Up,
            "down" => InputEvent::Down,
            _ => return None,
        };
        Some(event)
    }
}

/// Yaw wraps to `[0, 360)`, pitch clamps to `±MAX_PITCH`, field of view clamps to
/// `[MIN_FOV, MAX_FOV]`. Every constructor and mutator re-establishes those bounds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NavigationState {
    yaw: f64,
    pitch: f64,
    fov: f64,
    view_width: u32,
    view_height: u32,
}

impl NavigationState {
    pub fn new(fov: f64, view_width: u32, view_height: u32) -> Self {
        Self {
            yaw: 0.0,
            pitch: 0.0,
            fov: clamp_fov(fov),
            view_width: view_width.max(1),
            view_height: view_height.max(1),
        }
    }

    pub fn yaw(&self) -> f64 {
        self.yaw
    }

    pub fn pitch(&self) -> f64 {
        self.pitch
    }

    pub fn fov(&self) -> f64 {
        self.fov
    }

    pub fn view_size(&self) -> (u32, u32) {
        (self.view_width, self.view_height)
    }

    pub fn rotate(&mut self, d_yaw: f64, d_pitch: f64) {
        self.yaw = wrap_yaw(self.yaw + d_yaw);
        self.pitch = clamp_pitch(self.pitch + d_pitch);
    }

    pub fn zoom(&mut self, d_fov: f64) {
        self.fov = clamp_fov(self.fov + d_fov);
    }

    pub fn reset(&mut self) {
        self.yaw = 0.0;
        self.pitch = 0.0;
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.view_width = width.max(1);
        self.view_height = height.max(1);
    }

    /// Applies `event`. Returns `false` for [`InputEvent::Quit`], `true` otherwise.
    pub fn apply(&mut self, event: InputEvent) -> bool {
        match event {
            InputEvent::Drag { dx, dy } => {
                self.rotate(dx * DRAG_SENSITIVITY, -dy * DRAG_SENSITIVITY)
            }
            InputEvent::Left => self.rotate(-KEY_STEP, 0.0),
            InputEvent::Right => self.rotate(KEY_STEP, 0.0),
            InputEvent::Up => self.rotate(0.0, KEY_STEP),
            InputEvent::Down => self.rotate(0.0, -KEY_STEP),
            InputEvent::WidenFov => self.zoom(FOV_STEP),
            InputEvent::NarrowFov => self.zoom(-FOV_STEP),
            InputEvent::Reset => self.reset(),
            InputEvent::Resize { width, height } => self.resize(width, height),
            InputEvent::Quit => return false,
        }
        true
    }

    pub fn view_params(&self) -> ViewParams {
        ViewParams::new(
            self.yaw,
            self.pitch,
            self.fov,
            self.view_width,
            self.view_height,
        )
    }
}

impl fmt::Display for NavigationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "YAW {:.1} PITCH {:.1} FOV {:.0}",
            self.yaw, self.pitch, self.fov
        )
    }
}

fn wrap_yaw(yaw: f64) -> f64 {
    if !yaw.is_finite() {
        return 0.0;
    }
    // Adding zero folds -0.0 into 0.0.
    let wrapped = yaw.rem_euclid(360.0) + 0.0;
    // rem_euclid can round up to exactly 360 for tiny negative inputs.
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

fn clamp_pitch(pitch: f64) -> f64 {
    if pitch.is_nan() {
        return 0.0;
    }
    pitch.clamp(-MAX_PITCH, MAX_PITCH)
}

fn clamp_fov(fov: f64) -> f64 {
    if fov.is_nan() {
        return DEFAULT_FOV;
    }
    fov.clamp(MIN_FOV, MAX_FOV)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaw_wraps_both_ways() {
        let mut state = NavigationState::new(90.0, 64, 48);
        state.apply(InputEvent::Left);
        assert_eq!(state.yaw(), 355.0);
        state.rotate(10.0, 0.0);
        assert_eq!(state.yaw(), 5.0);
        state.rotate(-725.0, 0.0);
        assert_eq!(state.yaw(), 0.0);
        state.rotate(-1e-18, 0.0);
        assert!((0.0..360.0).contains(&state.yaw()));
    }

    #[test]
    fn pitch_and_fov_stay_clamped() {
        let mut state = NavigationState::new(500.0, 64, 48);
        assert_eq!(state.fov(), MAX_FOV);
        for _ in 0..20 {
            state.apply(InputEvent::Up);
        }
        assert_eq!(state.pitch(), MAX_PITCH);
        state.apply(InputEvent::Drag { dx: 0.0, dy: 1000.0 });
        assert_eq!(state.pitch(), -MAX_PITCH);
        for _ in 0..40 {
            state.apply(InputEvent::NarrowFov);
        }
        assert_eq!(state.fov(), MIN_FOV);
        state.apply(InputEvent::WidenFov);
        assert_eq!(state.fov(), MIN_FOV + FOV_STEP);
    }

    #[test]
    fn drag_uses_half_degree_per_pixel() {
        let mut state = NavigationState::new(90.0, 64, 48);
        state.apply(InputEvent::Drag { dx: 20.0, dy: 10.0 });
        assert_eq!(state.yaw(), 10.0);
        assert_eq!(state.pitch(), -5.0);
    }

    #[test]
    fn reset_keeps_field_of_view() {
        let mut state = NavigationState::new(60.0, 64, 48);
        state.rotate(33.0, 12.0);
        state.apply(InputEvent::Reset);
        assert_eq!((state.yaw(), state.pitch(), state.fov()), (0.0, 0.0, 60.0));
    }

    #[test]
    fn non_finite_input_is_neutralized() {
        let mut state = NavigationState::new(f64::NAN, 0, 0);
        assert_eq!(state.fov(), DEFAULT_FOV);
        assert_eq!(state.view_size(), (1, 1));
        state.rotate(f64::INFINITY, f64::NAN);
        assert_eq!((state.yaw(), state.pitch()), (0.0, 0.0));
    }

    #[test]
    fn keys_map_to_events() {
        assert_eq!(InputEvent::from_key("q"), Some(InputEvent::Quit));
        assert_eq!(InputEvent::from_key("esc"), Some(InputEvent::Quit));
        assert_eq!(InputEvent::from_key("="), Some(InputEvent::WidenFov));
        assert_eq!(InputEvent::from_key("x"), None);
        let mut state = NavigationState::new(90.0, 64, 48);
        assert!(!state.apply(InputEvent::Quit));
    }

    #[test]
    fn hud_text_matches_state() {
        let mut state = NavigationState::new(90.0, 64, 48);
        state.rotate(12.5, -3.0);
        assert_eq!(state.to_string(), "YAW 12.5 PITCH -3.0 FOV 90");
    }
}
