//! Look-around viewer for cylindrical panoramas.
//!
//! A [`NavigationController`] owns the yaw, pitch and field of view of a virtual camera and
//! regenerates the spherical sampling map only when they change. The headless [`run`] loop
//! feeds it commands from a script or standard input and writes rendered views to disk.

pub mod config;
pub mod controller;
pub mod error;
pub mod navigation;
pub mod runner;
pub mod script;

pub use config::{ViewCliArgs, ViewerConfig};
pub use controller::{NavigationController, draw_hud};
pub use error::ViewerError;
pub use navigation::{InputEvent, NavigationState};
pub use runner::{ViewerExit, ViewerSummary, load_panorama, run};
pub use script::{ScriptCommand, parse_line};
