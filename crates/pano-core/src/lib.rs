//! Geometry and image analysis shared by panorama capture and viewing.
//!
//! - [`projection`]: cylindrical pre-warp and spherical view sampling maps.
//! - [`gate`]: scene-change heuristic for frame acceptance.
//! - [`loop_closure`]: detects that a rotating capture has come full circle.
//! - [`stitcher`]: the fusion contract and built-in stitchers.

pub mod features;
pub mod gate;
pub mod imaging;
pub mod loop_closure;
pub mod overlay;
pub mod projection;
pub mod remap;
pub mod stitcher;

#[cfg(test)]
pub(crate) mod testing;

pub use gate::{GATE_WIDTH, mean_luminance_difference, should_capture};
pub use loop_closure::{LoopClosureCheck, LoopClosureDetector};
pub use projection::{
    DEFAULT_FOV_DEGREES, ProjectionError, ProjectionParams, ViewParams,
    build_spherical_sampling_map, cylindrical_warp,
};
pub use remap::{BorderMode, SamplingMap, remap_packed3};
#[cfg(feature = "opencv")]
pub use stitcher::OpenCvStitcher;
pub use stitcher::{StitchFailure, StitchOutcome, Stitcher, TranslationStitcher};
