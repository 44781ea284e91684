use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;

use crate::navigation::{DEFAULT_FOV, MAX_FOV, MIN_FOV};

/// Largest accepted view edge, in pixels.
const MAX_VIEW_EDGE: u32 = 8192;

#[derive(Clone, Debug, PartialEq)]
pub struct ViewerConfig {
    /// Cylindrical panorama to look around in.
    pub image: PathBuf,
    pub view_width: u32,
    pub view_height: u32,
    /// Initial horizontal field of view, in degrees.
    pub fov: f64,
    /// Command file; `None` reads commands from standard input.
    pub script: Option<PathBuf>,
    /// Final view written when the viewer exits.
    pub output: Option<PathBuf>,
    pub verbose: bool,
}

impl ViewerConfig {
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            view_width: 800,
            view_height: 600,
            fov: DEFAULT_FOV,
            script: None,
            output: None,
            verbose: false,
        }
    }
}

/// CLI arguments accepted by the `view` subcommand.
#[derive(Debug, Default, Args)]
pub struct ViewCliArgs {
    /// Path to the cylindrical panorama image.
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,
    /// Viewer width in pixels (default: 800).
    #[arg(long = "width", value_name = "PX")]
    pub width: Option<u32>,
    /// Viewer height in pixels (default: 600).
    #[arg(long = "height", value_name = "PX")]
    pub height: Option<u32>,
    /// Initial field of view in degrees (default: 90).
    #[arg(long = "fov", value_name = "DEGREES")]
    pub fov: Option<f64>,
    /// Read navigation commands from this file instead of standard input.
    #[arg(long = "script", value_name = "PATH")]
    pub script: Option<PathBuf>,
    /// Write the final view here on exit.
    #[arg(long = "output", short = 'o', value_name = "PATH")]
    pub output: Option<PathBuf>,
    /// Enable verbose logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl TryFrom<ViewCliArgs> for ViewerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ViewCliArgs) -> Result<Self> {
        if args.image.as_os_str().is_empty() {
            bail!("an image path is required");
        }
        let defaults = ViewerConfig::new(args.image);

        let view_width = args.width.unwrap_or(defaults.view_width);
        let view_height = args.height.unwrap_or(defaults.view_height);
        if !(1..=MAX_VIEW_EDGE).contains(&view_width) || !(1..=MAX_VIEW_EDGE).contains(&view_height)
        {
            bail!("View width and height must be between 1 and {MAX_VIEW_EDGE} pixels");
        }

        let fov = args.fov.unwrap_or(defaults.fov);
        if !(MIN_FOV..=MAX_FOV).contains(&fov) {
            bail!("--fov must lie between {MIN_FOV} and {MAX_FOV} degrees");
        }

        Ok(Self {
            view_width,
            view_height,
            fov,
            script: args.script,
            output: args.output,
            verbose: args.verbose,
            ..defaults
        })
    }
}
