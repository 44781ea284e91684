use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pano_viewer::{ViewCliArgs, ViewerConfig};
use photosphere::{CaptureCliArgs, CaptureConfig};

use crate::view;

#[derive(Debug, Parser)]
#[command(
    name = "photosphere",
    version,
    about = "Build a panorama from a live video stream, or look around inside one"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Capture frames from a video source and stitch them into a panorama.
    Capture(CaptureCliArgs),
    /// Navigate a saved cylindrical panorama with scripted commands.
    View(ViewCliArgs),
}

pub fn handle_command(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Capture(args) => {
            let config = CaptureConfig::try_from(args).context("invalid capture options")?;
            photosphere::run(config)
        }
        Command::View(args) => {
            let config = ViewerConfig::try_from(args).context("invalid viewer options")?;
            view::run_view(&config)
        }
    }
}
