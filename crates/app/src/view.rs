use std::{
    fs::File,
    io::{self, BufReader},
};

use anyhow::{Context, Result};
use pano_viewer::{ViewerConfig, ViewerExit};
use photosphere::{config::TelemetryOptions, telemetry};
use tracing::info;

/// Runs the headless viewer against the configured script, or standard input.
pub fn run_view(config: &ViewerConfig) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&TelemetryOptions {
        chrome_trace_path: None,
        verbose: config.verbose,
    });

    let summary = match &config.script {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open command script {}", path.display()))?;
            pano_viewer::run(config, BufReader::new(file))?
        }
        None => {
            info!("reading commands from stdin; `q` quits");
            pano_viewer::run(config, io::stdin().lock())?
        }
    };

    if summary.exit == ViewerExit::Quit {
        info!(state = %summary.state, "viewer closed");
    }
    Ok(())
}
