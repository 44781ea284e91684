//! Headless viewer loop: loads a panorama and applies navigation commands to it.

use std::{
    io::BufRead,
    path::{Path, PathBuf},
};

use image::RgbImage;
use tracing::{info, info_span, warn};

use crate::{
    config::ViewerConfig,
    controller::NavigationController,
    error::ViewerError,
    navigation::NavigationState,
    script::{ScriptCommand, parse_line},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewerExit {
    /// `q` or `esc` was received.
    Quit,
    /// Commands ran out without a quit.
    EndOfInput,
}

#[derive(Debug)]
pub struct ViewerSummary {
    pub exit: ViewerExit,
    pub state: NavigationState,
    /// Views written by `render` commands and the final output, in order.
    pub rendered: Vec<PathBuf>,
}

pub fn load_panorama(path: &Path) -> Result<RgbImage, ViewerError> {
    let image = image::open(path)
        .map_err(|source| ViewerError::Load {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(ViewerError::EmptyPanorama {
            path: path.to_path_buf(),
        });
    }
    Ok(image)
}

/// Loads the configured panorama and runs `commands` against it until quit or end of
/// input. A malformed command stops the run with [`ViewerError::Script`].
pub fn run(config: &ViewerConfig, commands: impl BufRead) -> Result<ViewerSummary, ViewerError> {
    let span = info_span!("viewer.run", image = %config.image.display());
    let _guard = span.enter();

    let panorama = load_panorama(&config.image)?;
    info!(
        width = panorama.width(),
        height = panorama.height(),
        "panorama loaded"
    );
    let state = NavigationState::new(config.fov, config.view_width, config.view_height);
    let mut controller = NavigationController::new(panorama, state);
    // Surface degenerate geometry before reading any commands.
    controller.sampling_map()?;

    let mut rendered = Vec::new();
    let mut exit = ViewerExit::EndOfInput;
    for (index, line) in commands.lines().enumerate() {
        let line = line?;
        let command = parse_line(&line).map_err(|message| ViewerError::Script {
            line: index + 1,
            message,
        })?;
        match command {
            None => {}
            Some(ScriptCommand::Input(event)) => {
                if !controller.handle(event) {
                    exit = ViewerExit::Quit;
                    break;
                }
            }
            Some(ScriptCommand::Render(path)) => {
                write_view(&mut controller, &path)?;
                rendered.push(path);
            }
            Some(ScriptCommand::Status) => info!("{}", controller.state()),
        }
    }

    if let Some(path) = &config.output {
        write_view(&mut controller, path)?;
        rendered.push(path.clone());
    }
    if exit == ViewerExit::EndOfInput {
        warn!("command input ended without quit");
    }
    info!(exit = ?exit, views = rendered.len(), "viewer finished");

    Ok(ViewerSummary {
        exit,
        state: *controller.state(),
        rendered,
    })
}

fn write_view(controller: &mut NavigationController, path: &Path) -> Result<(), ViewerError> {
    let view = controller.render()?;
    view.save(path).map_err(|source| ViewerError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), state = %controller.state(), "view written");
    Ok(())
}
