use std::{io, path::PathBuf};

use pano_core::ProjectionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("could not load panorama from {path}")]
    Load {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("panorama {path} has no pixels")]
    EmptyPanorama { path: PathBuf },
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error("command line {line}: {message}")]
    Script { line: usize, message: String },
    #[error("failed to write view to {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to read commands: {0}")]
    Io(#[from] io::Error),
}
