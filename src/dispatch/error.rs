//! Error types for granule dispatch.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Detect,
    Fit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Detect => write!(f, "detect"),
            Stage::Fit => write!(f, "fit"),
        }
    }
}

/// Errors from the gate check and the external pipeline.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The metadata tool could not produce a usable dump. Processing goes on.
    #[error("Gate check for {} failed: {reason}", file.display())]
    GateCheckFailed { file: PathBuf, reason: String },

    /// A stage could not be launched or exited abnormally. The granule is abandoned.
    #[error("Stage {stage} failed for granule {granule}: {reason}")]
    StageFailed {
        stage: Stage,
        granule: String,
        reason: String,
        /// Captured stdout and stderr of the stage
        output: String,
    },

    #[error("Granule {granule} has no trigger file")]
    MissingTrigger { granule: String },

    #[error("Cannot create output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
