//! Error types for the engine

use std::path::PathBuf;
use thiserror::Error;

use crate::driver::DriverError;
use crate::interpreter::StepParseError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("A run is already in progress")]
    RunInProgress,

    #[error("Run cancelled")]
    Cancelled,

    #[error("Test case {0} has no steps to run")]
    NoSteps(String),

    #[error("Step {order} is invalid: {source}")]
    InvalidStep {
        order: u32,
        #[source]
        source: StepParseError,
    },

    #[error(transparent)]
    Parse(#[from] StepParseError),

    #[error("Could not find \"{target}\" on the page")]
    TargetNotFound {
        target: String,
        /// Last failure reported by the automation backend
        last_error: Option<String>,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Browser install failed: {0}")]
    Install(String),

    #[error("Path is outside the artifacts directory: {}", .0.display())]
    PathOutsideArtifacts(PathBuf),

    #[error("Artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid URL pattern: {0}")]
    InvalidPattern(String),

    #[error(transparent)]
    Store(#[from] stepwise_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl EngineError {
    pub fn not_found(kind: &str, id: &str) -> Self {
        EngineError::Store(stepwise_common::Error::not_found(kind, id))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
