use std::{path::PathBuf, process::ExitStatus};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad species lists, duplicate short codes, pool misuse; detected before any task runs
    #[error("configuration error: {0}")]
    Config(String),
    /// An upstream genome artifact is absent; fatal to the whole pair
    #[error("missing prerequisite for {species}: {what} under {}", .dir.display())]
    MissingPrerequisite {
        species: String,
        what: String,
        dir: PathBuf,
    },
    /// Non-zero exit of an external program; fatal to the owning task only
    #[error("{program} failed ({status}): {command}")]
    ToolFailed {
        program: String,
        command: String,
        status: ExitStatus,
    },
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
