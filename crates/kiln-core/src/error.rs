//! Error types for Kiln.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An equivalent task is already queued for a job that disallows concurrent builds.
    #[error("duplicate task: {0}")]
    DuplicateTask(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The build cannot continue; the runner jumps straight to cleanup.
    #[error("runner aborted: {0}")]
    RunnerAborted(String),

    /// A suspension point was interrupted (abort request, node shutdown).
    #[error("interrupted")]
    Interrupted,

    #[error("channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error came from an interruption rather than a failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
