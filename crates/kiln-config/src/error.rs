//! Errors raised while reading job and controller documents.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    /// A node lacks a required argument or child (`job` without a name, `shell` without a command).
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    /// Two jobs or nodes share a name.
    #[error("defined twice: {0}")]
    Duplicate(String),

    /// A downstream entry names a job that is not defined.
    #[error("unknown job: {0}")]
    InvalidReference(String),

    #[error("downstream jobs form a cycle: {0}")]
    CycleDetected(String),

    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
