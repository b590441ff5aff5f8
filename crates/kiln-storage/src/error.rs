//! Storage error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record '{key}': {message}")]
    Corrupt { key: String, message: String },

    #[error("invalid fingerprint hash '{0}'")]
    InvalidHash(String),
}

impl StorageError {
    pub(crate) fn io(key: &str, source: std::io::Error) -> Self {
        StorageError::Io {
            key: key.to_string(),
            source,
        }
    }
}

impl From<StorageError> for kiln_core::Error {
    fn from(err: StorageError) -> Self {
        let message = err.to_string();
        match err {
            StorageError::Io { source, .. } => {
                kiln_core::Error::Io(std::io::Error::new(source.kind(), message))
            }
            StorageError::InvalidHash(_) => kiln_core::Error::InvalidInput(message),
            StorageError::Corrupt { .. } => kiln_core::Error::Internal(message),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
