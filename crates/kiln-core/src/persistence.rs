//! Durable storage abstraction.
//!
//! Keys are relative, `/`-separated paths such as
//! `fingerprints/ab/cd/ef01.record` or `jobs/app/builds/3/build.json`.

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// Key-value-ish storage for build records and fingerprints.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Read a record. None if it does not exist.
    async fn read(&self, key: &str) -> Result<Option<Bytes>>;

    /// Replace a record so that readers see either the old or the new bytes, never a mix.
    /// On failure the previous record (if any) is left untouched.
    async fn atomic_write(&self, key: &str, data: Bytes) -> Result<()>;

    /// Delete a record. Deleting a missing record is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys that start with `prefix`, in lexical order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Split-and-validate a key into its segments.
pub fn key_segments(key: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = key.split('/').collect();
    if key.is_empty()
        || key.starts_with('/')
        || segments
            .iter()
            .any(|s| s.is_empty() || *s == "." || *s == "..")
    {
        return Err(crate::Error::InvalidInput(format!(
            "invalid storage key '{}'",
            key
        )));
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert_eq!(key_segments("a/b/c.json").unwrap(), vec!["a", "b", "c.json"]);
        for bad in ["", "/abs", "a//b", "a/../b", "./a"] {
            assert!(key_segments(bad).is_err(), "{}", bad);
        }
    }
}
