//! In-memory persistence, for tests and ephemeral controllers.

use async_trait::async_trait;
use bytes::Bytes;
use kiln_core::persistence::{Persistence, key_segments};
use kiln_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct MemoryPersistence {
    records: Mutex<BTreeMap<String, Bytes>>,
    fail_writes: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, leaving stored records untouched.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Store bytes without validation, e.g. to plant a corrupt record.
    pub fn insert_raw(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.records.lock().insert(key.into(), data.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn read(&self, key: &str) -> Result<Option<Bytes>> {
        key_segments(key)?;
        Ok(self.records.lock().get(key).cloned())
    }

    async fn atomic_write(&self, key: &str, data: Bytes) -> Result<()> {
        key_segments(key)?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other(format!(
                "write of '{}' refused",
                key
            ))));
        }
        self.records.lock().insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        key_segments(key)?;
        self.records.lock().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .records
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
