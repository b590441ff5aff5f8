//! Fingerprint records keyed by artifact hash.
//!
//! Each hash is stored as one JSON record under
//! `fingerprints/<h[0:2]>/<h[2:4]>/<h[4:]>.record`. Updates to the same hash are
//! serialized; different hashes proceed in parallel.

use async_trait::async_trait;
use bytes::Bytes;
use kiln_core::fingerprint::{Fingerprint, FingerprintRecorder, RangeSet};
use kiln_core::persistence::Persistence;
use kiln_core::run::Run;
use kiln_core::{BuildPtr, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};

/// Storage key of the record for `md5sum`.
pub fn record_key(md5sum: &str) -> StorageResult<String> {
    let hash = md5sum.to_ascii_lowercase();
    if hash.len() < 5 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StorageError::InvalidHash(md5sum.to_string()));
    }
    Ok(format!(
        "fingerprints/{}/{}/{}.record",
        &hash[0..2],
        &hash[2..4],
        &hash[4..]
    ))
}

fn decode(key: &str, data: &[u8]) -> StorageResult<Fingerprint> {
    if data.is_empty() {
        return Err(StorageError::Corrupt {
            key: key.to_string(),
            message: "empty record".to_string(),
        });
    }
    serde_json::from_slice(data).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Fingerprint persistence plus the upstream/downstream queries built on it.
pub struct FingerprintStore {
    persistence: Arc<dyn Persistence>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Holds the per-hash lock; drops the map entry once nobody else wants it.
struct HashLock<'a> {
    store: &'a FingerprintStore,
    hash: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for HashLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.store.locks.lock();
        if locks
            .get(&self.hash)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(&self.hash);
        }
    }
}

impl FingerprintStore {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, hash: &str) -> HashLock<'_> {
        let mutex = self
            .locks
            .lock()
            .entry(hash.to_string())
            .or_default()
            .clone();
        let guard = mutex.lock_owned().await;
        HashLock {
            store: self,
            hash: hash.to_string(),
            guard: Some(guard),
        }
    }

    /// Load the record for a hash.
    ///
    /// A zero-length or unparsable record is deleted and reported as absent.
    pub async fn load(&self, md5sum: &str) -> Result<Option<Fingerprint>> {
        let key = record_key(md5sum)?;
        let _lock = self.lock(&md5sum.to_ascii_lowercase()).await;
        self.read(&key).await
    }

    // Caller holds the hash lock.
    async fn read(&self, key: &str) -> Result<Option<Fingerprint>> {
        let Some(data) = self.persistence.read(&key).await? else {
            return Ok(None);
        };
        match decode(key, &data) {
            Ok(fp) => Ok(Some(fp)),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding corrupt fingerprint record");
                self.persistence.delete(key).await?;
                Ok(None)
            }
        }
    }

    /// Replace the record for `fp.md5sum`.
    pub async fn save(&self, fp: &Fingerprint) -> Result<()> {
        let _lock = self.lock(&fp.md5sum).await;
        self.write(fp).await
    }

    async fn write(&self, fp: &Fingerprint) -> Result<()> {
        let key = record_key(&fp.md5sum)?;
        let data = serde_json::to_vec_pretty(fp)?;
        self.persistence.atomic_write(&key, Bytes::from(data)).await
    }

    pub async fn delete(&self, md5sum: &str) -> Result<()> {
        let key = record_key(md5sum)?;
        let _lock = self.lock(&md5sum.to_ascii_lowercase()).await;
        self.persistence.delete(&key).await
    }

    /// Get-or-create the record for `md5sum` and add `user` to its usages.
    ///
    /// `producer` becomes the record's original only when the record is
    /// created here.
    pub async fn record(
        &self,
        md5sum: &str,
        file_name: &str,
        producer: Option<BuildPtr>,
        user: &BuildPtr,
    ) -> Result<Fingerprint> {
        let hash = md5sum.to_ascii_lowercase();
        let key = record_key(&hash)?;
        let _lock = self.lock(&hash).await;

        let mut fp = match self.read(&key).await? {
            Some(fp) => fp,
            None => {
                debug!(md5 = %hash, file = file_name, "New fingerprint");
                Fingerprint::new(producer, file_name, hash.as_str())
            }
        };
        fp.add_for(&user.job, user.number)?;
        self.write(&fp).await?;
        Ok(fp)
    }

    /// Records of every artifact fingerprinted by `run`. Missing records are skipped.
    pub async fn load_for(&self, run: &Run) -> Result<Vec<Fingerprint>> {
        let mut out = Vec::new();
        for md5 in run.fingerprints().values() {
            if let Some(fp) = self.load(md5).await? {
                out.push(fp);
            }
        }
        Ok(out)
    }

    /// Builds of `project` that consumed artifacts produced by `source`.
    ///
    /// With `upstream_culprits`, every artifact `source` touched counts, not
    /// only the ones it produced.
    pub async fn downstream_relationship(
        &self,
        source: &Run,
        project: &str,
        upstream_culprits: bool,
    ) -> Result<RangeSet> {
        let mut rs = RangeSet::new();
        for fp in self.load_for(source).await? {
            let produced = fp
                .original
                .as_ref()
                .is_some_and(|o| o.is(&source.job, source.number));
            if produced || upstream_culprits {
                rs.add_all(&fp.range_set(project));
            }
        }
        Ok(rs)
    }

    /// Newest build of `project` that produced an artifact `sink` used.
    ///
    /// With `upstream_culprits`, the newest build of `project` that used any
    /// of those artifacts counts instead, so intermediate jobs are linked too.
    pub async fn upstream_relationship(
        &self,
        sink: &Run,
        project: &str,
        upstream_culprits: bool,
    ) -> Result<Option<u32>> {
        let mut best: Option<u32> = None;
        for fp in self.load_for(sink).await? {
            if upstream_culprits {
                best = best.max(fp.range_set(project).max());
            } else if let Some(original) = fp.original.as_ref().filter(|o| o.belongs_to(project)) {
                best = best.max(Some(original.number));
            }
        }
        Ok(best)
    }

    /// Project → newest build number that produced an artifact `run` consumed.
    /// The run's own artifacts are excluded.
    pub async fn dependencies(&self, run: &Run) -> Result<BTreeMap<String, u32>> {
        let mut deps: BTreeMap<String, u32> = BTreeMap::new();
        for fp in self.load_for(run).await? {
            let Some(original) = fp.original else {
                continue;
            };
            if original.is(&run.job, run.number) {
                continue;
            }
            let entry = deps.entry(original.job).or_insert(original.number);
            *entry = (*entry).max(original.number);
        }
        Ok(deps)
    }
}

#[async_trait]
impl FingerprintRecorder for FingerprintStore {
    async fn record(
        &self,
        md5sum: &str,
        file_name: &str,
        producer: Option<BuildPtr>,
        user: &BuildPtr,
    ) -> Result<Fingerprint> {
        FingerprintStore::record(self, md5sum, file_name, producer, user).await
    }
}
