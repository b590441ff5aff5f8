//! Bounded cache of parsed change logs.

use kiln_core::changelog::ChangeLogSet;
use kiln_core::persistence::Persistence;
use kiln_core::run::Run;
use kiln_core::BuildPtr;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::warn;

/// Change logs keyed by build, loaded lazily from persistence.
///
/// An unreadable or missing change log is treated as empty.
pub struct ChangeSetCache {
    persistence: Arc<dyn Persistence>,
    cache: Mutex<LruCache<BuildPtr, Arc<ChangeLogSet>>>,
}

impl ChangeSetCache {
    pub fn new(persistence: Arc<dyn Persistence>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            persistence,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Change log of `run`.
    pub async fn get(&self, run: &Run) -> Arc<ChangeLogSet> {
        let ptr = run.ptr();
        if let Some(hit) = self.cache.lock().get(&ptr) {
            return hit.clone();
        }

        let Some(key) = run.changelog.as_deref() else {
            return Arc::new(ChangeLogSet::empty());
        };

        let set = match self.persistence.read(key).await {
            Ok(Some(data)) => match serde_json::from_slice::<ChangeLogSet>(&data) {
                Ok(set) => set,
                Err(e) => {
                    warn!(key, error = %e, "Unreadable change log");
                    ChangeLogSet::empty()
                }
            },
            Ok(None) => ChangeLogSet::empty(),
            Err(e) => {
                warn!(key, error = %e, "Failed to read change log");
                return Arc::new(ChangeLogSet::empty());
            }
        };

        let set = Arc::new(set);
        self.cache.lock().put(ptr, set.clone());
        set
    }

    /// Seed the cache with a freshly computed change log.
    pub fn put(&self, ptr: BuildPtr, set: ChangeLogSet) {
        self.cache.lock().put(ptr, Arc::new(set));
    }

    pub fn invalidate(&self, ptr: &BuildPtr) {
        self.cache.lock().pop(ptr);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}
