//! Workspace leases.
//!
//! A node's workspace directory is used by at most one build at a time.
//! Builds that want a busy directory wait in a FIFO queue; releasing a lease
//! hands it straight to the first waiter, so no pass ever polls.

use chrono::{DateTime, Utc};
use kiln_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, info};

type Key = (String, PathBuf);

/// Who holds a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    pub owner: String,
    pub since: DateTime<Utc>,
}

struct Waiter {
    id: u64,
    owner: String,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    held: HashMap<Key, Holder>,
    waiters: HashMap<Key, VecDeque<Waiter>>,
    next_waiter: u64,
}

impl Inner {
    /// Pass `key` to the next live waiter, or free it.
    fn release(&mut self, key: &Key) {
        if let Some(queue) = self.waiters.get_mut(key) {
            while let Some(waiter) = queue.pop_front() {
                if waiter.tx.send(()).is_ok() {
                    debug!(node = %key.0, path = %key.1.display(), owner = %waiter.owner, "Workspace handed over");
                    self.held.insert(
                        key.clone(),
                        Holder {
                            owner: waiter.owner,
                            since: Utc::now(),
                        },
                    );
                    if queue.is_empty() {
                        self.waiters.remove(key);
                    }
                    return;
                }
            }
            self.waiters.remove(key);
        }
        self.held.remove(key);
    }
}

/// Lexically normalize `path`: drop `.` components and resolve `..`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Claim on a workspace directory of a node.
///
/// Released when dropped. Custom leases are shared and track nothing.
pub struct Lease {
    list: Option<Arc<Mutex<Inner>>>,
    pub node: String,
    pub path: PathBuf,
    released: AtomicBool,
}

impl Lease {
    pub fn is_custom(&self) -> bool {
        self.list.is_none()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Give the workspace back. Further calls do nothing.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(list) = &self.list {
            debug!(node = %self.node, path = %self.path.display(), "Releasing workspace");
            list.lock().release(&(self.node.clone(), self.path.clone()));
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("node", &self.node)
            .field("path", &self.path)
            .field("custom", &self.is_custom())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Removes a cancelled waiter, or passes on a hand-off it never picked up.
struct WaitGuard {
    list: Arc<Mutex<Inner>>,
    key: Key,
    id: u64,
    rx: oneshot::Receiver<()>,
    done: bool,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut inner = self.list.lock();
        let queued = inner
            .waiters
            .get_mut(&self.key)
            .and_then(|q| q.iter().position(|w| w.id == self.id).map(|i| q.remove(i)))
            .is_some();
        if queued {
            if inner.waiters.get(&self.key).is_some_and(VecDeque::is_empty) {
                inner.waiters.remove(&self.key);
            }
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            inner.release(&self.key);
        }
    }
}

/// Workspaces in use across all nodes.
#[derive(Clone, Default)]
pub struct WorkspaceList {
    inner: Arc<Mutex<Inner>>,
}

impl WorkspaceList {
    pub fn new() -> Self {
        Self::default()
    }

    fn lease(&self, key: Key) -> Lease {
        Lease {
            list: Some(self.inner.clone()),
            node: key.0,
            path: key.1,
            released: AtomicBool::new(false),
        }
    }

    /// Wait until `path` on `node` is free and claim it.
    ///
    /// Dropping the returned future gives up the wait.
    pub async fn allocate(&self, node: &str, path: &Path, owner: &str) -> Result<Lease> {
        let key = (node.to_string(), normalize(path));
        let guard = {
            let mut inner = self.inner.lock();
            if !inner.held.contains_key(&key) {
                inner.held.insert(
                    key.clone(),
                    Holder {
                        owner: owner.to_string(),
                        since: Utc::now(),
                    },
                );
                return Ok(self.lease(key));
            }

            inner.next_waiter += 1;
            let id = inner.next_waiter;
            let (tx, rx) = oneshot::channel();
            inner.waiters.entry(key.clone()).or_default().push_back(Waiter {
                id,
                owner: owner.to_string(),
                tx,
            });
            info!(node, path = %key.1.display(), owner, "Waiting for workspace");
            WaitGuard {
                list: self.inner.clone(),
                key: key.clone(),
                id,
                rx,
                done: false,
            }
        };

        let mut guard = guard;
        let handed = (&mut guard.rx).await;
        guard.done = true;
        handed.map_err(|_| Error::Internal("workspace list went away".to_string()))?;
        Ok(self.lease(key))
    }

    /// Claim `path` on `node` if it is free right now.
    pub fn try_allocate(&self, node: &str, path: &Path, owner: &str) -> Option<Lease> {
        let key = (node.to_string(), normalize(path));
        let mut inner = self.inner.lock();
        if inner.held.contains_key(&key) {
            return None;
        }
        inner.held.insert(
            key.clone(),
            Holder {
                owner: owner.to_string(),
                since: Utc::now(),
            },
        );
        drop(inner);
        Some(self.lease(key))
    }

    /// Claim `base`, or the first free of `base@2`, `base@3`, ...
    pub fn allocate_any(&self, node: &str, base: &Path, owner: &str) -> Lease {
        if let Some(lease) = self.try_allocate(node, base, owner) {
            return lease;
        }
        let base = normalize(base);
        let mut i = 2u32;
        loop {
            let mut candidate = base.clone().into_os_string();
            candidate.push(format!("@{}", i));
            if let Some(lease) = self.try_allocate(node, Path::new(&candidate), owner) {
                return lease;
            }
            i += 1;
        }
    }

    /// A lease that does not exclude anyone.
    pub fn allocate_shared(&self, node: &str, path: &Path) -> Lease {
        Lease {
            list: None,
            node: node.to_string(),
            path: normalize(path),
            released: AtomicBool::new(false),
        }
    }

    /// Workspaces currently held on `node`.
    pub fn in_use(&self, node: &str) -> Vec<(PathBuf, Holder)> {
        let mut held: Vec<_> = self
            .inner
            .lock()
            .held
            .iter()
            .filter(|((n, _), _)| n == node)
            .map(|((_, p), h)| (p.clone(), h.clone()))
            .collect();
        held.sort_by(|a, b| a.0.cmp(&b.0));
        held
    }

    /// Builds waiting for `path` on `node`.
    pub fn waiting(&self, node: &str, path: &Path) -> usize {
        self.inner
            .lock()
            .waiters
            .get(&(node.to_string(), normalize(path)))
            .map_or(0, VecDeque::len)
    }
}
