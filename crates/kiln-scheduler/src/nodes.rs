//! Connected build nodes.

use kiln_core::channel::RemoteChannel;
use kiln_core::node::{LabelExpr, Node};
use kiln_core::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A node together with the channel used to reach it.
pub struct NodeHandle {
    pub node: Node,
    pub channel: Arc<dyn RemoteChannel>,
    /// Cancelled on disconnect; stops the node's executors from taking work.
    pub stopped: CancellationToken,
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn is_online(&self) -> bool {
        !self.stopped.is_cancelled() && self.channel.is_online()
    }

    pub fn can_take(&self, label: Option<&LabelExpr>) -> bool {
        self.node.num_executors > 0 && self.node.satisfies(label)
    }
}

/// Nodes by name.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<String, Arc<NodeHandle>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(
        &self,
        node: Node,
        channel: Arc<dyn RemoteChannel>,
        stopped: CancellationToken,
    ) -> Result<Arc<NodeHandle>> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&node.name) {
            return Err(Error::Conflict(format!("node '{}' is already connected", node.name)));
        }
        let handle = Arc::new(NodeHandle {
            node,
            channel,
            stopped,
        });
        nodes.insert(handle.node.name.clone(), handle.clone());
        Ok(handle)
    }

    pub fn disconnect(&self, name: &str) -> Option<Arc<NodeHandle>> {
        let handle = self.nodes.write().remove(name)?;
        handle.stopped.cancel();
        Some(handle)
    }

    pub fn get(&self, name: &str) -> Option<Arc<NodeHandle>> {
        self.nodes.read().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<NodeHandle>> {
        self.nodes.read().values().cloned().collect()
    }

    /// True if some connected node could ever run work with `label`.
    pub fn any_can_take(&self, label: Option<&LabelExpr>) -> bool {
        self.nodes.read().values().any(|n| n.can_take(label))
    }
}
