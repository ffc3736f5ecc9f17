//! DistroMapper: deterministic key ownership.
//!
//! Every node computes the same owner for the same key and the same sorted
//! healthy list, so no coordination is needed beyond agreeing on the list.

use std::sync::{Arc, RwLock};

use lodestar_core::ServiceKey;
use lodestar_state::NodeId;
use sha2::{Digest, Sha256};
use tracing::info;

/// Owner of `key` among `nodes` (which must be sorted and deduplicated).
///
/// An empty list means the node is alone and owns everything.
pub fn owner_in<'a>(nodes: &'a [NodeId], key: &ServiceKey, local: &'a str) -> &'a str {
    if nodes.is_empty() {
        return local;
    }
    let digest = Sha256::digest(key.to_string().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let index = u64::from_be_bytes(prefix) % nodes.len() as u64;
    &nodes[index as usize]
}

/// Current ownership view of the local node.
pub struct DistroMapper {
    local: NodeId,
    view: RwLock<Arc<Vec<NodeId>>>,
}

impl DistroMapper {
    pub fn new(local: impl Into<NodeId>, healthy: Vec<NodeId>) -> Self {
        Self {
            local: local.into(),
            view: RwLock::new(Arc::new(normalize(healthy))),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local
    }

    /// Sorted healthy nodes the current view was computed from.
    pub fn view(&self) -> Arc<Vec<NodeId>> {
        self.view.read().expect("mapper view lock").clone()
    }

    /// Replace the ownership view.
    pub fn install(&self, healthy: Vec<NodeId>) {
        let next = Arc::new(normalize(healthy));
        let mut view = self.view.write().expect("mapper view lock");
        if **view != *next {
            info!(nodes = ?next, "ownership view installed");
            *view = next;
        }
    }

    pub fn owner_of(&self, key: &ServiceKey) -> NodeId {
        let view = self.view();
        owner_in(&view, key, &self.local).to_string()
    }

    pub fn is_owner(&self, key: &ServiceKey) -> bool {
        self.owner_of(key) == self.local
    }

    /// Healthy nodes other than this one.
    pub fn healthy_peers(&self) -> Vec<NodeId> {
        self.view()
            .iter()
            .filter(|id| **id != self.local)
            .cloned()
            .collect()
    }
}

fn normalize(mut nodes: Vec<NodeId>) -> Vec<NodeId> {
    nodes.sort();
    nodes.dedup();
    nodes
}
