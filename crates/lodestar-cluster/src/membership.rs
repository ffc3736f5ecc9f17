//! Peer set: tracks registry node health from the outcome of peer calls.
//!
//! Membership itself comes from outside (a static list or an external
//! membership service calling `join`/`leave`). What this module decides is
//! whether a member currently takes part in ownership: a peer is excluded
//! after `failure_threshold` consecutive failed calls and re-admitted after
//! `recovery_threshold` consecutive successes. The local node is always
//! healthy.

use std::collections::BTreeMap;
use std::sync::RwLock;

use lodestar_core::clock::epoch_millis;
use lodestar_state::NodeId;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};

/// Status of a registry node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    /// Reachable, or not yet contacted.
    Up,
    /// Some calls failed but the failure threshold is not reached.
    Suspect,
    /// Excluded from ownership.
    Down,
}

/// In-memory view of a cluster member.
#[derive(Debug, Clone, Serialize)]
pub struct Member {
    pub node_id: NodeId,
    pub status: MemberStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Last successful call (ms since epoch).
    pub last_seen_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl Member {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: MemberStatus::Up,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_seen_ms: None,
            last_error: None,
        }
    }

    fn is_healthy(&self) -> bool {
        self.status != MemberStatus::Down
    }
}

/// Registry nodes known to this node and their health.
pub struct PeerSet {
    local: NodeId,
    members: RwLock<BTreeMap<NodeId, Member>>,
    failure_threshold: u32,
    recovery_threshold: u32,
    healthy_tx: watch::Sender<Vec<NodeId>>,
}

impl PeerSet {
    /// Create a peer set from the configured member list. The local node
    /// is added if the list does not contain it.
    pub fn new(local: impl Into<NodeId>, peers: impl IntoIterator<Item = NodeId>) -> Self {
        let local = local.into();
        let mut members: BTreeMap<NodeId, Member> = peers
            .into_iter()
            .map(|id| (id.clone(), Member::new(id)))
            .collect();
        members
            .entry(local.clone())
            .or_insert_with(|| Member::new(local.clone()));
        let healthy: Vec<NodeId> = members.keys().cloned().collect();
        let (healthy_tx, _) = watch::channel(healthy);

        Self {
            local,
            members: RwLock::new(members),
            failure_threshold: 3,
            recovery_threshold: 1,
            healthy_tx,
        }
    }

    /// Set the consecutive failures that take a peer out of ownership.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the consecutive successes that bring a peer back.
    pub fn with_recovery_threshold(mut self, threshold: u32) -> Self {
        self.recovery_threshold = threshold.max(1);
        self
    }

    pub fn local_id(&self) -> &str {
        &self.local
    }

    pub fn list_members(&self) -> Vec<Member> {
        self.members
            .read()
            .expect("members lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn get_member(&self, node_id: &str) -> Option<Member> {
        self.members
            .read()
            .expect("members lock")
            .get(node_id)
            .cloned()
    }

    /// Every member except the local node, healthy or not.
    pub fn remote_members(&self) -> Vec<NodeId> {
        self.members
            .read()
            .expect("members lock")
            .keys()
            .filter(|id| **id != self.local)
            .cloned()
            .collect()
    }

    /// Sorted healthy members, local node included.
    pub fn healthy(&self) -> Vec<NodeId> {
        self.healthy_tx.borrow().clone()
    }

    /// Receiver that observes every change of the healthy list.
    pub fn watch(&self) -> watch::Receiver<Vec<NodeId>> {
        self.healthy_tx.subscribe()
    }

    /// Add a member announced by the membership source.
    pub fn join(&self, node_id: impl Into<NodeId>) -> bool {
        let node_id = node_id.into();
        let added = {
            let mut members = self.members.write().expect("members lock");
            if members.contains_key(&node_id) {
                false
            } else {
                members.insert(node_id.clone(), Member::new(node_id.clone()));
                true
            }
        };
        if added {
            info!(peer = %node_id, "peer joined");
            self.publish();
        }
        added
    }

    /// Remove a member. The local node cannot leave its own view.
    pub fn leave(&self, node_id: &str) -> bool {
        if node_id == self.local {
            return false;
        }
        let removed = self
            .members
            .write()
            .expect("members lock")
            .remove(node_id)
            .is_some();
        if removed {
            info!(peer = %node_id, "peer left");
            self.publish();
        }
        removed
    }

    /// Record a successful call to `node_id`.
    pub fn record_success(&self, node_id: &str) -> ClusterResult<()> {
        let changed = {
            let mut members = self.members.write().expect("members lock");
            let member = members
                .get_mut(node_id)
                .ok_or_else(|| ClusterError::UnknownPeer(node_id.to_string()))?;
            member.consecutive_failures = 0;
            member.consecutive_successes = member.consecutive_successes.saturating_add(1);
            member.last_seen_ms = Some(epoch_millis());
            member.last_error = None;
            match member.status {
                MemberStatus::Down if member.consecutive_successes >= self.recovery_threshold => {
                    member.status = MemberStatus::Up;
                    info!(peer = %node_id, "peer recovered");
                    true
                }
                MemberStatus::Suspect => {
                    member.status = MemberStatus::Up;
                    false
                }
                _ => false,
            }
        };
        if changed {
            self.publish();
        }
        Ok(())
    }

    /// Record a failed call to `node_id`.
    pub fn record_failure(&self, node_id: &str, reason: &str) -> ClusterResult<()> {
        if node_id == self.local {
            return Ok(());
        }
        let changed = {
            let mut members = self.members.write().expect("members lock");
            let member = members
                .get_mut(node_id)
                .ok_or_else(|| ClusterError::UnknownPeer(node_id.to_string()))?;
            member.consecutive_successes = 0;
            member.consecutive_failures = member.consecutive_failures.saturating_add(1);
            member.last_error = Some(reason.to_string());
            match member.status {
                MemberStatus::Down => false,
                _ if member.consecutive_failures >= self.failure_threshold => {
                    member.status = MemberStatus::Down;
                    warn!(
                        peer = %node_id,
                        failures = member.consecutive_failures,
                        %reason,
                        "peer marked down"
                    );
                    true
                }
                _ => {
                    member.status = MemberStatus::Suspect;
                    debug!(peer = %node_id, failures = member.consecutive_failures, "peer call failed");
                    false
                }
            }
        };
        if changed {
            self.publish();
        }
        Ok(())
    }

    fn publish(&self) {
        let healthy: Vec<NodeId> = self
            .members
            .read()
            .expect("members lock")
            .values()
            .filter(|m| m.node_id == self.local || m.is_healthy())
            .map(|m| m.node_id.clone())
            .collect();
        self.healthy_tx.send_if_modified(|current| {
            if *current == healthy {
                false
            } else {
                *current = healthy;
                true
            }
        });
    }
}
