//! Domain types for the naming store.
//!
//! All collections are `BTreeMap`s so that serialising a service always
//! yields the same bytes for the same content; checksums and digests rely
//! on that.

use std::collections::BTreeMap;
use std::fmt;

use lodestar_core::ServiceKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{StateError, StateResult};

/// Unique identifier for a registry node (its peer address).
pub type NodeId = String;

/// `ip#port#cluster`, unique within a service.
pub type InstanceId = String;

/// Build the id of an instance from its identifying triple.
pub fn instance_id(ip: &str, port: u16, cluster: &str) -> InstanceId {
    format!("{ip}#{port}#{cluster}")
}

/// Cluster used when a registration does not name one.
pub const DEFAULT_CLUSTER: &str = "DEFAULT";

// ── Revision ──────────────────────────────────────────────────────

/// Version of a service record, compared lexicographically:
/// timestamp first, node id as the tie-break.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub timestamp_ms: u64,
    pub node: NodeId,
}

impl Revision {
    pub fn new(timestamp_ms: u64, node: impl Into<NodeId>) -> Self {
        Self {
            timestamp_ms,
            node: node.into(),
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.timestamp_ms, self.node)
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// One network endpoint serving a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub ip: String,
    pub port: u16,
    pub cluster_name: String,
    pub weight: f64,
    pub healthy: bool,
    pub enabled: bool,
    pub ephemeral: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Last heartbeat (ms since epoch). Local lease bookkeeping only:
    /// excluded from checksums.
    #[serde(default)]
    pub last_beat: u64,
}

impl Instance {
    /// A healthy, enabled, ephemeral instance with weight 1.
    pub fn new(ip: impl Into<String>, port: u16, cluster_name: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            cluster_name: cluster_name.into(),
            weight: 1.0,
            healthy: true,
            enabled: true,
            ephemeral: true,
            metadata: BTreeMap::new(),
            last_beat: 0,
        }
    }

    pub fn persistent(mut self) -> Self {
        self.ephemeral = false;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> InstanceId {
        instance_id(&self.ip, self.port, &self.cluster_name)
    }

    /// `ip:port`
    pub fn addr(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

// ── Cluster ───────────────────────────────────────────────────────

/// How a cluster's persistent instances are probed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum HealthCheckerConfig {
    #[default]
    Tcp,
    Http {
        #[serde(default = "default_http_path")]
        path: String,
        #[serde(default = "default_expected_status")]
        expected_status: u16,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Mysql,
    None,
}

fn default_http_path() -> String {
    "/".to_string()
}

fn default_expected_status() -> u16 {
    200
}

impl HealthCheckerConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            HealthCheckerConfig::Tcp => "TCP",
            HealthCheckerConfig::Http { .. } => "HTTP",
            HealthCheckerConfig::Mysql => "MYSQL",
            HealthCheckerConfig::None => "NONE",
        }
    }
}

/// A named subgroup of a service's instances sharing health-check settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub default_port: u16,
    pub default_check_port: u16,
    #[serde(default)]
    pub health_checker: HealthCheckerConfig,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Probe the instance's own port instead of `default_check_port`.
    pub use_ip_port_for_check: bool,
    #[serde(default)]
    pub ephemeral: BTreeMap<InstanceId, Instance>,
    #[serde(default)]
    pub persistent: BTreeMap<InstanceId, Instance>,
}

impl Cluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_port: 80,
            default_check_port: 80,
            health_checker: HealthCheckerConfig::Tcp,
            metadata: BTreeMap::new(),
            use_ip_port_for_check: true,
            ephemeral: BTreeMap::new(),
            persistent: BTreeMap::new(),
        }
    }

    /// Persistent instances first, then ephemeral, each in id order.
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.persistent.values().chain(self.ephemeral.values())
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.ephemeral.get(id).or_else(|| self.persistent.get(id))
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Instance> {
        match self.ephemeral.get_mut(id) {
            Some(instance) => Some(instance),
            None => self.persistent.get_mut(id),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Instance> {
        self.ephemeral.remove(id).or_else(|| self.persistent.remove(id))
    }

    pub fn len(&self) -> usize {
        self.ephemeral.len() + self.persistent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Port a health probe should target for `instance`.
    pub fn check_port(&self, instance: &Instance) -> u16 {
        if self.use_ip_port_for_check {
            instance.port
        } else {
            self.default_check_port
        }
    }
}

// ── Service ───────────────────────────────────────────────────────

/// Instance selection hint carried for clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Selector {
    #[default]
    None,
    Label {
        expression: String,
    },
}

/// A logical service and its clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub key: ServiceKey,
    pub protect_threshold: f32,
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub last_modified_ms: u64,
    pub revision: Revision,
    #[serde(default)]
    pub clusters: BTreeMap<String, Cluster>,
}

impl Service {
    pub fn new(key: ServiceKey) -> Self {
        Self {
            key,
            protect_threshold: 0.0,
            selector: Selector::None,
            metadata: BTreeMap::new(),
            last_modified_ms: 0,
            revision: Revision::default(),
            clusters: BTreeMap::new(),
        }
    }

    /// All instances across clusters, cluster name order.
    pub fn all_instances(&self) -> impl Iterator<Item = &Instance> {
        self.clusters.values().flat_map(|c| c.instances())
    }

    /// Instances of the named clusters; an empty filter selects every cluster.
    pub fn instances_in(&self, clusters: &[String]) -> Vec<&Instance> {
        self.clusters
            .values()
            .filter(|c| clusters.is_empty() || clusters.iter().any(|n| n == &c.name))
            .flat_map(|c| c.instances())
            .collect()
    }

    pub fn find_instance(&self, id: &str) -> Option<(&Cluster, &Instance)> {
        self.clusters
            .values()
            .find_map(|c| c.get(id).map(|i| (c, i)))
    }

    pub fn instance_count(&self) -> usize {
        self.clusters.values().map(Cluster::len).sum()
    }

    pub fn healthy_count(&self) -> usize {
        self.all_instances().filter(|i| i.healthy).count()
    }

    /// Enabled instances of the named clusters (all clusters when empty).
    ///
    /// With `healthy_only`, unhealthy instances are left out unless the
    /// healthy fraction drops below the protect threshold, in which case
    /// every enabled instance is returned and `protected` is set.
    ///
    /// The threshold belongs to the service, so the fraction is taken over
    /// all selected clusters together: a cluster that is entirely down can be
    /// dropped while its healthy siblings keep the total above the line.
    pub fn select(&self, clusters: &[String], healthy_only: bool) -> Selection<'_> {
        let candidates: Vec<&Instance> = self
            .instances_in(clusters)
            .into_iter()
            .filter(|i| i.enabled)
            .collect();
        if !healthy_only || candidates.is_empty() {
            return Selection {
                instances: candidates,
                protected: false,
            };
        }
        let healthy = candidates.iter().filter(|i| i.healthy).count();
        if (healthy as f32 / candidates.len() as f32) < self.protect_threshold {
            return Selection {
                instances: candidates,
                protected: true,
            };
        }
        Selection {
            instances: candidates.into_iter().filter(|i| i.healthy).collect(),
            protected: false,
        }
    }

    /// SHA-256 (hex) of the service's replicated content.
    ///
    /// Revision, modification time and heartbeat stamps are left out, so two
    /// nodes holding the same instances agree regardless of who wrote them.
    pub fn checksum(&self) -> StateResult<String> {
        let mut canonical = self.clone();
        canonical.revision = Revision::default();
        canonical.last_modified_ms = 0;
        for cluster in canonical.clusters.values_mut() {
            for instance in cluster
                .ephemeral
                .values_mut()
                .chain(cluster.persistent.values_mut())
            {
                instance.last_beat = 0;
            }
        }
        let bytes =
            serde_json::to_vec(&canonical).map_err(|e| StateError::Serialize(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    pub fn digest(&self) -> StateResult<ServiceDigest> {
        Ok(ServiceDigest {
            key: self.key.clone(),
            checksum: self.checksum()?,
            revision: self.revision.clone(),
        })
    }
}

/// Instances picked for a query or a push.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection<'a> {
    pub instances: Vec<&'a Instance>,
    /// The protect threshold kicked in and unhealthy instances are included.
    pub protected: bool,
}

/// Anti-entropy summary of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDigest {
    pub key: ServiceKey,
    pub checksum: String,
    pub revision: Revision,
}

/// Partial update of service-level attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceUpdate {
    pub protect_threshold: Option<f32>,
    pub selector: Option<Selector>,
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Partial update of cluster-level attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterUpdate {
    pub health_checker: Option<HealthCheckerConfig>,
    pub default_port: Option<u16>,
    pub default_check_port: Option<u16>,
    pub use_ip_port_for_check: Option<bool>,
    pub metadata: Option<BTreeMap<String, String>>,
}

// ── Change events ─────────────────────────────────────────────────

/// Where a committed write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Client write, health transition or lease expiry on this node.
    Local,
    /// Record received from a peer.
    Replica,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    Registered { instance: InstanceId },
    Updated { instance: InstanceId },
    Deregistered { instance: InstanceId },
    HealthChanged { instance: InstanceId, healthy: bool },
    Expired { instances: Vec<InstanceId> },
    ServiceUpdated,
    ClusterUpdated { cluster: String },
    Replicated,
}

/// Announcement of one committed write to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub key: ServiceKey,
    pub kind: ChangeKind,
    pub origin: Origin,
    pub revision: Revision,
}
