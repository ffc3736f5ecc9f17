//! The JSON body of a push frame.

use std::collections::BTreeMap;

use lodestar_core::ServiceKey;
use lodestar_core::clock::epoch_millis;
use lodestar_state::{Instance, Service, StateResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub instance_id: String,
    pub ip: String,
    pub port: u16,
    pub weight: f64,
    pub healthy: bool,
    pub enabled: bool,
    pub ephemeral: bool,
    pub cluster_name: String,
    pub metadata: BTreeMap<String, String>,
}

impl From<&Instance> for Host {
    fn from(instance: &Instance) -> Self {
        Self {
            instance_id: instance.id(),
            ip: instance.ip.clone(),
            port: instance.port,
            weight: instance.weight,
            healthy: instance.healthy,
            enabled: instance.enabled,
            ephemeral: instance.ephemeral,
            cluster_name: instance.cluster_name.clone(),
            metadata: instance.metadata.clone(),
        }
    }
}

/// What a subscriber learns about a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub name: String,
    pub group: String,
    pub namespace: String,
    pub hosts: Vec<Host>,
    /// Checksum of the service content the hosts were taken from.
    pub checksum: String,
    pub last_ref_time: u64,
    pub reach_protection_threshold: bool,
}

impl ServiceInfo {
    /// Enabled hosts of `service`, with their health flags.
    pub fn from_service(service: &Service) -> StateResult<Self> {
        Ok(Self {
            name: service.key.name.clone(),
            group: service.key.group.clone(),
            namespace: service.key.namespace.clone(),
            hosts: service
                .select(&[], false)
                .instances
                .into_iter()
                .map(Host::from)
                .collect(),
            checksum: service.checksum()?,
            last_ref_time: epoch_millis(),
            reach_protection_threshold: service.select(&[], true).protected,
        })
    }

    /// Body for a key that no longer has a service record.
    pub fn empty(key: &ServiceKey) -> Self {
        Self {
            name: key.name.clone(),
            group: key.group.clone(),
            namespace: key.namespace.clone(),
            hosts: Vec::new(),
            checksum: String::new(),
            last_ref_time: epoch_millis(),
            reach_protection_threshold: false,
        }
    }
}
