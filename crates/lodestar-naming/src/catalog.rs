//! Catalog: read-only operator views over services, instances and
//! subscribers.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use lodestar_cluster::DistroMapper;
use lodestar_core::{Page, ServiceKey, paginate};
use lodestar_health::{ClusterRt, HealthMonitor};
use lodestar_push::{Host, SubscriberRegistry};
use lodestar_state::{Cluster, HealthCheckerConfig, NamingStore, NodeId, Selector, Service};
use serde::Serialize;

use crate::error::{NamingError, NamingResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceView {
    pub name: String,
    pub group_name: String,
    pub namespace: String,
    pub protect_threshold: f32,
    pub selector: Selector,
    pub metadata: BTreeMap<String, String>,
    #[serde(rename = "lastModifiedMillis")]
    pub last_modified_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterView {
    pub name: String,
    /// Grouped name of the owning service.
    pub service_name: String,
    pub default_port: u16,
    pub default_check_port: u16,
    pub health_checker: HealthCheckerConfig,
    pub metadata: BTreeMap<String, String>,
    #[serde(rename = "useIPPort4Check")]
    pub use_ip_port_for_check: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceDetail {
    pub service: ServiceView,
    pub clusters: Vec<ClusterView>,
}

/// One instance publishing a service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherRow {
    pub data_id: String,
    pub service_ip: String,
    pub service_port: u16,
    pub cluster_name: String,
    pub weight: f64,
    pub healthy: bool,
    pub ephemeral: bool,
}

/// One client listening to a service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberRow {
    pub addr: SocketAddr,
    pub agent: String,
    pub app: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOverview {
    pub service_name: String,
    pub group_name: String,
    pub pub_infos: Vec<PublisherRow>,
    pub sub_infos: Vec<SubscriberRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHealth {
    pub clusters: Vec<ClusterRt>,
    pub healthy_peers: Vec<NodeId>,
}

pub struct Catalog {
    store: NamingStore,
    subscribers: Arc<SubscriberRegistry>,
    mapper: Arc<DistroMapper>,
    health: Option<Arc<HealthMonitor>>,
}

impl Catalog {
    pub fn new(store: NamingStore, subscribers: Arc<SubscriberRegistry>, mapper: Arc<DistroMapper>) -> Self {
        Self {
            store,
            subscribers,
            mapper,
            health: None,
        }
    }

    /// Source of probe round-trip times for [`Catalog::cluster_health_rt`].
    pub fn with_health(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.health = Some(monitor);
        self
    }

    /// Service attributes and cluster settings, without instances.
    pub fn service_detail(&self, key: &ServiceKey) -> NamingResult<ServiceDetail> {
        let service = self.store.get_service(key)?;
        Ok(ServiceDetail {
            service: ServiceView {
                name: key.name.clone(),
                group_name: key.group.clone(),
                namespace: key.namespace.clone(),
                protect_threshold: service.protect_threshold,
                selector: service.selector.clone(),
                metadata: service.metadata.clone(),
                last_modified_ms: service.last_modified_ms,
            },
            clusters: service
                .clusters
                .values()
                .map(|cluster| cluster_view(key, cluster))
                .collect(),
        })
    }

    /// Every instance of `key` (enabled or not, healthy or not), optionally
    /// limited to one cluster, paged.
    pub fn instance_page(
        &self,
        key: &ServiceKey,
        cluster: Option<&str>,
        page_no: usize,
        page_size: usize,
    ) -> NamingResult<Page<Host>> {
        let service = self.store.get_service(key)?;
        let hosts: Vec<Host> = match cluster {
            Some(name) => service
                .clusters
                .get(name)
                .ok_or_else(|| NamingError::NotFound(format!("cluster {name} in {key}")))?
                .instances()
                .map(Host::from)
                .collect(),
            None => service.all_instances().map(Host::from).collect(),
        };
        Ok(paginate(hosts, page_no, page_size))
    }

    /// Publishers and subscribers of each service in `namespace` whose
    /// grouped name contains `keyword`, paged.
    pub fn service_overview(
        &self,
        namespace: &str,
        keyword: &str,
        page_no: usize,
        page_size: usize,
    ) -> NamingResult<Page<ServiceOverview>> {
        let keys = self.store.list_services(namespace)?;
        let rows: Vec<ServiceOverview> = keys
            .iter()
            .filter(|key| keyword.is_empty() || key.grouped_name().contains(keyword))
            .filter_map(|key| self.store.find_service(key))
            .map(|service| self.overview(&service))
            .collect();
        Ok(paginate(rows, page_no, page_size))
    }

    fn overview(&self, service: &Service) -> ServiceOverview {
        let key = &service.key;
        ServiceOverview {
            service_name: key.name.clone(),
            group_name: key.group.clone(),
            pub_infos: service
                .all_instances()
                .map(|instance| PublisherRow {
                    data_id: key.name.clone(),
                    service_ip: instance.ip.clone(),
                    service_port: instance.port,
                    cluster_name: instance.cluster_name.clone(),
                    weight: instance.weight,
                    healthy: instance.healthy,
                    ephemeral: instance.ephemeral,
                })
                .collect(),
            sub_infos: self
                .subscribers
                .get_subscribers(key)
                .into_iter()
                .map(|s| SubscriberRow {
                    addr: s.addr,
                    agent: s.agent,
                    app: s.app,
                })
                .collect(),
        }
    }

    /// Latest probe round trip per cluster of `key`, with the peers the
    /// ownership view currently counts as healthy.
    pub fn cluster_health_rt(&self, key: &ServiceKey) -> NamingResult<ClusterHealth> {
        self.store.get_service(key)?;
        Ok(ClusterHealth {
            clusters: self
                .health
                .as_ref()
                .map(|monitor| monitor.cluster_rt(key))
                .unwrap_or_default(),
            healthy_peers: self.mapper.healthy_peers(),
        })
    }
}

fn cluster_view(key: &ServiceKey, cluster: &Cluster) -> ClusterView {
    ClusterView {
        name: cluster.name.clone(),
        service_name: key.grouped_name(),
        default_port: cluster.default_port,
        default_check_port: cluster.default_check_port,
        health_checker: cluster.health_checker.clone(),
        metadata: cluster.metadata.clone(),
        use_ip_port_for_check: cluster.use_ip_port_for_check,
    }
}
