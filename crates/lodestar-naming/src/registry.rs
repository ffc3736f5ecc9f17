//! Registry: the write and query surface of one node.
//!
//! Writes for keys this node owns are applied to the local store; the
//! change event then drives replication and push. Writes for keys owned
//! elsewhere are forwarded once to the owner. Reads are always served from
//! the local copy, owned or replicated.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use lodestar_cluster::DistroMapper;
use lodestar_core::ServiceKey;
use lodestar_distro::{
    DigestReply, DigestRequest, DistroError, DistroProtocol, DistroRecord, DistroResult, ForwardReply,
    ForwardRequest, ForwardedWrite, MAX_FORWARD_HOPS, PeerEndpoint, QueryReply, QueryRequest, RecordAck,
};
use lodestar_push::{PushService, Subscriber};
use lodestar_state::validate::{validate_instance, validate_protect_threshold};
use lodestar_state::{Instance, NamingStore, NodeId, Service, ServiceUpdate, instance_id};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{NamingError, NamingResult};

/// Page size used when a list request asks for 0.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Where a write landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteAck {
    pub owner: NodeId,
    /// Whether the write changed anything on the owner.
    pub changed: bool,
}

/// Paging for [`Registry::list_services`].
///
/// `page_token` is the last grouped name of the previous page; when present
/// the listing resumes after it and `page_offset` is ignored, so pages stay
/// stable while services come and go.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub page_offset: usize,
    #[serde(default)]
    pub page_size: usize,
    #[serde(default)]
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceList {
    /// Services in the namespace.
    pub count: usize,
    /// Grouped names (`group@@name`) of this page, sorted.
    pub services: Vec<String>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceList {
    pub key: ServiceKey,
    pub instances: Vec<Instance>,
    /// Unhealthy instances are included because the protect threshold
    /// was reached.
    pub protected: bool,
    pub checksum: String,
}

pub struct Registry {
    store: NamingStore,
    distro: Arc<DistroProtocol>,
    push: Arc<PushService>,
}

impl Registry {
    /// `distro` and `push` must work on the same store.
    pub fn new(distro: Arc<DistroProtocol>, push: Arc<PushService>) -> Self {
        Self {
            store: distro.store().clone(),
            distro,
            push,
        }
    }

    pub fn local_id(&self) -> &str {
        self.distro.local_id()
    }

    pub fn store(&self) -> &NamingStore {
        &self.store
    }

    pub fn mapper(&self) -> &Arc<DistroMapper> {
        self.distro.mapper()
    }

    pub fn distro(&self) -> &Arc<DistroProtocol> {
        &self.distro
    }

    pub fn push(&self) -> &Arc<PushService> {
        &self.push
    }

    // ── Writes ────────────────────────────────────────────────────

    /// Register an instance, or update it in place when `(ip, port,
    /// cluster)` is already known.
    pub async fn register_instance(&self, key: &ServiceKey, instance: Instance) -> NamingResult<WriteAck> {
        self.write(ForwardedWrite::Register {
            key: key.clone(),
            instance,
        })
        .await
    }

    /// Remove an instance. Unknown instances are a successful no-op.
    pub async fn deregister_instance(
        &self,
        key: &ServiceKey,
        ip: &str,
        port: u16,
        cluster: &str,
    ) -> NamingResult<WriteAck> {
        self.write(ForwardedWrite::Deregister {
            key: key.clone(),
            instance: instance_id(ip, port, cluster),
        })
        .await
    }

    pub async fn update_instance(&self, key: &ServiceKey, instance: Instance) -> NamingResult<WriteAck> {
        self.write(ForwardedWrite::Update {
            key: key.clone(),
            instance,
        })
        .await
    }

    /// Renew the lease of an ephemeral instance. `changed` is set when the
    /// beat brought an unhealthy instance back.
    pub async fn heartbeat(&self, key: &ServiceKey, ip: &str, port: u16, cluster: &str) -> NamingResult<WriteAck> {
        self.write(ForwardedWrite::Heartbeat {
            key: key.clone(),
            instance: instance_id(ip, port, cluster),
        })
        .await
    }

    pub async fn update_service(&self, key: &ServiceKey, update: ServiceUpdate) -> NamingResult<WriteAck> {
        self.write(ForwardedWrite::UpdateService {
            key: key.clone(),
            update,
        })
        .await
    }

    async fn write(&self, write: ForwardedWrite) -> NamingResult<WriteAck> {
        let key = write.key().clone();
        validate_write(&write)?;

        let owner = self.mapper().owner_of(&key);
        if owner == self.local_id() {
            let changed = self.apply_local(&write)?;
            return Ok(WriteAck { owner, changed });
        }

        debug!(%key, op = write.op(), owner = %owner, "forwarding write to owner");
        match self.distro.forward(&owner, write).await {
            Ok(ForwardReply::Applied { changed }) => Ok(WriteAck { owner, changed }),
            Ok(ForwardReply::NotOwner { owner }) => Err(NamingError::OwnershipMismatch { key, owner }),
            Ok(ForwardReply::NotFound { message }) => Err(NamingError::NotFound(message)),
            Ok(ForwardReply::Invalid { message }) => Err(NamingError::Validation(message)),
            Err(e) => {
                warn!(%key, owner = %owner, error = %e, "forward failed, redirecting caller");
                Err(NamingError::OwnershipMismatch { key, owner })
            }
        }
    }

    fn apply_local(&self, write: &ForwardedWrite) -> NamingResult<bool> {
        let changed = match write {
            ForwardedWrite::Register { key, instance } => {
                self.store.register_instance(key, instance.clone())?;
                true
            }
            ForwardedWrite::Deregister { key, instance } => self.store.deregister_instance(key, instance)?,
            ForwardedWrite::Update { key, instance } => {
                self.store.update_instance(key, instance.clone())?;
                true
            }
            ForwardedWrite::Heartbeat { key, instance } => self.store.heartbeat(key, instance)?,
            ForwardedWrite::UpdateService { key, update } => {
                self.store.update_service(key, update.clone())?;
                true
            }
        };
        Ok(changed)
    }

    /// Apply a write forwarded by a peer. Keys this node does not own are
    /// answered with the owner it knows of; they are never forwarded again.
    pub fn handle_forward(&self, request: ForwardRequest) -> DistroResult<ForwardReply> {
        let key = request.write.key();
        if request.hops > MAX_FORWARD_HOPS {
            return Ok(ForwardReply::Invalid {
                message: format!("write travelled {} hops", request.hops),
            });
        }
        if !self.mapper().is_owner(key) {
            let owner = self.mapper().owner_of(key);
            debug!(%key, from = %request.from, owner = %owner, "forwarded write for a key owned elsewhere");
            return Ok(ForwardReply::NotOwner { owner });
        }
        match self.apply_local(&request.write) {
            Ok(changed) => {
                debug!(%key, from = %request.from, op = request.write.op(), changed, "forwarded write applied");
                Ok(ForwardReply::Applied { changed })
            }
            Err(NamingError::NotFound(message)) => Ok(ForwardReply::NotFound { message }),
            Err(NamingError::Validation(message)) => Ok(ForwardReply::Invalid { message }),
            Err(NamingError::State(e)) => Err(DistroError::State(e)),
            Err(e) => Err(DistroError::Forward(e.to_string())),
        }
    }

    // ── Reads ─────────────────────────────────────────────────────

    pub fn get_service(&self, key: &ServiceKey) -> NamingResult<Arc<Service>> {
        Ok(self.store.get_service(key)?)
    }

    /// Enabled instances of `key`, optionally restricted to `clusters` and
    /// to healthy instances. The protect threshold applies to
    /// `healthy_only` queries.
    pub fn list_instances(&self, key: &ServiceKey, clusters: &[String], healthy_only: bool) -> NamingResult<InstanceList> {
        let service = self.store.get_service(key)?;
        let selection = service.select(clusters, healthy_only);
        if selection.protected {
            debug!(%key, "protect threshold reached, returning all instances");
        }
        Ok(InstanceList {
            key: key.clone(),
            instances: selection.instances.into_iter().cloned().collect(),
            protected: selection.protected,
            checksum: service.checksum()?,
        })
    }

    pub fn list_services(&self, namespace: &str, request: &ListRequest) -> NamingResult<ServiceList> {
        let mut names: Vec<String> = self
            .store
            .list_services(namespace)?
            .iter()
            .map(ServiceKey::grouped_name)
            .collect();
        names.sort();

        let count = names.len();
        let page_size = match request.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n,
        };
        let start = match &request.page_token {
            Some(token) => names.partition_point(|name| name <= token),
            None => request.page_offset.min(count),
        };
        let services: Vec<String> = names.into_iter().skip(start).take(page_size).collect();
        let next_token = if start + services.len() < count {
            services.last().cloned()
        } else {
            None
        };
        Ok(ServiceList {
            count,
            services,
            next_token,
        })
    }

    // ── Subscriptions ─────────────────────────────────────────────

    /// Subscribe a client; it is pushed the current state right away.
    pub async fn subscribe(&self, key: &ServiceKey, subscriber: Subscriber) -> NamingResult<bool> {
        key.validate()?;
        let addr = subscriber.addr;
        let added = self.push.subscribe(key, subscriber).await?;
        if added {
            info!(%key, client = %addr, "subscription accepted");
        }
        Ok(added)
    }

    pub fn unsubscribe(&self, key: &ServiceKey, addr: SocketAddr) -> bool {
        self.push.unsubscribe(key, addr)
    }
}

fn validate_write(write: &ForwardedWrite) -> NamingResult<()> {
    write.key().validate()?;
    match write {
        ForwardedWrite::Register { instance, .. } | ForwardedWrite::Update { instance, .. } => {
            validate_instance(instance)?;
        }
        ForwardedWrite::UpdateService { update, .. } => {
            if let Some(threshold) = update.protect_threshold {
                validate_protect_threshold(threshold)?;
            }
        }
        ForwardedWrite::Deregister { .. } | ForwardedWrite::Heartbeat { .. } => {}
    }
    Ok(())
}

#[async_trait]
impl PeerEndpoint for Registry {
    fn node_id(&self) -> &str {
        self.local_id()
    }

    async fn on_record(&self, record: DistroRecord) -> DistroResult<RecordAck> {
        self.distro.handle_record(record).await
    }

    async fn on_digest(&self, request: DigestRequest) -> DistroResult<DigestReply> {
        self.distro.handle_digest(request).await
    }

    async fn on_query(&self, request: QueryRequest) -> DistroResult<QueryReply> {
        self.distro.handle_query(request).await
    }

    async fn on_forward(&self, request: ForwardRequest) -> DistroResult<ForwardReply> {
        self.handle_forward(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_cluster::PeerSet;
    use lodestar_cluster::mapper::owner_in;
    use lodestar_distro::MemoryNetwork;
    use lodestar_push::{RecordingTransport, SubscriberRegistry};

    struct Node {
        registry: Arc<Registry>,
        push: Arc<RecordingTransport>,
    }

    fn node_ids(n: usize) -> Vec<NodeId> {
        (1..=n).map(|i| format!("10.0.0.{i}:8848")).collect()
    }

    fn cluster(n: usize) -> (Arc<MemoryNetwork>, Vec<Node>) {
        let network = MemoryNetwork::new();
        let ids = node_ids(n);
        let nodes = ids
            .iter()
            .map(|id| {
                let store = NamingStore::new(id.clone());
                let distro = Arc::new(DistroProtocol::new(
                    store.clone(),
                    Arc::new(DistroMapper::new(id.clone(), ids.clone())),
                    Arc::new(PeerSet::new(id.clone(), ids.clone())),
                    network.transport(id.clone()),
                ));
                let (push, _inbound) = RecordingTransport::new(false);
                let service = Arc::new(PushService::new(store, Arc::new(SubscriberRegistry::new()), push.clone()));
                let registry = Arc::new(Registry::new(distro, service));
                network.attach(&registry);
                Node { registry, push }
            })
            .collect();
        (network, nodes)
    }

    /// A key owned by `owner` among `ids`.
    fn key_owned_by(ids: &[NodeId], owner: &str) -> ServiceKey {
        (0..1000)
            .map(|i| ServiceKey::new("public", "group-a", format!("svc-{i}")))
            .find(|key| owner_in(ids, key, owner) == owner)
            .unwrap()
    }

    fn key() -> ServiceKey {
        ServiceKey::new("public", "group-a", "svc-a")
    }

    #[tokio::test]
    async fn owned_write_is_applied_locally() {
        let (_network, nodes) = cluster(1);
        let registry = &nodes[0].registry;

        let ack = registry
            .register_instance(&key(), Instance::new("10.0.0.1", 8080, "DEFAULT"))
            .await
            .unwrap();
        assert_eq!(ack.owner, "10.0.0.1:8848");
        assert!(ack.changed);

        let list = registry.list_instances(&key(), &[], false).unwrap();
        assert_eq!(list.instances.len(), 1);
        assert!(list.instances[0].healthy);
    }

    #[tokio::test]
    async fn reregistration_updates_in_place() {
        let (_network, nodes) = cluster(1);
        let registry = &nodes[0].registry;
        registry
            .register_instance(&key(), Instance::new("10.0.0.1", 8080, "DEFAULT").with_metadata("v", "1"))
            .await
            .unwrap();
        registry
            .register_instance(&key(), Instance::new("10.0.0.1", 8080, "DEFAULT").with_metadata("v", "2"))
            .await
            .unwrap();

        let list = registry.list_instances(&key(), &[], false).unwrap();
        assert_eq!(list.instances.len(), 1);
        assert_eq!(list.instances[0].metadata["v"], "2");
    }

    #[tokio::test]
    async fn deregistering_unknown_instance_is_a_noop() {
        let (_network, nodes) = cluster(1);
        let ack = nodes[0]
            .registry
            .deregister_instance(&key(), "10.0.0.9", 80, "DEFAULT")
            .await
            .unwrap();
        assert!(!ack.changed);
    }

    #[tokio::test]
    async fn queries_on_unknown_services_fail() {
        let (_network, nodes) = cluster(1);
        let registry = &nodes[0].registry;
        assert!(matches!(registry.get_service(&key()), Err(NamingError::NotFound(_))));
        assert!(matches!(
            registry.list_instances(&key(), &[], true),
            Err(NamingError::NotFound(_))
        ));
        assert!(matches!(
            registry.list_services("staging", &ListRequest::default()),
            Err(NamingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_forwarding() {
        let (network, nodes) = cluster(2);
        network.set_down("10.0.0.2:8848", true);
        let foreign = key_owned_by(&node_ids(2), "10.0.0.2:8848");

        let err = nodes[0]
            .registry
            .register_instance(&foreign, Instance::new("10.0.0.1", 8080, "DEFAULT").with_weight(-1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, NamingError::Validation(_)));

        let bad_key = ServiceKey::new("", "group-a", "svc");
        let err = nodes[0]
            .registry
            .register_instance(&bad_key, Instance::new("10.0.0.1", 8080, "DEFAULT"))
            .await
            .unwrap_err();
        assert!(matches!(err, NamingError::Validation(_)));
    }

    #[tokio::test]
    async fn foreign_write_is_forwarded_to_owner() {
        let (_network, nodes) = cluster(2);
        let foreign = key_owned_by(&node_ids(2), "10.0.0.2:8848");

        let ack = nodes[0]
            .registry
            .register_instance(&foreign, Instance::new("10.0.0.7", 8080, "DEFAULT"))
            .await
            .unwrap();
        assert_eq!(ack.owner, "10.0.0.2:8848");
        assert!(nodes[1].registry.get_service(&foreign).is_ok());
        assert!(
            nodes[0].registry.get_service(&foreign).is_err(),
            "the forwarding node only learns through replication"
        );
    }

    #[tokio::test]
    async fn unreachable_owner_redirects_caller() {
        let (network, nodes) = cluster(2);
        network.set_down("10.0.0.2:8848", true);
        let foreign = key_owned_by(&node_ids(2), "10.0.0.2:8848");

        let err = nodes[0]
            .registry
            .register_instance(&foreign, Instance::new("10.0.0.7", 8080, "DEFAULT"))
            .await
            .unwrap_err();
        match err {
            NamingError::OwnershipMismatch { key, owner } => {
                assert_eq!(key, foreign);
                assert_eq!(owner, "10.0.0.2:8848");
            }
            other => panic!("expected redirect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn owner_with_another_view_answers_not_owner() {
        let (_network, nodes) = cluster(2);
        let foreign = key_owned_by(&node_ids(2), "10.0.0.2:8848");
        nodes[1].registry.mapper().install(vec!["10.0.0.1:8848".to_string()]);

        let err = nodes[0]
            .registry
            .register_instance(&foreign, Instance::new("10.0.0.7", 8080, "DEFAULT"))
            .await
            .unwrap_err();
        assert!(matches!(err, NamingError::OwnershipMismatch { owner, .. } if owner == "10.0.0.1:8848"));
        assert!(nodes[1].registry.get_service(&foreign).is_err());
    }

    #[tokio::test]
    async fn forwarded_failures_keep_their_kind() {
        let (_network, nodes) = cluster(2);
        let foreign = key_owned_by(&node_ids(2), "10.0.0.2:8848");

        let err = nodes[0]
            .registry
            .heartbeat(&foreign, "10.0.0.7", 8080, "DEFAULT")
            .await
            .unwrap_err();
        assert!(matches!(err, NamingError::NotFound(_)));
    }

    #[tokio::test]
    async fn over_travelled_forward_is_refused() {
        let (_network, nodes) = cluster(1);
        let reply = nodes[0]
            .registry
            .handle_forward(ForwardRequest {
                from: "10.0.0.9:8848".to_string(),
                write: ForwardedWrite::Heartbeat {
                    key: key(),
                    instance: "10.0.0.1#8080#DEFAULT".to_string(),
                },
                hops: MAX_FORWARD_HOPS + 1,
            })
            .unwrap();
        assert!(matches!(reply, ForwardReply::Invalid { .. }));
    }

    #[tokio::test]
    async fn protect_threshold_returns_every_instance() {
        let (_network, nodes) = cluster(1);
        let registry = &nodes[0].registry;
        for i in 1..=10 {
            registry
                .register_instance(&key(), Instance::new(format!("10.0.1.{i}"), 8080, "DEFAULT"))
                .await
                .unwrap();
        }
        for i in 5..=10 {
            registry
                .store()
                .set_instance_health(&key(), &instance_id(&format!("10.0.1.{i}"), 8080, "DEFAULT"), false)
                .unwrap();
        }
        registry
            .update_service(
                &key(),
                ServiceUpdate {
                    protect_threshold: Some(0.5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let list = registry.list_instances(&key(), &[], true).unwrap();
        assert!(list.protected);
        assert_eq!(list.instances.len(), 10);

        let invalid = registry
            .update_service(
                &key(),
                ServiceUpdate {
                    protect_threshold: Some(1.5),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(invalid, Err(NamingError::Validation(_))));
    }

    #[tokio::test]
    async fn service_listing_pages_by_offset_and_token() {
        let (_network, nodes) = cluster(1);
        let registry = &nodes[0].registry;
        for name in ["svc-c", "svc-a", "svc-e", "svc-b", "svc-d"] {
            registry
                .register_instance(
                    &ServiceKey::new("public", "group-a", name),
                    Instance::new("10.0.0.1", 8080, "DEFAULT"),
                )
                .await
                .unwrap();
        }

        let first = registry
            .list_services(
                "public",
                &ListRequest {
                    page_size: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(first.count, 5);
        assert_eq!(first.services, vec!["group-a@@svc-a", "group-a@@svc-b"]);
        assert_eq!(first.next_token.as_deref(), Some("group-a@@svc-b"));

        let by_offset = registry
            .list_services(
                "public",
                &ListRequest {
                    page_offset: 4,
                    page_size: 2,
                    page_token: None,
                },
            )
            .unwrap();
        assert_eq!(by_offset.services, vec!["group-a@@svc-e"]);
        assert_eq!(by_offset.next_token, None);

        // A service added before the cursor does not shift the next page.
        registry
            .register_instance(
                &ServiceKey::new("public", "group-a", "svc-0"),
                Instance::new("10.0.0.1", 8080, "DEFAULT"),
            )
            .await
            .unwrap();
        let second = registry
            .list_services(
                "public",
                &ListRequest {
                    page_size: 2,
                    page_token: first.next_token,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(second.services, vec!["group-a@@svc-c", "group-a@@svc-d"]);
    }

    #[tokio::test]
    async fn subscribe_passes_through_to_push() {
        let (_network, nodes) = cluster(1);
        let registry = &nodes[0].registry;
        registry
            .register_instance(&key(), Instance::new("10.0.0.1", 8080, "DEFAULT"))
            .await
            .unwrap();

        let client: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert!(registry.subscribe(&key(), Subscriber::new(client)).await.unwrap());
        assert_eq!(nodes[0].push.pushes_to(client).len(), 1);
        assert!(registry.unsubscribe(&key(), client));
    }
}
