//! NamingStore: per-service copy-on-write registry state.
//!
//! The outer map is locked only to look up or insert a slot. All work on a
//! service happens under that service's slot lock, and change events are
//! emitted before the lock is released so that listeners observe writes to
//! one key in exactly the order they were applied.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use lodestar_core::clock::epoch_millis;
use lodestar_core::{DEFAULT_NAMESPACE, ServiceKey};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::types::*;
use crate::validate;

/// Outcome of a closure run against a cloned service.
enum Mutation<T> {
    /// Nothing changed; the clone is discarded.
    Unchanged(T),
    /// Local bookkeeping changed (heartbeat stamps). Swapped in without a
    /// new revision or an event.
    Touched(T),
    /// Replicated content changed.
    Changed(ChangeKind, T),
}

struct Slot {
    current: RwLock<Arc<Service>>,
}

struct Inner {
    node: NodeId,
    services: RwLock<HashMap<ServiceKey, Arc<Slot>>>,
    namespaces: RwLock<BTreeSet<String>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>,
}

/// Shared handle to the naming state of one node.
#[derive(Clone)]
pub struct NamingStore {
    inner: Arc<Inner>,
}

impl NamingStore {
    pub fn new(node: impl Into<NodeId>) -> Self {
        let mut namespaces = BTreeSet::new();
        namespaces.insert(DEFAULT_NAMESPACE.to_string());
        Self {
            inner: Arc::new(Inner {
                node: node.into(),
                services: RwLock::new(HashMap::new()),
                namespaces: RwLock::new(namespaces),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Id of the node that stamps local revisions.
    pub fn node_id(&self) -> &str {
        &self.inner.node
    }

    /// Register a listener for change events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.lock().expect("listeners lock").push(tx);
        rx
    }

    // ── Queries ───────────────────────────────────────────────────

    /// Snapshot of a service.
    pub fn get_service(&self, key: &ServiceKey) -> StateResult<Arc<Service>> {
        self.find_service(key)
            .ok_or_else(|| StateError::NotFound(format!("service {key}")))
    }

    pub fn find_service(&self, key: &ServiceKey) -> Option<Arc<Service>> {
        self.slot(key)
            .map(|slot| slot.current.read().expect("service slot lock").clone())
    }

    /// Sorted keys of the services in a namespace.
    pub fn list_services(&self, namespace: &str) -> StateResult<Vec<ServiceKey>> {
        if !self
            .inner
            .namespaces
            .read()
            .expect("namespaces lock")
            .contains(namespace)
        {
            return Err(StateError::NotFound(format!("namespace {namespace}")));
        }
        let services = self.inner.services.read().expect("services lock");
        let mut keys: Vec<ServiceKey> = services
            .keys()
            .filter(|k| k.namespace == namespace)
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.inner
            .namespaces
            .read()
            .expect("namespaces lock")
            .iter()
            .cloned()
            .collect()
    }

    /// Every known key, sorted.
    pub fn keys(&self) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = self
            .inner
            .services
            .read()
            .expect("services lock")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Snapshots of all services accepted by `filter`, key order.
    pub fn services(&self, filter: impl Fn(&ServiceKey) -> bool) -> Vec<Arc<Service>> {
        self.keys()
            .into_iter()
            .filter(|k| filter(k))
            .filter_map(|k| self.find_service(&k))
            .collect()
    }

    /// Anti-entropy digest of all services accepted by `filter`.
    pub fn digest(&self, filter: impl Fn(&ServiceKey) -> bool) -> StateResult<Vec<ServiceDigest>> {
        self.services(filter)
            .iter()
            .map(|service| service.digest())
            .collect()
    }

    // ── Local writes ──────────────────────────────────────────────

    /// Add an instance, or merge into the existing one with the same
    /// `(ip, port, cluster)`.
    ///
    /// A merge replaces weight, enabled flag, metadata and ephemerality.
    /// Persistent instances keep their probed health; ephemeral ones count
    /// the registration as a heartbeat.
    pub fn register_instance(
        &self,
        key: &ServiceKey,
        instance: Instance,
    ) -> StateResult<Arc<Service>> {
        key.validate()?;
        validate::validate_instance(&instance)?;

        let slot = self.slot_or_create(key);
        let id = instance.id();
        self.write(key, &slot, |service| {
            let now = epoch_millis();
            let cluster = service
                .clusters
                .entry(instance.cluster_name.clone())
                .or_insert_with(|| Cluster::new(instance.cluster_name.clone()));

            let mut merged = instance.clone();
            if let Some(existing) = cluster.remove(&id) {
                if !merged.ephemeral && !existing.ephemeral {
                    merged.healthy = existing.healthy;
                }
            }
            if merged.ephemeral {
                merged.healthy = true;
                merged.last_beat = now;
                cluster.ephemeral.insert(id.clone(), merged);
            } else {
                cluster.persistent.insert(id.clone(), merged);
            }
            Ok(Mutation::Changed(
                ChangeKind::Registered {
                    instance: id.clone(),
                },
                (),
            ))
        })?;
        debug!(%key, instance = %id, "instance registered");
        self.get_service(key)
    }

    /// Remove an instance. Unknown services and instances are a successful
    /// no-op; returns whether anything was removed.
    pub fn deregister_instance(&self, key: &ServiceKey, id: &str) -> StateResult<bool> {
        let Some(slot) = self.slot(key) else {
            return Ok(false);
        };
        let removed = self.write(key, &slot, |service| {
            let removed = service
                .clusters
                .values_mut()
                .any(|cluster| cluster.remove(id).is_some());
            if removed {
                Ok(Mutation::Changed(
                    ChangeKind::Deregistered {
                        instance: id.to_string(),
                    },
                    true,
                ))
            } else {
                Ok(Mutation::Unchanged(false))
            }
        })?;
        if removed {
            debug!(%key, instance = %id, "instance deregistered");
        }
        Ok(removed)
    }

    /// Replace weight, enabled flag and metadata of an existing instance.
    pub fn update_instance(&self, key: &ServiceKey, instance: Instance) -> StateResult<Arc<Service>> {
        validate::validate_instance(&instance)?;
        let slot = self
            .slot(key)
            .ok_or_else(|| StateError::NotFound(format!("service {key}")))?;
        let id = instance.id();
        self.write(key, &slot, |service| {
            let current = service
                .clusters
                .get_mut(&instance.cluster_name)
                .and_then(|c| c.get_mut(&id))
                .ok_or_else(|| StateError::NotFound(format!("instance {id} in {key}")))?;
            current.weight = instance.weight;
            current.enabled = instance.enabled;
            current.metadata = instance.metadata.clone();
            Ok(Mutation::Changed(
                ChangeKind::Updated {
                    instance: id.clone(),
                },
                (),
            ))
        })?;
        self.get_service(key)
    }

    /// Refresh the lease of an ephemeral instance.
    ///
    /// Returns `true` when the beat revived an unhealthy instance, which is
    /// the only case that produces a new revision.
    pub fn heartbeat(&self, key: &ServiceKey, id: &str) -> StateResult<bool> {
        let slot = self
            .slot(key)
            .ok_or_else(|| StateError::NotFound(format!("service {key}")))?;
        self.write(key, &slot, |service| {
            let instance = service
                .clusters
                .values_mut()
                .find_map(|c| c.ephemeral.get_mut(id))
                .ok_or_else(|| StateError::NotFound(format!("ephemeral instance {id} in {key}")))?;
            instance.last_beat = epoch_millis();
            if instance.healthy {
                Ok(Mutation::Touched(false))
            } else {
                instance.healthy = true;
                Ok(Mutation::Changed(
                    ChangeKind::HealthChanged {
                        instance: id.to_string(),
                        healthy: true,
                    },
                    true,
                ))
            }
        })
    }

    /// Set the health flag. Returns `true` only when the flag flipped.
    pub fn set_instance_health(&self, key: &ServiceKey, id: &str, healthy: bool) -> StateResult<bool> {
        let slot = self
            .slot(key)
            .ok_or_else(|| StateError::NotFound(format!("service {key}")))?;
        self.write(key, &slot, |service| {
            let instance = service
                .clusters
                .values_mut()
                .find_map(|c| c.get_mut(id))
                .ok_or_else(|| StateError::NotFound(format!("instance {id} in {key}")))?;
            if instance.healthy == healthy {
                return Ok(Mutation::Unchanged(false));
            }
            instance.healthy = healthy;
            Ok(Mutation::Changed(
                ChangeKind::HealthChanged {
                    instance: id.to_string(),
                    healthy,
                },
                true,
            ))
        })
    }

    /// Remove the listed ephemeral instances. Persistent instances are
    /// never expired. Returns the ids actually removed.
    pub fn expire_instances(&self, key: &ServiceKey, ids: &[InstanceId]) -> StateResult<Vec<InstanceId>> {
        let Some(slot) = self.slot(key) else {
            return Ok(Vec::new());
        };
        self.write(key, &slot, |service| {
            let mut removed = Vec::new();
            for cluster in service.clusters.values_mut() {
                for id in ids {
                    if cluster.ephemeral.remove(id).is_some() {
                        removed.push(id.clone());
                    }
                }
            }
            if removed.is_empty() {
                Ok(Mutation::Unchanged(removed))
            } else {
                Ok(Mutation::Changed(
                    ChangeKind::Expired {
                        instances: removed.clone(),
                    },
                    removed,
                ))
            }
        })
    }

    pub fn update_service(&self, key: &ServiceKey, update: ServiceUpdate) -> StateResult<Arc<Service>> {
        if let Some(threshold) = update.protect_threshold {
            validate::validate_protect_threshold(threshold)?;
        }
        let slot = self
            .slot(key)
            .ok_or_else(|| StateError::NotFound(format!("service {key}")))?;
        self.write(key, &slot, |service| {
            if let Some(threshold) = update.protect_threshold {
                service.protect_threshold = threshold;
            }
            if let Some(selector) = update.selector.clone() {
                service.selector = selector;
            }
            if let Some(metadata) = update.metadata.clone() {
                service.metadata = metadata;
            }
            Ok(Mutation::Changed(ChangeKind::ServiceUpdated, ()))
        })?;
        self.get_service(key)
    }

    pub fn update_cluster(
        &self,
        key: &ServiceKey,
        cluster_name: &str,
        update: ClusterUpdate,
    ) -> StateResult<Arc<Service>> {
        let slot = self
            .slot(key)
            .ok_or_else(|| StateError::NotFound(format!("service {key}")))?;
        self.write(key, &slot, |service| {
            let cluster = service
                .clusters
                .get_mut(cluster_name)
                .ok_or_else(|| StateError::NotFound(format!("cluster {cluster_name} in {key}")))?;
            if let Some(checker) = update.health_checker.clone() {
                cluster.health_checker = checker;
            }
            if let Some(port) = update.default_port {
                cluster.default_port = port;
            }
            if let Some(port) = update.default_check_port {
                cluster.default_check_port = port;
            }
            if let Some(flag) = update.use_ip_port_for_check {
                cluster.use_ip_port_for_check = flag;
            }
            if let Some(metadata) = update.metadata.clone() {
                cluster.metadata = metadata;
            }
            Ok(Mutation::Changed(
                ChangeKind::ClusterUpdated {
                    cluster: cluster_name.to_string(),
                },
                (),
            ))
        })?;
        self.get_service(key)
    }

    // ── Replication ───────────────────────────────────────────────

    /// Install a record received from a peer if it wins last-write-wins.
    ///
    /// Returns [`StateError::Conflict`] when the local copy is at least as
    /// new; callers on replication paths log it and move on. Lease stamps
    /// of instances already known here are kept, new ephemeral instances
    /// start a fresh lease.
    pub fn apply_replica(&self, incoming: Service) -> StateResult<Arc<Service>> {
        incoming.key.validate()?;
        let key = incoming.key.clone();
        let slot = self.slot_or_create(&key);

        let mut current = slot.current.write().expect("service slot lock");
        if incoming.revision <= current.revision {
            return Err(StateError::Conflict {
                key: key.to_string(),
                local: current.revision.clone(),
                incoming: incoming.revision,
            });
        }

        let now = epoch_millis();
        let mut next = incoming;
        for cluster in next.clusters.values_mut() {
            for (id, instance) in cluster.ephemeral.iter_mut() {
                instance.last_beat = current
                    .clusters
                    .get(&cluster.name)
                    .and_then(|c| c.ephemeral.get(id))
                    .map(|local| local.last_beat)
                    .unwrap_or(now);
            }
        }
        let revision = next.revision.clone();
        let snapshot = Arc::new(next);
        *current = snapshot.clone();
        self.emit(ChangeEvent {
            key: key.clone(),
            kind: ChangeKind::Replicated,
            origin: Origin::Replica,
            revision: revision.clone(),
        });
        debug!(%key, %revision, "replica applied");
        Ok(snapshot)
    }

    // ── Internals ─────────────────────────────────────────────────

    fn slot(&self, key: &ServiceKey) -> Option<Arc<Slot>> {
        self.inner
            .services
            .read()
            .expect("services lock")
            .get(key)
            .cloned()
    }

    fn slot_or_create(&self, key: &ServiceKey) -> Arc<Slot> {
        if let Some(slot) = self.slot(key) {
            return slot;
        }
        self.inner
            .namespaces
            .write()
            .expect("namespaces lock")
            .insert(key.namespace.clone());
        self.inner
            .services
            .write()
            .expect("services lock")
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Slot {
                    current: RwLock::new(Arc::new(Service::new(key.clone()))),
                })
            })
            .clone()
    }

    fn next_revision(&self, previous: &Revision) -> Revision {
        Revision::new(
            epoch_millis().max(previous.timestamp_ms + 1),
            self.inner.node.clone(),
        )
    }

    fn write<T>(
        &self,
        key: &ServiceKey,
        slot: &Slot,
        f: impl FnOnce(&mut Service) -> StateResult<Mutation<T>>,
    ) -> StateResult<T> {
        let mut current = slot.current.write().expect("service slot lock");
        let mut next = Service::clone(&current);
        match f(&mut next)? {
            Mutation::Unchanged(out) => Ok(out),
            Mutation::Touched(out) => {
                *current = Arc::new(next);
                Ok(out)
            }
            Mutation::Changed(kind, out) => {
                next.revision = self.next_revision(&current.revision);
                next.last_modified_ms = next.revision.timestamp_ms;
                let revision = next.revision.clone();
                *current = Arc::new(next);
                self.emit(ChangeEvent {
                    key: key.clone(),
                    kind,
                    origin: Origin::Local,
                    revision,
                });
                Ok(out)
            }
        }
    }

    fn emit(&self, event: ChangeEvent) {
        self.inner
            .listeners
            .lock()
            .expect("listeners lock")
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ServiceKey {
        ServiceKey::from_grouped("public", "group-a@@svc-a").unwrap()
    }

    fn store() -> NamingStore {
        NamingStore::new("10.0.0.11:8848")
    }

    #[test]
    fn register_is_idempotent_and_merges_metadata() {
        let store = store();
        store
            .register_instance(&key(), Instance::new("10.0.0.1", 8080, "DEFAULT").with_metadata("v", "1"))
            .unwrap();
        let service = store
            .register_instance(&key(), Instance::new("10.0.0.1", 8080, "DEFAULT").with_metadata("v", "2"))
            .unwrap();

        let instances: Vec<_> = service.all_instances().collect();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].metadata.get("v").map(String::as_str), Some("2"));
    }

    #[test]
    fn persistent_reregistration_keeps_probed_health() {
        let store = store();
        let instance = Instance::new("10.0.0.1", 8080, "DEFAULT").persistent();
        store.register_instance(&key(), instance.clone()).unwrap();
        store
            .set_instance_health(&key(), &instance.id(), false)
            .unwrap();

        let service = store
            .register_instance(&key(), instance.clone().with_weight(3.0))
            .unwrap();
        let (_, current) = service.find_instance(&instance.id()).unwrap();
        assert!(!current.healthy);
        assert_eq!(current.weight, 3.0);
    }

    #[test]
    fn deregister_unknown_is_noop() {
        let store = store();
        assert!(!store.deregister_instance(&key(), "10.0.0.9#1#DEFAULT").unwrap());

        store
            .register_instance(&key(), Instance::new("10.0.0.1", 8080, "DEFAULT"))
            .unwrap();
        assert!(!store.deregister_instance(&key(), "10.0.0.9#1#DEFAULT").unwrap());
        assert!(store.deregister_instance(&key(), "10.0.0.1#8080#DEFAULT").unwrap());
        assert_eq!(store.get_service(&key()).unwrap().instance_count(), 0);
    }

    #[test]
    fn unknown_service_and_namespace_are_not_found() {
        let store = store();
        assert!(matches!(store.get_service(&key()), Err(StateError::NotFound(_))));
        assert!(matches!(store.list_services("nope"), Err(StateError::NotFound(_))));
        assert!(store.list_services("public").unwrap().is_empty());
        assert!(matches!(
            store.update_instance(&key(), Instance::new("10.0.0.1", 1, "DEFAULT")),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn validation_rejects_bad_input() {
        let store = store();
        let err = store
            .register_instance(&key(), Instance::new("10.0.0.1", 8080, "DEFAULT").with_weight(-1.0))
            .unwrap_err();
        assert!(matches!(err, StateError::Validation(_)));

        let bad_key = ServiceKey::new("public", "g", "");
        assert!(matches!(
            store.register_instance(&bad_key, Instance::new("10.0.0.1", 1, "DEFAULT")),
            Err(StateError::Validation(_))
        ));
        assert!(store.keys().is_empty());
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let store = store();
        let before = store
            .register_instance(&key(), Instance::new("10.0.0.1", 8080, "DEFAULT"))
            .unwrap();
        store
            .register_instance(&key(), Instance::new("10.0.0.2", 8080, "DEFAULT"))
            .unwrap();
        assert_eq!(before.instance_count(), 1);
        assert_eq!(store.get_service(&key()).unwrap().instance_count(), 2);
    }

    #[test]
    fn revisions_increase_per_write() {
        let store = store();
        let a = store
            .register_instance(&key(), Instance::new("10.0.0.1", 8080, "DEFAULT"))
            .unwrap();
        let b = store
            .register_instance(&key(), Instance::new("10.0.0.2", 8080, "DEFAULT"))
            .unwrap();
        assert!(b.revision > a.revision);
        assert_eq!(b.revision.node, "10.0.0.11:8848");
    }

    #[test]
    fn health_events_fire_only_on_transition() {
        let store = store();
        let instance = Instance::new("10.0.0.1", 8080, "DEFAULT").persistent();
        store.register_instance(&key(), instance.clone()).unwrap();
        let mut events = store.subscribe();

        assert!(store.set_instance_health(&key(), &instance.id(), false).unwrap());
        assert!(!store.set_instance_health(&key(), &instance.id(), false).unwrap());

        let event = events.try_recv().unwrap();
        assert_eq!(
            event.kind,
            ChangeKind::HealthChanged {
                instance: instance.id(),
                healthy: false
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn events_follow_apply_order() {
        let store = store();
        let mut events = store.subscribe();
        for port in 1..=5u16 {
            store
                .register_instance(&key(), Instance::new("10.0.0.1", port, "DEFAULT"))
                .unwrap();
        }
        let mut last = Revision::default();
        for port in 1..=5u16 {
            let event = events.try_recv().unwrap();
            assert_eq!(event.origin, Origin::Local);
            assert_eq!(
                event.kind,
                ChangeKind::Registered {
                    instance: instance_id("10.0.0.1", port, "DEFAULT")
                }
            );
            assert!(event.revision > last);
            last = event.revision;
        }
    }

    #[test]
    fn heartbeat_refreshes_without_new_revision() {
        let store = store();
        let instance = Instance::new("10.0.0.1", 8080, "DEFAULT");
        let before = store.register_instance(&key(), instance.clone()).unwrap();
        let mut events = store.subscribe();

        assert!(!store.heartbeat(&key(), &instance.id()).unwrap());
        assert_eq!(store.get_service(&key()).unwrap().revision, before.revision);
        assert!(events.try_recv().is_err());

        store.set_instance_health(&key(), &instance.id(), false).unwrap();
        assert!(store.heartbeat(&key(), &instance.id()).unwrap());
        assert_eq!(store.get_service(&key()).unwrap().healthy_count(), 1);

        assert!(matches!(
            store.heartbeat(&key(), "10.0.0.9#1#DEFAULT"),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn expire_skips_persistent_instances() {
        let store = store();
        let ephemeral = Instance::new("10.0.0.1", 8080, "DEFAULT");
        let persistent = Instance::new("10.0.0.2", 8080, "DEFAULT").persistent();
        store.register_instance(&key(), ephemeral.clone()).unwrap();
        store.register_instance(&key(), persistent.clone()).unwrap();

        let removed = store
            .expire_instances(&key(), &[ephemeral.id(), persistent.id()])
            .unwrap();
        assert_eq!(removed, vec![ephemeral.id()]);
        assert_eq!(store.get_service(&key()).unwrap().instance_count(), 1);
    }

    #[test]
    fn last_write_wins_in_either_order() {
        let mut a = Service::new(key());
        a.revision = Revision::new(100, "node-a");
        a.clusters.insert("DEFAULT".into(), Cluster::new("DEFAULT"));

        let mut b = a.clone();
        b.revision = Revision::new(200, "node-a");
        let instance = Instance::new("10.0.0.7", 80, "DEFAULT");
        b.clusters
            .get_mut("DEFAULT")
            .unwrap()
            .ephemeral
            .insert(instance.id(), instance);

        let in_order = store();
        in_order.apply_replica(a.clone()).unwrap();
        in_order.apply_replica(b.clone()).unwrap();

        let reversed = store();
        reversed.apply_replica(b.clone()).unwrap();
        let err = reversed.apply_replica(a).unwrap_err();
        assert!(matches!(err, StateError::Conflict { .. }));

        for store in [in_order, reversed] {
            let service = store.get_service(&key()).unwrap();
            assert_eq!(service.revision, b.revision);
            assert_eq!(service.instance_count(), 1);
        }
    }

    #[test]
    fn equal_timestamp_breaks_tie_on_node() {
        let store = store();
        let mut low = Service::new(key());
        low.revision = Revision::new(100, "node-a");
        let mut high = low.clone();
        high.revision = Revision::new(100, "node-b");
        high.protect_threshold = 0.5;

        store.apply_replica(high).unwrap();
        assert!(store.apply_replica(low).is_err());
        assert_eq!(store.get_service(&key()).unwrap().protect_threshold, 0.5);
    }

    #[test]
    fn replica_events_are_tagged() {
        let store = store();
        let mut events = store.subscribe();
        let mut service = Service::new(key());
        service.revision = Revision::new(5, "peer");
        store.apply_replica(service).unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.origin, Origin::Replica);
        assert_eq!(event.kind, ChangeKind::Replicated);
    }

    #[test]
    fn local_write_after_replica_outranks_it() {
        let store = store();
        let mut service = Service::new(key());
        service.revision = Revision::new(u64::MAX / 2, "peer");
        store.apply_replica(service).unwrap();
        let after = store
            .register_instance(&key(), Instance::new("10.0.0.1", 8080, "DEFAULT"))
            .unwrap();
        assert_eq!(after.revision.timestamp_ms, u64::MAX / 2 + 1);
    }

    #[test]
    fn namespaces_are_created_on_first_registration() {
        let store = store();
        let dev = ServiceKey::new("dev", "g", "orders");
        store
            .register_instance(&dev, Instance::new("10.0.0.1", 8080, "DEFAULT"))
            .unwrap();
        assert_eq!(store.namespaces(), vec!["dev".to_string(), "public".to_string()]);
        assert_eq!(store.list_services("dev").unwrap(), vec![dev]);
    }

    #[test]
    fn update_service_validates_threshold() {
        let store = store();
        store
            .register_instance(&key(), Instance::new("10.0.0.1", 8080, "DEFAULT"))
            .unwrap();
        let err = store
            .update_service(
                &key(),
                ServiceUpdate {
                    protect_threshold: Some(2.0),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StateError::Validation(_)));

        let service = store
            .update_service(
                &key(),
                ServiceUpdate {
                    protect_threshold: Some(0.5),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(service.protect_threshold, 0.5);
    }

    #[test]
    fn digest_filters_keys() {
        let store = store();
        store
            .register_instance(&key(), Instance::new("10.0.0.1", 8080, "DEFAULT"))
            .unwrap();
        store
            .register_instance(
                &ServiceKey::new("public", "g", "other"),
                Instance::new("10.0.0.1", 8080, "DEFAULT"),
            )
            .unwrap();
        let digest = store.digest(|k| k.name == "svc-a").unwrap();
        assert_eq!(digest.len(), 1);
        assert_eq!(digest[0].key, key());
        assert_eq!(digest[0].checksum.len(), 64);
    }
}
