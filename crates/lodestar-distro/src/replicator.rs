//! DistroProtocol: push-on-write, anti-entropy, handoff and startup load.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lodestar_cluster::mapper::owner_in;
use lodestar_cluster::{DistroMapper, MemberStatus, PeerSet};
use lodestar_core::config::DistroConfig;
use lodestar_core::{Debouncer, ServiceKey};
use lodestar_state::{ChangeEvent, NamingStore, NodeId, Origin, StateError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{DistroError, DistroResult};
use crate::protocol::*;
use crate::transport::{PeerEndpoint, PeerTransport};

/// Timing knobs for replication.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Coalescing window between a local write and its push to peers.
    pub sync_delay: Duration,
    /// Upper bound for any single peer call.
    pub sync_timeout: Duration,
    pub verify_interval: Duration,
    /// Random extra delay added to every verify interval.
    pub verify_jitter: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_delay: Duration::from_secs(1),
            sync_timeout: Duration::from_secs(3),
            verify_interval: Duration::from_secs(5),
            verify_jitter: Duration::from_secs(1),
        }
    }
}

impl From<&DistroConfig> for SyncSettings {
    fn from(config: &DistroConfig) -> Self {
        Self {
            sync_delay: config.sync_delay(),
            sync_timeout: config.sync_timeout(),
            verify_interval: config.verify_interval(),
            verify_jitter: config.verify_jitter(),
        }
    }
}

/// Outcome of pushing one record to the healthy peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Outcome of one anti-entropy round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub contacted: usize,
    pub failed: usize,
    /// Newer records received back from peers and applied locally.
    pub repaired: usize,
}

/// Replication engine of one registry node.
pub struct DistroProtocol {
    store: NamingStore,
    mapper: Arc<DistroMapper>,
    peers: Arc<PeerSet>,
    transport: Arc<dyn PeerTransport>,
    settings: SyncSettings,
    originating: AtomicBool,
}

impl DistroProtocol {
    pub fn new(
        store: NamingStore,
        mapper: Arc<DistroMapper>,
        peers: Arc<PeerSet>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            store,
            mapper,
            peers,
            transport,
            settings: SyncSettings::default(),
            originating: AtomicBool::new(true),
        }
    }

    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn local_id(&self) -> &str {
        self.store.node_id()
    }

    pub fn store(&self) -> &NamingStore {
        &self.store
    }

    pub fn mapper(&self) -> &Arc<DistroMapper> {
        &self.mapper
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn is_originating(&self) -> bool {
        self.originating.load(Ordering::SeqCst)
    }

    /// Stop originating pushes, verify rounds and handoffs. Incoming peer
    /// traffic is still served.
    pub fn stop(&self) {
        if self.originating.swap(false, Ordering::SeqCst) {
            info!(node = %self.local_id(), "replication stopped originating");
        }
    }

    /// Run until shutdown: install the current view, load a snapshot from a
    /// peer, then drive push-on-write, anti-entropy and handoff.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let events = self.store.subscribe();
        self.mapper.install(self.peers.healthy());
        let loaded = self.load_snapshot().await;

        info!(
            node = %self.local_id(),
            loaded,
            verify_interval_ms = self.settings.verify_interval.as_millis() as u64,
            "replication started"
        );
        tokio::join!(
            self.load_retry_loop(loaded, shutdown.clone()),
            self.push_loop(events, shutdown.clone()),
            self.verify_loop(shutdown.clone()),
            self.membership_loop(shutdown),
        );
        debug!(node = %self.local_id(), "replication loops exited");
    }

    async fn push_loop(
        &self,
        mut events: mpsc::UnboundedReceiver<ChangeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (debouncer, mut due) = Debouncer::spawn(self.settings.sync_delay);
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    if event.origin == Origin::Local
                        && self.is_originating()
                        && self.mapper.is_owner(&event.key)
                    {
                        debouncer.push(event.key);
                    }
                }
                Some(key) = due.recv() => {
                    self.sync_key(&key).await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Retry the startup load every verify interval until a peer answers.
    async fn load_retry_loop(&self, loaded: bool, mut shutdown: watch::Receiver<bool>) {
        if loaded {
            return;
        }
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.verify_interval) => {
                    if self.load_snapshot().await {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn verify_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let jitter_ms = self.settings.verify_jitter.as_millis() as u64;
            let jitter = if jitter_ms == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(rand::random::<u64>() % jitter_ms)
            };
            tokio::select! {
                _ = tokio::time::sleep(self.settings.verify_interval + jitter) => {
                    if self.is_originating() {
                        self.run_verify_cycle().await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn membership_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut healthy = self.peers.watch();
        loop {
            tokio::select! {
                changed = healthy.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = healthy.borrow_and_update().clone();
                    self.rebalance(next).await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    // ── Push-on-write ─────────────────────────────────────────────

    /// Push the current record of `key` to every healthy peer, concurrently.
    pub async fn sync_key(&self, key: &ServiceKey) -> SyncReport {
        let mut report = SyncReport::default();
        if !self.is_originating() {
            return report;
        }
        let Some(service) = self.store.find_service(key) else {
            return report;
        };
        let record = Arc::new(DistroRecord {
            origin: self.local_id().to_string(),
            service: (*service).clone(),
        });

        let mut calls = JoinSet::new();
        for peer in self.mapper.healthy_peers() {
            let transport = self.transport.clone();
            let record = record.clone();
            let timeout = self.settings.sync_timeout;
            calls.spawn(async move {
                let result = bounded(timeout, &peer, transport.send_record(&peer, &record)).await;
                (peer, result)
            });
        }

        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((peer, Ok(_))) => {
                    self.note_success(&peer);
                    report.delivered += 1;
                }
                Ok((peer, Err(e))) => {
                    warn!(peer = %peer, %key, error = %e, "push-on-write failed");
                    self.note_failure(&peer, &e);
                    report.failed += 1;
                }
                Err(e) => error!(error = %e, "push-on-write task failed"),
            }
        }
        debug!(%key, delivered = report.delivered, failed = report.failed, "record pushed");
        report
    }

    // ── Anti-entropy ──────────────────────────────────────────────

    /// Send the digest of every owned key to every configured peer and apply
    /// whatever newer records come back. Peers currently marked down only
    /// get a ping, which re-admits them once they answer.
    pub async fn run_verify_cycle(&self) -> VerifyReport {
        let mut report = VerifyReport::default();
        let entries = match self.store.digest(|k| self.mapper.is_owner(k)) {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "failed to build digest");
                return report;
            }
        };
        let request = Arc::new(DigestRequest {
            from: self.local_id().to_string(),
            entries,
        });

        let mut calls = JoinSet::new();
        for peer in self.peers.remote_members() {
            let down = self
                .peers
                .get_member(&peer)
                .is_some_and(|m| m.status == MemberStatus::Down);
            let transport = self.transport.clone();
            let request = request.clone();
            let timeout = self.settings.sync_timeout;
            calls.spawn(async move {
                let result = if down {
                    bounded(timeout, &peer, transport.ping(&peer))
                        .await
                        .map(|_| DigestReply::default())
                } else {
                    bounded(timeout, &peer, transport.send_digest(&peer, &request)).await
                };
                (peer, result)
            });
        }

        while let Some(joined) = calls.join_next().await {
            let (peer, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "verify task failed");
                    continue;
                }
            };
            report.contacted += 1;
            match result {
                Ok(reply) => {
                    self.note_success(&peer);
                    for service in reply.newer {
                        if self.apply(service, &peer) {
                            report.repaired += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "digest exchange failed");
                    self.note_failure(&peer, &e);
                    report.failed += 1;
                }
            }
        }
        debug!(
            contacted = report.contacted,
            failed = report.failed,
            repaired = report.repaired,
            "verify cycle complete"
        );
        report
    }

    /// Compare a peer's digest against local copies. Keys that are missing
    /// or older here are pulled from the sender; keys held here in a strictly
    /// newer version are returned so the sender can repair itself. So are
    /// keys the sender owns but left out of its digest, which is how an owner
    /// that restarted empty gets its records back.
    pub async fn handle_digest(&self, request: DigestRequest) -> DistroResult<DigestReply> {
        self.note_success(&request.from);
        let mut wanted = Vec::new();
        let mut reply = DigestReply::default();

        let listed: HashSet<ServiceKey> = request.entries.iter().map(|e| e.key.clone()).collect();
        for local in self
            .store
            .services(|k| !listed.contains(k) && self.mapper.owner_of(k) == request.from)
        {
            reply.newer.push((*local).clone());
        }
        if !reply.newer.is_empty() {
            info!(peer = %request.from, records = reply.newer.len(), "returning records missing from owner digest");
        }

        for entry in request.entries {
            match self.store.find_service(&entry.key) {
                None => wanted.push(entry.key),
                Some(local) if local.revision > entry.revision => {
                    reply.newer.push((*local).clone());
                }
                Some(local) if local.revision < entry.revision => wanted.push(entry.key),
                Some(local) => {
                    if local.checksum()? != entry.checksum {
                        warn!(key = %entry.key, revision = %local.revision, "checksum mismatch at equal revision");
                    }
                }
            }
        }

        if !wanted.is_empty() {
            let query = QueryRequest {
                from: self.local_id().to_string(),
                keys: wanted,
            };
            let peer = request.from;
            match bounded(self.settings.sync_timeout, &peer, self.transport.query(&peer, &query)).await {
                Ok(records) => {
                    let pulled = records
                        .records
                        .into_iter()
                        .filter(|service| self.apply(service.clone(), &peer))
                        .count();
                    debug!(peer = %peer, pulled, "pulled records after digest");
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "pull after digest failed");
                    self.note_failure(&peer, &e);
                }
            }
        }
        Ok(reply)
    }

    // ── Serving peers ─────────────────────────────────────────────

    pub async fn handle_record(&self, record: DistroRecord) -> DistroResult<RecordAck> {
        self.note_success(&record.origin);
        match self.store.apply_replica(record.service) {
            Ok(_) => Ok(RecordAck { applied: true }),
            Err(StateError::Conflict { key, local, incoming }) => {
                debug!(%key, %local, %incoming, origin = %record.origin, "stale record ignored");
                Ok(RecordAck { applied: false })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn handle_query(&self, request: QueryRequest) -> DistroResult<QueryReply> {
        let records = if request.keys.is_empty() {
            self.store.services(|_| true)
        } else {
            request
                .keys
                .iter()
                .filter_map(|key| self.store.find_service(key))
                .collect()
        };
        Ok(QueryReply {
            records: records.iter().map(|s| (**s).clone()).collect(),
        })
    }

    // ── Startup load ──────────────────────────────────────────────

    /// Pull every record from the first configured peer that answers,
    /// whether or not it is currently marked down.
    /// Returns `false` if peers exist and none answered.
    pub async fn load_snapshot(&self) -> bool {
        let mut candidates = self.peers.remote_members();
        candidates.sort();
        if candidates.is_empty() {
            return true;
        }

        let request = QueryRequest {
            from: self.local_id().to_string(),
            keys: Vec::new(),
        };
        for peer in candidates {
            match bounded(self.settings.sync_timeout, &peer, self.transport.query(&peer, &request)).await {
                Ok(reply) => {
                    self.note_success(&peer);
                    let total = reply.records.len();
                    let applied = reply
                        .records
                        .into_iter()
                        .filter(|service| self.apply(service.clone(), &peer))
                        .count();
                    info!(peer = %peer, total, applied, "initial snapshot loaded");
                    return true;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "initial snapshot load failed");
                    self.note_failure(&peer, &e);
                }
            }
        }
        warn!("no peer answered the initial load; retrying");
        false
    }

    // ── Handoff ───────────────────────────────────────────────────

    /// Move to a new healthy-node list. Keys this node owns under the
    /// current view but not under the new one are pushed to their new
    /// owner first; the view is installed afterwards. Returns the number
    /// of keys handed off.
    pub async fn rebalance(&self, mut healthy: Vec<NodeId>) -> usize {
        healthy.sort();
        healthy.dedup();
        let previous = self.mapper.view();
        if *previous == healthy {
            return 0;
        }

        let local = self.local_id().to_string();
        let moving: Vec<(Arc<lodestar_state::Service>, NodeId)> = self
            .store
            .services(|_| true)
            .into_iter()
            .filter_map(|service| {
                let before = owner_in(&previous, &service.key, &local);
                let after = owner_in(&healthy, &service.key, &local);
                (before == local && after != local).then(|| (service.clone(), after.to_string()))
            })
            .collect();

        let mut handed = 0;
        if self.is_originating() {
            for (service, owner) in &moving {
                let record = DistroRecord {
                    origin: local.clone(),
                    service: (**service).clone(),
                };
                match bounded(self.settings.sync_timeout, owner, self.transport.send_record(owner, &record)).await {
                    Ok(_) => handed += 1,
                    Err(e) => {
                        warn!(peer = %owner, key = %service.key, error = %e, "handoff push failed");
                    }
                }
            }
        }
        info!(
            from = ?*previous,
            to = ?healthy,
            moving = moving.len(),
            handed,
            "ownership handoff"
        );
        self.mapper.install(healthy);
        handed
    }

    // ── Forwarding ────────────────────────────────────────────────

    /// Send a client write to the node that owns its key.
    pub async fn forward(&self, owner: &str, write: ForwardedWrite) -> DistroResult<ForwardReply> {
        let request = ForwardRequest {
            from: self.local_id().to_string(),
            write,
            hops: MAX_FORWARD_HOPS,
        };
        let result = bounded(self.settings.sync_timeout, owner, self.transport.forward(owner, &request)).await;
        match &result {
            Ok(_) => self.note_success(owner),
            Err(e) => self.note_failure(owner, e),
        }
        result
    }

    // ── Internals ─────────────────────────────────────────────────

    fn apply(&self, service: lodestar_state::Service, peer: &str) -> bool {
        match self.store.apply_replica(service) {
            Ok(_) => true,
            Err(StateError::Conflict { key, local, incoming }) => {
                debug!(%key, %local, %incoming, peer = %peer, "stale record ignored");
                false
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to apply replica");
                false
            }
        }
    }

    fn note_success(&self, peer: &str) {
        if let Err(e) = self.peers.record_success(peer) {
            debug!(error = %e, "peer outcome not tracked");
        }
    }

    fn note_failure(&self, peer: &str, error: &DistroError) {
        if !error.is_peer_failure() {
            return;
        }
        if let Err(e) = self.peers.record_failure(peer, &error.to_string()) {
            debug!(error = %e, "peer outcome not tracked");
        }
    }
}

/// Bound a peer call by `timeout`, turning expiry into `PeerUnreachable`.
async fn bounded<T>(
    timeout: Duration,
    peer: &str,
    call: impl Future<Output = DistroResult<T>>,
) -> DistroResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(DistroError::PeerUnreachable {
            peer: peer.to_string(),
            reason: format!("timed out after {timeout:?}"),
        }),
    }
}

#[async_trait]
impl PeerEndpoint for DistroProtocol {
    fn node_id(&self) -> &str {
        self.local_id()
    }

    async fn on_record(&self, record: DistroRecord) -> DistroResult<RecordAck> {
        self.handle_record(record).await
    }

    async fn on_digest(&self, request: DigestRequest) -> DistroResult<DigestReply> {
        self.handle_digest(request).await
    }

    async fn on_query(&self, request: QueryRequest) -> DistroResult<QueryReply> {
        self.handle_query(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use lodestar_state::{Instance, Revision, Service};

    fn settings() -> SyncSettings {
        SyncSettings {
            sync_delay: Duration::from_millis(20),
            sync_timeout: Duration::from_millis(500),
            verify_interval: Duration::from_millis(100),
            verify_jitter: Duration::from_millis(10),
        }
    }

    fn node_ids(n: usize) -> Vec<NodeId> {
        (1..=n).map(|i| format!("10.0.0.{i}:8848")).collect()
    }

    fn cluster(n: usize) -> (Arc<MemoryNetwork>, Vec<Arc<DistroProtocol>>) {
        let network = MemoryNetwork::new();
        let ids = node_ids(n);
        let nodes: Vec<Arc<DistroProtocol>> = ids
            .iter()
            .map(|id| {
                let peers = Arc::new(PeerSet::new(id.clone(), ids.clone()).with_failure_threshold(2));
                let mapper = Arc::new(DistroMapper::new(id.clone(), ids.clone()));
                let node = Arc::new(
                    DistroProtocol::new(
                        NamingStore::new(id.clone()),
                        mapper,
                        peers,
                        network.transport(id.clone()),
                    )
                    .with_settings(settings()),
                );
                network.attach(&node);
                node
            })
            .collect();
        (network, nodes)
    }

    /// A fresh process for `id`: empty store, full configured view.
    fn restart(network: &Arc<MemoryNetwork>, n: usize, id: &str) -> Arc<DistroProtocol> {
        let ids = node_ids(n);
        let node = Arc::new(
            DistroProtocol::new(
                NamingStore::new(id),
                Arc::new(DistroMapper::new(id, ids.clone())),
                Arc::new(PeerSet::new(id, ids).with_failure_threshold(2)),
                network.transport(id),
            )
            .with_settings(settings()),
        );
        network.attach(&node);
        node
    }

    fn key_owned_by(node: &DistroProtocol, owner: &str) -> ServiceKey {
        (0..)
            .map(|i| ServiceKey::new("public", "DEFAULT_GROUP", format!("svc-{i}")))
            .find(|key| node.mapper().owner_of(key) == owner)
            .unwrap()
    }

    fn register(node: &DistroProtocol, key: &ServiceKey, ip: &str) {
        node.store()
            .register_instance(key, Instance::new(ip, 8080, "DEFAULT"))
            .unwrap();
    }

    #[tokio::test]
    async fn sync_key_delivers_to_every_healthy_peer() {
        let (_network, nodes) = cluster(3);
        let key = key_owned_by(&nodes[0], nodes[0].local_id());
        register(&nodes[0], &key, "10.1.0.1");

        let report = nodes[0].sync_key(&key).await;
        assert_eq!(report, SyncReport { delivered: 2, failed: 0 });
        for node in &nodes[1..] {
            let copy = node.store().get_service(&key).unwrap();
            assert_eq!(copy.instance_count(), 1);
            assert_eq!(copy.revision.node, nodes[0].local_id());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn push_on_write_runs_from_change_events() {
        let (_network, nodes) = cluster(2);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        for node in &nodes {
            let node = node.clone();
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { node.run(rx).await });
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        let key = key_owned_by(&nodes[0], nodes[0].local_id());
        for i in 1..=5 {
            register(&nodes[0], &key, &format!("10.1.0.{i}"));
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let copy = nodes[1].store().get_service(&key).unwrap();
        assert_eq!(copy.instance_count(), 5);
        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn unreachable_peer_does_not_fail_the_sync() {
        let (network, nodes) = cluster(2);
        let key = key_owned_by(&nodes[0], nodes[0].local_id());
        register(&nodes[0], &key, "10.1.0.1");
        network.set_down(nodes[1].local_id(), true);

        let report = nodes[0].sync_key(&key).await;
        assert_eq!(report, SyncReport { delivered: 0, failed: 1 });
        assert!(nodes[1].store().find_service(&key).is_none());
    }

    #[tokio::test]
    async fn verify_cycle_pulls_missing_keys() {
        let (_network, nodes) = cluster(2);
        let key = key_owned_by(&nodes[0], nodes[0].local_id());
        register(&nodes[0], &key, "10.1.0.1");

        let report = nodes[0].run_verify_cycle().await;
        assert_eq!(report.contacted, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(
            nodes[1].store().get_service(&key).unwrap().checksum().unwrap(),
            nodes[0].store().get_service(&key).unwrap().checksum().unwrap()
        );
    }

    #[tokio::test]
    async fn newer_copy_on_peer_repairs_the_owner() {
        let (_network, nodes) = cluster(2);
        let key = key_owned_by(&nodes[0], nodes[0].local_id());
        register(&nodes[0], &key, "10.1.0.1");

        let mut newer = Service::clone(&nodes[0].store().get_service(&key).unwrap());
        newer.revision = Revision::new(newer.revision.timestamp_ms + 60_000, nodes[1].local_id());
        newer.protect_threshold = 0.8;
        nodes[1].store().apply_replica(newer.clone()).unwrap();

        let first = nodes[0].run_verify_cycle().await;
        assert_eq!(first.repaired, 1);
        assert_eq!(nodes[0].store().get_service(&key).unwrap().revision, newer.revision);

        let second = nodes[0].run_verify_cycle().await;
        assert_eq!(second.repaired, 0);
    }

    #[tokio::test]
    async fn divergent_nodes_converge_within_two_cycles() {
        let (_network, nodes) = cluster(2);
        let owned_by_a = key_owned_by(&nodes[0], nodes[0].local_id());
        let owned_by_b = key_owned_by(&nodes[0], nodes[1].local_id());

        register(&nodes[0], &owned_by_a, "10.1.0.1");
        register(&nodes[1], &owned_by_a, "10.2.0.1");
        register(&nodes[1], &owned_by_b, "10.2.0.2");
        register(&nodes[0], &owned_by_b, "10.1.0.2");

        for _ in 0..2 {
            for node in &nodes {
                node.run_verify_cycle().await;
            }
        }

        for key in [&owned_by_a, &owned_by_b] {
            let a = nodes[0].store().get_service(key).unwrap();
            let b = nodes[1].store().get_service(key).unwrap();
            assert_eq!(a.checksum().unwrap(), b.checksum().unwrap());
            assert_eq!(a.revision, b.revision);
        }
    }

    #[tokio::test]
    async fn stale_record_is_not_applied() {
        let (_network, nodes) = cluster(2);
        let key = key_owned_by(&nodes[0], nodes[0].local_id());
        register(&nodes[1], &key, "10.2.0.1");
        let current = nodes[1].store().get_service(&key).unwrap();

        let mut stale = Service::clone(&current);
        stale.revision = Revision::new(1, nodes[0].local_id());
        let ack = nodes[1]
            .handle_record(DistroRecord {
                origin: nodes[0].local_id().to_string(),
                service: stale,
            })
            .await
            .unwrap();
        assert!(!ack.applied);
        assert_eq!(nodes[1].store().get_service(&key).unwrap().revision, current.revision);
    }

    #[tokio::test]
    async fn failing_peer_is_marked_down_and_recovers() {
        let (network, nodes) = cluster(2);
        let peer = nodes[1].local_id().to_string();
        network.set_down(&peer, true);

        nodes[0].run_verify_cycle().await;
        nodes[0].run_verify_cycle().await;
        assert_eq!(
            nodes[0].peers().get_member(&peer).unwrap().status,
            MemberStatus::Down
        );
        assert!(!nodes[0].peers().healthy().contains(&peer));

        network.set_down(&peer, false);
        let report = nodes[0].run_verify_cycle().await;
        assert_eq!(report.failed, 0);
        assert!(nodes[0].peers().healthy().contains(&peer));
    }

    #[tokio::test]
    async fn rebalance_hands_off_keys_before_installing() {
        let (_network, nodes) = cluster(2);
        let a = &nodes[0];
        let b_id = nodes[1].local_id().to_string();

        // Start node a alone: it owns everything.
        a.mapper().install(vec![a.local_id().to_string()]);
        let moving = key_owned_by(&nodes[1], &b_id);
        let staying = key_owned_by(&nodes[1], a.local_id());
        register(a, &moving, "10.1.0.1");
        register(a, &staying, "10.1.0.2");
        assert!(a.mapper().is_owner(&moving));

        let handed = a
            .rebalance(vec![b_id.clone(), a.local_id().to_string()])
            .await;
        assert_eq!(handed, 1);
        assert!(nodes[1].store().find_service(&moving).is_some());
        assert!(nodes[1].store().find_service(&staying).is_none());
        assert_eq!(a.mapper().owner_of(&moving), b_id);
    }

    #[tokio::test]
    async fn startup_load_pulls_everything_from_a_peer() {
        let (_network, nodes) = cluster(2);
        for i in 0..10 {
            let key = ServiceKey::new("public", "DEFAULT_GROUP", format!("load-{i}"));
            register(&nodes[0], &key, "10.1.0.1");
        }
        assert!(nodes[1].load_snapshot().await);
        assert_eq!(nodes[1].store().keys().len(), 10);
    }

    #[tokio::test]
    async fn startup_load_reports_when_nobody_answers() {
        let (network, nodes) = cluster(2);
        network.set_down(nodes[0].local_id(), true);
        assert!(!nodes[1].load_snapshot().await);
    }

    #[tokio::test]
    async fn restarted_empty_owner_gets_its_records_back() {
        let (network, nodes) = cluster(2);
        let owner_id = nodes[0].local_id().to_string();
        let replica_id = nodes[1].local_id().to_string();
        let key = key_owned_by(&nodes[0], &owner_id);
        register(&nodes[0], &key, "10.1.0.1");
        register(&nodes[0], &key, "10.1.0.2");
        nodes[0].sync_key(&key).await;
        assert_eq!(nodes[1].store().get_service(&key).unwrap().instance_count(), 2);

        let owner = restart(&network, 2, &owner_id);
        network.set_down(&replica_id, true);
        assert!(!owner.load_snapshot().await);
        network.set_down(&replica_id, false);

        let report = owner.run_verify_cycle().await;
        assert_eq!(report.repaired, 1);
        assert_eq!(owner.store().get_service(&key).unwrap().instance_count(), 2);

        // The next owned write builds on the recovered record.
        register(&owner, &key, "10.1.0.3");
        owner.sync_key(&key).await;
        assert_eq!(nodes[1].store().get_service(&key).unwrap().instance_count(), 3);
    }

    #[tokio::test]
    async fn digest_returns_only_unlisted_keys_the_sender_owns() {
        let (_network, nodes) = cluster(2);
        let owned_by_a = key_owned_by(&nodes[0], nodes[0].local_id());
        let owned_by_b = key_owned_by(&nodes[0], nodes[1].local_id());
        register(&nodes[1], &owned_by_a, "10.2.0.1");
        register(&nodes[1], &owned_by_b, "10.2.0.2");

        let reply = nodes[1]
            .handle_digest(DigestRequest {
                from: nodes[0].local_id().to_string(),
                entries: Vec::new(),
            })
            .await
            .unwrap();
        let keys: Vec<ServiceKey> = reply.newer.iter().map(|s| s.key.clone()).collect();
        assert_eq!(keys, vec![owned_by_a]);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_load_is_retried_until_a_peer_answers() {
        let (network, nodes) = cluster(2);
        let owner_id = nodes[0].local_id().to_string();
        let replica_id = nodes[1].local_id().to_string();
        for i in 0..3 {
            let key = ServiceKey::new("public", "DEFAULT_GROUP", format!("load-{i}"));
            register(&nodes[1], &key, "10.2.0.1");
        }

        let owner = restart(&network, 2, &owner_id);
        network.set_down(&replica_id, true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = owner.clone();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(owner.store().keys().is_empty());

        network.set_down(&replica_id, false);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(owner.store().keys().len(), 3);

        let _ = shutdown_tx.send(true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stop_halts_origination() {
        let (_network, nodes) = cluster(2);
        let key = key_owned_by(&nodes[0], nodes[0].local_id());
        register(&nodes[0], &key, "10.1.0.1");
        nodes[0].stop();

        assert_eq!(nodes[0].sync_key(&key).await, SyncReport::default());
        assert!(nodes[1].store().find_service(&key).is_none());

        // Still serves peers.
        let reply = nodes[0]
            .handle_query(QueryRequest {
                from: nodes[1].local_id().to_string(),
                keys: vec![key.clone()],
            })
            .await
            .unwrap();
        assert_eq!(reply.records.len(), 1);
    }
}
