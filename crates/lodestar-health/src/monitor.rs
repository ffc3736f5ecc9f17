//! Health monitor: one probe task per persistent instance.
//!
//! The monitor follows the store's change events and keeps its task set in
//! line with the registered persistent instances. Tasks probe only while
//! this node owns the service; the owner is the only writer of health.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use lodestar_cluster::DistroMapper;
use lodestar_core::ServiceKey;
use lodestar_core::clock::epoch_millis;
use lodestar_core::config::HealthConfig;
use lodestar_state::{Cluster, HealthCheckerConfig, Instance, InstanceId, NamingStore, StateError};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::probe::{Prober, prober_for};
use crate::tracker::HealthTracker;

/// Builds the prober for a cluster's checker configuration.
pub type ProberFactory = Arc<dyn Fn(&HealthCheckerConfig) -> Arc<dyn Prober> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub interval: Duration,
    /// Random extra delay before each probe.
    pub jitter: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

impl From<&HealthConfig> for HealthSettings {
    fn from(config: &HealthConfig) -> Self {
        Self {
            interval: config.interval(),
            jitter: config.jitter(),
            timeout: config.timeout(),
            unhealthy_threshold: config.unhealthy_threshold,
            healthy_threshold: config.healthy_threshold,
        }
    }
}

/// Latest probe round-trip for one cluster of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterRt {
    pub cluster: String,
    pub checker: String,
    /// `None` when the latest probe failed.
    pub last_rt_ms: Option<u64>,
    pub checked_at_ms: u64,
}

type RtTable = RwLock<HashMap<(ServiceKey, String), ClusterRt>>;

struct ProbeTask {
    addr: String,
    checker: HealthCheckerConfig,
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProbeTask {
    fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

pub struct HealthMonitor {
    store: NamingStore,
    mapper: Arc<DistroMapper>,
    settings: HealthSettings,
    factory: ProberFactory,
    tasks: Mutex<HashMap<(ServiceKey, InstanceId), ProbeTask>>,
    rt: Arc<RtTable>,
}

impl HealthMonitor {
    pub fn new(store: NamingStore, mapper: Arc<DistroMapper>) -> Self {
        Self {
            store,
            mapper,
            settings: HealthSettings::default(),
            factory: Arc::new(prober_for),
            tasks: Mutex::new(HashMap::new()),
            rt: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_settings(mut self, settings: HealthSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace how probers are built (tests script probe outcomes this way).
    pub fn with_prober_factory(mut self, factory: ProberFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Follow change events until shutdown, then stop every probe task.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.store.subscribe();
        for key in self.store.keys() {
            self.reconcile(&key);
        }
        info!(probes = self.active_probes().len(), "health monitor started");

        loop {
            tokio::select! {
                Some(event) = events.recv() => self.reconcile(&event.key),
                _ = shutdown.changed() => break,
            }
        }
        self.stop_all();
    }

    /// Bring the probe tasks of `key` in line with its current persistent
    /// instances. Tasks whose target address or checker changed restart, and
    /// so do tasks that already exited on their own.
    pub fn reconcile(&self, key: &ServiceKey) {
        let desired: HashMap<InstanceId, (String, HealthCheckerConfig)> = self
            .store
            .find_service(key)
            .map(|service| {
                service
                    .clusters
                    .values()
                    .filter(|c| c.health_checker != HealthCheckerConfig::None)
                    .flat_map(|c| {
                        c.persistent
                            .values()
                            .map(move |i| (i.id(), (check_addr(c, i), c.health_checker.clone())))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut tasks = self.tasks.lock().expect("probe tasks lock");
        tasks.retain(|(task_key, id), task| {
            if task_key != key {
                return true;
            }
            let keep = !task.handle.is_finished()
                && desired
                    .get(id)
                    .is_some_and(|(addr, checker)| *addr == task.addr && *checker == task.checker);
            if !keep {
                task.stop();
                debug!(%key, instance = %id, "probe task stopped");
            }
            keep
        });

        for (id, (addr, checker)) in desired {
            let task_key = (key.clone(), id);
            if tasks.contains_key(&task_key) {
                continue;
            }
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let probe = ProbeLoop {
                store: self.store.clone(),
                mapper: self.mapper.clone(),
                settings: self.settings.clone(),
                prober: (self.factory)(&checker),
                rt: self.rt.clone(),
                key: key.clone(),
                id: task_key.1.clone(),
                addr: addr.clone(),
            };
            let handle = tokio::spawn(probe.run(shutdown_rx));
            debug!(%key, instance = %task_key.1, %addr, checker = checker.kind(), "probe task started");
            tasks.insert(
                task_key,
                ProbeTask {
                    addr,
                    checker,
                    handle,
                    shutdown_tx,
                },
            );
        }
    }

    pub fn stop_all(&self) {
        let mut tasks = self.tasks.lock().expect("probe tasks lock");
        for (_, task) in tasks.drain() {
            task.stop();
        }
        info!("all probe tasks stopped");
    }

    /// Instances with a running probe task, sorted.
    pub fn active_probes(&self) -> Vec<(ServiceKey, InstanceId)> {
        let mut active: Vec<_> = self
            .tasks
            .lock()
            .expect("probe tasks lock")
            .iter()
            .filter(|(_, task)| !task.handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect();
        active.sort();
        active
    }

    /// Latest probe round-trip per cluster of `key`, cluster name order.
    pub fn cluster_rt(&self, key: &ServiceKey) -> Vec<ClusterRt> {
        let mut rows: Vec<ClusterRt> = self
            .rt
            .read()
            .expect("rt table lock")
            .iter()
            .filter(|((k, _), _)| k == key)
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by(|a, b| a.cluster.cmp(&b.cluster));
        rows
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, task) in tasks.drain() {
                task.stop();
            }
        }
    }
}

fn check_addr(cluster: &Cluster, instance: &Instance) -> String {
    let port = cluster.check_port(instance);
    if instance.ip.contains(':') {
        format!("[{}]:{port}", instance.ip)
    } else {
        format!("{}:{port}", instance.ip)
    }
}

fn jitter(max: Duration) -> Duration {
    let ms = max.as_millis() as u64;
    if ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::random::<u64>() % ms)
    }
}

/// State of one instance's probe task.
struct ProbeLoop {
    store: NamingStore,
    mapper: Arc<DistroMapper>,
    settings: HealthSettings,
    prober: Arc<dyn Prober>,
    rt: Arc<RtTable>,
    key: ServiceKey,
    id: InstanceId,
    addr: String,
}

impl ProbeLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tracker: Option<HealthTracker> = None;
        loop {
            let delay = self.settings.interval + jitter(self.settings.jitter);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }

            if !self.mapper.is_owner(&self.key) {
                // Start over from the store if ownership comes back.
                tracker = None;
                continue;
            }
            let Some((cluster, healthy)) = self.current() else {
                debug!(key = %self.key, instance = %self.id, "instance gone; probe loop exiting");
                break;
            };
            let state = tracker.get_or_insert_with(|| {
                HealthTracker::new(
                    healthy,
                    self.settings.unhealthy_threshold,
                    self.settings.healthy_threshold,
                )
            });
            state.reseed(healthy);

            let outcome = self.prober.probe(&self.addr, self.settings.timeout).await;
            self.record_rt(cluster, outcome.as_ref().ok().copied());
            if let Err(e) = &outcome {
                debug!(key = %self.key, instance = %self.id, addr = %self.addr, error = %e, "probe failed");
            }

            if let Some(healthy) = state.record(outcome.is_ok()) {
                match self.store.set_instance_health(&self.key, &self.id, healthy) {
                    Ok(_) => {
                        if healthy {
                            info!(key = %self.key, instance = %self.id, "instance healthy");
                        } else {
                            warn!(key = %self.key, instance = %self.id, "instance unhealthy");
                        }
                    }
                    Err(StateError::NotFound(_)) => break,
                    Err(e) => warn!(key = %self.key, instance = %self.id, error = %e, "failed to write health"),
                }
            }
        }
    }

    fn current(&self) -> Option<(String, bool)> {
        let service = self.store.find_service(&self.key)?;
        let (cluster, instance) = service.find_instance(&self.id)?;
        Some((cluster.name.clone(), instance.healthy))
    }

    fn record_rt(&self, cluster: String, rt: Option<Duration>) {
        let row = ClusterRt {
            cluster: cluster.clone(),
            checker: self.prober.kind().to_string(),
            last_rt_ms: rt.map(|d| d.as_millis() as u64),
            checked_at_ms: epoch_millis(),
        };
        self.rt
            .write()
            .expect("rt table lock")
            .insert((self.key.clone(), cluster), row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProbeError, ProbeResult};
    use async_trait::async_trait;
    use lodestar_state::{ChangeKind, ClusterUpdate};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const NODE: &str = "10.0.0.1:8848";

    #[derive(Default)]
    struct Script {
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    struct ScriptedProber(Arc<Script>);

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, _addr: &str, timeout: Duration) -> ProbeResult<Duration> {
            self.0.calls.fetch_add(1, Ordering::SeqCst);
            if self.0.failing.load(Ordering::SeqCst) {
                Err(ProbeError::Timeout(timeout))
            } else {
                Ok(Duration::from_millis(3))
            }
        }

        fn kind(&self) -> &'static str {
            "SCRIPTED"
        }
    }

    fn settings() -> HealthSettings {
        HealthSettings {
            interval: Duration::from_secs(1),
            jitter: Duration::ZERO,
            timeout: Duration::from_millis(200),
            unhealthy_threshold: 3,
            healthy_threshold: 1,
        }
    }

    fn monitor(store: &NamingStore, owners: Vec<String>, script: &Arc<Script>) -> Arc<HealthMonitor> {
        let script = script.clone();
        Arc::new(
            HealthMonitor::new(store.clone(), Arc::new(DistroMapper::new(NODE, owners)))
                .with_settings(settings())
                .with_prober_factory(Arc::new(move |_: &HealthCheckerConfig| {
                    Arc::new(ScriptedProber(script.clone())) as Arc<dyn Prober>
                })),
        )
    }

    fn key() -> ServiceKey {
        ServiceKey::new("public", "DEFAULT_GROUP", "db")
    }

    #[tokio::test]
    async fn only_persistent_instances_get_probe_tasks() {
        let store = NamingStore::new(NODE);
        let script = Arc::new(Script::default());
        let monitor = monitor(&store, vec![NODE.to_string()], &script);

        store
            .register_instance(&key(), Instance::new("10.1.0.1", 3306, "DEFAULT").persistent())
            .unwrap();
        store
            .register_instance(&key(), Instance::new("10.1.0.2", 3306, "DEFAULT"))
            .unwrap();
        monitor.reconcile(&key());

        assert_eq!(
            monitor.active_probes(),
            vec![(key(), "10.1.0.1#3306#DEFAULT".to_string())]
        );
    }

    #[tokio::test]
    async fn deregister_and_none_checker_stop_tasks() {
        let store = NamingStore::new(NODE);
        let script = Arc::new(Script::default());
        let monitor = monitor(&store, vec![NODE.to_string()], &script);

        for ip in ["10.1.0.1", "10.1.0.2"] {
            store
                .register_instance(&key(), Instance::new(ip, 3306, "DEFAULT").persistent())
                .unwrap();
        }
        monitor.reconcile(&key());
        assert_eq!(monitor.active_probes().len(), 2);

        store.deregister_instance(&key(), "10.1.0.1#3306#DEFAULT").unwrap();
        monitor.reconcile(&key());
        assert_eq!(monitor.active_probes().len(), 1);

        store
            .update_cluster(
                &key(),
                "DEFAULT",
                ClusterUpdate {
                    health_checker: Some(HealthCheckerConfig::None),
                    ..ClusterUpdate::default()
                },
            )
            .unwrap();
        monitor.reconcile(&key());
        assert!(monitor.active_probes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_probes_flip_health_exactly_once() {
        let store = NamingStore::new(NODE);
        let script = Arc::new(Script::default());
        script.failing.store(true, Ordering::SeqCst);
        let monitor = monitor(&store, vec![NODE.to_string()], &script);
        let mut events = store.subscribe();

        let id = "10.1.0.1#3306#DEFAULT".to_string();
        store
            .register_instance(&key(), Instance::new("10.1.0.1", 3306, "DEFAULT").persistent())
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = monitor.clone();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        // Three failed probes cross the threshold; five more change nothing.
        tokio::time::sleep(Duration::from_millis(8_500)).await;
        assert!(script.calls.load(Ordering::SeqCst) >= 8);
        let service = store.get_service(&key()).unwrap();
        assert!(!service.find_instance(&id).unwrap().1.healthy);

        script.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        let _ = shutdown_tx.send(true);
        handle.await.unwrap();

        let mut transitions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ChangeKind::HealthChanged { healthy, .. } = event.kind {
                transitions.push(healthy);
            }
        }
        assert_eq!(transitions, vec![false, true]);
        assert!(monitor.active_probes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exited_task_is_replaced_on_next_reconcile() {
        let store = NamingStore::new(NODE);
        let script = Arc::new(Script::default());
        let monitor = monitor(&store, vec![NODE.to_string()], &script);
        let instance = || Instance::new("10.1.0.1", 3306, "DEFAULT").persistent();

        store.register_instance(&key(), instance()).unwrap();
        monitor.reconcile(&key());
        // Removed behind the monitor's back: the task notices on its next tick.
        store.deregister_instance(&key(), "10.1.0.1#3306#DEFAULT").unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(monitor.active_probes().is_empty());
        assert_eq!(script.calls.load(Ordering::SeqCst), 0);

        store.register_instance(&key(), instance()).unwrap();
        monitor.reconcile(&key());
        assert_eq!(monitor.active_probes().len(), 1);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(script.calls.load(Ordering::SeqCst) >= 2);
        monitor.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn non_owner_does_not_probe() {
        let store = NamingStore::new(NODE);
        let script = Arc::new(Script::default());
        let other = "10.0.0.2:8848".to_string();
        // A view that only contains the other node: it owns every key.
        let monitor = monitor(&store, vec![other], &script);

        store
            .register_instance(&key(), Instance::new("10.1.0.1", 3306, "DEFAULT").persistent())
            .unwrap();
        monitor.reconcile(&key());
        assert_eq!(monitor.active_probes().len(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(script.calls.load(Ordering::SeqCst), 0);
        monitor.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn probe_rt_is_recorded_per_cluster() {
        let store = NamingStore::new(NODE);
        let script = Arc::new(Script::default());
        let monitor = monitor(&store, vec![NODE.to_string()], &script);

        store
            .register_instance(&key(), Instance::new("10.1.0.1", 3306, "DEFAULT").persistent())
            .unwrap();
        monitor.reconcile(&key());
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let rows = monitor.cluster_rt(&key());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cluster, "DEFAULT");
        assert_eq!(rows[0].checker, "SCRIPTED");
        assert_eq!(rows[0].last_rt_ms, Some(3));
        monitor.stop_all();
    }

    #[test]
    fn check_addr_honours_check_port() {
        let mut cluster = Cluster::new("DEFAULT");
        let instance = Instance::new("10.1.0.1", 8080, "DEFAULT");
        assert_eq!(check_addr(&cluster, &instance), "10.1.0.1:8080");

        cluster.use_ip_port_for_check = false;
        cluster.default_check_port = 9090;
        assert_eq!(check_addr(&cluster, &instance), "10.1.0.1:9090");

        let v6 = Instance::new("::1", 8080, "DEFAULT");
        cluster.use_ip_port_for_check = true;
        assert_eq!(check_addr(&cluster, &v6), "[::1]:8080");
    }
}
