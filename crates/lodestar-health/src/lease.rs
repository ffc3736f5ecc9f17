//! Lease expiry for ephemeral instances.
//!
//! Every ephemeral instance has one armed deadline in a min-heap. When a
//! deadline passes, the reaper re-reads the instance: a fresh heartbeat
//! just re-arms it, a lease older than `unhealthy_after` marks it
//! unhealthy, and one older than `expire_after` removes it. Only the
//! owner of a service acts on its leases.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lodestar_cluster::DistroMapper;
use lodestar_core::ServiceKey;
use lodestar_core::clock::epoch_millis;
use lodestar_core::config::LeaseConfig;
use lodestar_state::{InstanceId, NamingStore};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Upper bound on how long the reaper sleeps without re-checking the heap.
const MAX_IDLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub unhealthy_after: Duration,
    pub expire_after: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self::from(&LeaseConfig::default())
    }
}

impl From<&LeaseConfig> for LeaseSettings {
    fn from(config: &LeaseConfig) -> Self {
        Self {
            unhealthy_after: config.unhealthy_after(),
            expire_after: config.expire_after(),
        }
    }
}

/// What one pass over the due deadlines did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub marked_unhealthy: Vec<(ServiceKey, InstanceId)>,
    pub expired: Vec<(ServiceKey, InstanceId)>,
}

type LeaseKey = (ServiceKey, InstanceId);

#[derive(Default)]
struct Schedule {
    heap: BinaryHeap<Reverse<(u64, LeaseKey)>>,
    /// Latest deadline per lease; heap entries that disagree are stale.
    armed: HashMap<LeaseKey, u64>,
}

impl Schedule {
    fn arm(&mut self, lease: LeaseKey, deadline: u64) {
        if self.armed.get(&lease) == Some(&deadline) {
            return;
        }
        self.armed.insert(lease.clone(), deadline);
        self.heap.push(Reverse((deadline, lease)));
    }

    /// Pop the next live entry due at or before `now`.
    fn pop_due(&mut self, now: u64) -> Option<LeaseKey> {
        while let Some(Reverse((deadline, _))) = self.heap.peek() {
            if *deadline > now {
                return None;
            }
            let Some(Reverse((deadline, lease))) = self.heap.pop() else {
                return None;
            };
            if self.armed.get(&lease) == Some(&deadline) {
                self.armed.remove(&lease);
                return Some(lease);
            }
        }
        None
    }

    fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }
}

pub struct LeaseReaper {
    store: NamingStore,
    mapper: Arc<DistroMapper>,
    settings: LeaseSettings,
    schedule: Mutex<Schedule>,
}

impl LeaseReaper {
    pub fn new(store: NamingStore, mapper: Arc<DistroMapper>) -> Self {
        Self {
            store,
            mapper,
            settings: LeaseSettings::default(),
            schedule: Mutex::new(Schedule::default()),
        }
    }

    pub fn with_settings(mut self, settings: LeaseSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Arm leases for every ephemeral instance of `key`.
    pub fn track(&self, key: &ServiceKey) {
        let Some(service) = self.store.find_service(key) else {
            return;
        };
        let mut schedule = self.schedule.lock().expect("lease schedule lock");
        for instance in service.clusters.values().flat_map(|c| c.ephemeral.values()) {
            let deadline = self.deadline_for(instance.last_beat, instance.healthy);
            schedule.arm((key.clone(), instance.id()), deadline);
        }
    }

    /// Number of armed leases.
    pub fn armed(&self) -> usize {
        self.schedule.lock().expect("lease schedule lock").armed.len()
    }

    fn deadline_for(&self, last_beat: u64, healthy: bool) -> u64 {
        let after = if healthy {
            self.settings.unhealthy_after
        } else {
            self.settings.expire_after
        };
        last_beat.saturating_add(after.as_millis() as u64)
    }

    /// Act on every lease due at `now` (ms since epoch).
    pub fn reap(&self, now: u64) -> ReapReport {
        let mut report = ReapReport::default();
        let mut expiring: BTreeMap<ServiceKey, Vec<InstanceId>> = BTreeMap::new();
        let unhealthy_ms = self.settings.unhealthy_after.as_millis() as u64;
        let expire_ms = self.settings.expire_after.as_millis() as u64;

        loop {
            let due = self.schedule.lock().expect("lease schedule lock").pop_due(now);
            let Some((key, id)) = due else { break };

            let Some(instance) = self
                .store
                .find_service(&key)
                .and_then(|s| s.find_instance(&id).map(|(_, i)| i.clone()))
                .filter(|i| i.ephemeral)
            else {
                continue;
            };

            if !self.mapper.is_owner(&key) {
                self.rearm(key, id, now.saturating_add(unhealthy_ms));
                continue;
            }

            let age = now.saturating_sub(instance.last_beat);
            if age >= expire_ms {
                expiring.entry(key).or_default().push(id);
            } else if age >= unhealthy_ms && instance.healthy {
                match self.store.set_instance_health(&key, &id, false) {
                    Ok(_) => {
                        warn!(%key, instance = %id, age_ms = age, "lease lapsed; instance unhealthy");
                        report.marked_unhealthy.push((key.clone(), id.clone()));
                    }
                    Err(e) => debug!(%key, instance = %id, error = %e, "lease health write failed"),
                }
                self.rearm(key, id, instance.last_beat.saturating_add(expire_ms));
            } else {
                let deadline = self.deadline_for(instance.last_beat, instance.healthy);
                self.rearm(key, id, deadline);
            }
        }

        for (key, ids) in expiring {
            match self.store.expire_instances(&key, &ids) {
                Ok(removed) => {
                    if !removed.is_empty() {
                        info!(%key, count = removed.len(), "expired ephemeral instances");
                    }
                    report
                        .expired
                        .extend(removed.into_iter().map(|id| (key.clone(), id)));
                }
                Err(e) => warn!(%key, error = %e, "failed to expire instances"),
            }
        }
        report
    }

    fn rearm(&self, key: ServiceKey, id: InstanceId, deadline: u64) {
        self.schedule
            .lock()
            .expect("lease schedule lock")
            .arm((key, id), deadline);
    }

    /// Follow change events and reap due leases until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.store.subscribe();
        for key in self.store.keys() {
            self.track(&key);
        }
        info!(
            unhealthy_after_ms = self.settings.unhealthy_after.as_millis() as u64,
            expire_after_ms = self.settings.expire_after.as_millis() as u64,
            "lease reaper started"
        );

        loop {
            let now = epoch_millis();
            let wait = self
                .schedule
                .lock()
                .expect("lease schedule lock")
                .next_deadline()
                .map(|deadline| Duration::from_millis(deadline.saturating_sub(now)))
                .unwrap_or(MAX_IDLE)
                .min(MAX_IDLE);

            tokio::select! {
                Some(event) = events.recv() => self.track(&event.key),
                _ = tokio::time::sleep(wait) => {
                    self.reap(epoch_millis());
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("lease reaper stopped");
    }
}
