//! PushService: debounced, acknowledged, retried change delivery.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use lodestar_core::config::PushConfig;
use lodestar_core::{Debouncer, ServiceKey};
use lodestar_state::NamingStore;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::PushClient;
use crate::codec::{decode_ack, encode_push};
use crate::error::{PushError, PushResult};
use crate::info::ServiceInfo;
use crate::subscriber::{Subscriber, SubscriberRegistry};
use crate::transport::{Inbound, PushTransport};

#[derive(Debug, Clone)]
pub struct PushSettings {
    /// Window in which changes to one key collapse into one push.
    pub debounce: Duration,
    pub ack_timeout: Duration,
    /// Sends per push, including the first, before the client is dropped.
    pub max_attempts: u32,
    pub max_backoff: Duration,
    pub compress_threshold: usize,
    pub idle_timeout: Duration,
    pub drain_timeout: Duration,
    pub retry_tick: Duration,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self::from(&PushConfig::default())
    }
}

impl From<&PushConfig> for PushSettings {
    fn from(config: &PushConfig) -> Self {
        Self {
            debounce: config.debounce(),
            ack_timeout: config.ack_timeout(),
            max_attempts: config.max_attempts.max(1),
            max_backoff: config.max_backoff(),
            compress_threshold: config.compress_threshold,
            idle_timeout: config.idle_timeout(),
            drain_timeout: config.drain_timeout(),
            retry_tick: config.retry_tick(),
        }
    }
}

impl PushSettings {
    /// Wait before giving up on send number `attempts` (1-based).
    fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32 << attempts.saturating_sub(1).min(16);
        self.ack_timeout.saturating_mul(factor).min(self.max_backoff)
    }
}

/// What one retry pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub resent: usize,
    /// Clients dropped after exhausting their attempts.
    pub dropped: Vec<(ServiceKey, SocketAddr)>,
    /// Clients evicted for being idle.
    pub evicted: usize,
}

type ClientKey = (ServiceKey, SocketAddr);

pub struct PushService {
    store: NamingStore,
    subscribers: Arc<SubscriberRegistry>,
    transport: Arc<dyn PushTransport>,
    settings: PushSettings,
    clients: Mutex<HashMap<ClientKey, PushClient>>,
    /// Held from choosing a frame until it is handed to the transport, so
    /// frames leave in sequence order.
    send_order: AsyncMutex<()>,
    draining: AtomicBool,
}

impl PushService {
    pub fn new(
        store: NamingStore,
        subscribers: Arc<SubscriberRegistry>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        Self {
            store,
            subscribers,
            transport,
            settings: PushSettings::default(),
            clients: Mutex::new(HashMap::new()),
            send_order: AsyncMutex::new(()),
            draining: AtomicBool::new(false),
        }
    }

    pub fn with_settings(mut self, settings: PushSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn subscribers(&self) -> &Arc<SubscriberRegistry> {
        &self.subscribers
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Frames sent and not yet acknowledged, across all clients.
    pub fn pending_acks(&self) -> usize {
        self.clients
            .lock()
            .expect("push clients lock")
            .values()
            .map(PushClient::pending_len)
            .sum()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("push clients lock").len()
    }

    // ── Subscriptions ─────────────────────────────────────────────

    /// Subscribe (or refresh) a client and push it the current state
    /// straight away.
    pub async fn subscribe(&self, key: &ServiceKey, subscriber: Subscriber) -> PushResult<bool> {
        if self.is_draining() {
            return Err(PushError::Draining);
        }
        let addr = subscriber.addr;
        if self.subscribers.subscribe(key, subscriber) {
            info!(%key, client = %addr, "client subscribed");
        } else if let Some(client) = self
            .clients
            .lock()
            .expect("push clients lock")
            .get_mut(&(key.clone(), addr))
        {
            client.touch(Instant::now());
        }
        self.push_to(key, addr).await
    }

    pub fn unsubscribe(&self, key: &ServiceKey, addr: SocketAddr) -> bool {
        self.clients
            .lock()
            .expect("push clients lock")
            .remove(&(key.clone(), addr));
        let removed = self.subscribers.unsubscribe(key, addr);
        if removed {
            info!(%key, client = %addr, "client unsubscribed");
        }
        removed
    }

    // ── Sending ───────────────────────────────────────────────────

    /// Push the current state of `key` to each of its subscribers that has
    /// not seen it yet. Returns the number of frames sent.
    pub async fn push_key(&self, key: &ServiceKey) -> usize {
        let mut sent = 0;
        for subscriber in self.subscribers.get_subscribers(key) {
            match self.push_to(key, subscriber.addr).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(PushError::Draining) => break,
                Err(e) => warn!(%key, client = %subscriber.addr, error = %e, "push failed"),
            }
        }
        sent
    }

    /// Push the current state of `key` to one client. Returns `false` when
    /// the client already has (or is being sent) this state.
    pub async fn push_to(&self, key: &ServiceKey, addr: SocketAddr) -> PushResult<bool> {
        if self.is_draining() {
            return Err(PushError::Draining);
        }
        let _order = self.send_order.lock().await;
        let info = match self.store.find_service(key) {
            Some(service) => ServiceInfo::from_service(&service)
                .map_err(|e| PushError::Codec(e.to_string()))?,
            None => ServiceInfo::empty(key),
        };
        let checksum = info.checksum.clone();
        let body = serde_json::to_vec(&info).map_err(|e| PushError::Codec(e.to_string()))?;

        let (seq, frame) = {
            let mut clients = self.clients.lock().expect("push clients lock");
            let now = Instant::now();
            let client = clients
                .entry((key.clone(), addr))
                .or_insert_with(|| PushClient::new(key.clone(), addr, now));
            if !client.needs(&checksum) {
                return Ok(false);
            }
            let frame = encode_push(
                client.next_seq(),
                &key.to_string(),
                &body,
                self.settings.compress_threshold,
            )?;
            let seq = client.start(frame.clone(), checksum, now + self.settings.backoff(1));
            (seq, frame)
        };

        debug!(%key, client = %addr, seq, hosts = info.hosts.len(), bytes = frame.len(), "push sent");
        if let Err(e) = self.transport.send(addr, frame).await {
            // The pending entry stays; the retry pass resends it.
            warn!(%key, client = %addr, seq, error = %e, "push send failed");
        }
        Ok(true)
    }

    // ── Acks and retries ──────────────────────────────────────────

    /// Settle an ack datagram from `from`. Returns `true` if it cleared a
    /// pending push.
    pub fn handle_ack(&self, from: SocketAddr, datagram: &[u8]) -> bool {
        let ack = match decode_ack(datagram) {
            Ok(ack) => ack,
            Err(e) => {
                debug!(client = %from, error = %e, "ignoring malformed datagram");
                return false;
            }
        };
        let Ok(key) = ServiceKey::from_str(&ack.key) else {
            debug!(client = %from, key = %ack.key, "ack for unparseable key");
            return false;
        };
        let mut clients = self.clients.lock().expect("push clients lock");
        let Some(client) = clients.get_mut(&(key.clone(), from)) else {
            debug!(%key, client = %from, seq = ack.seq, "ack from unknown client");
            return false;
        };
        let settled = client.ack(ack.seq, Instant::now());
        debug!(%key, client = %from, seq = ack.seq, settled, "push acknowledged");
        settled
    }

    /// Resend overdue frames, drop clients that used up their attempts and
    /// evict idle ones.
    pub async fn retry_due(&self) -> RetryReport {
        let _order = self.send_order.lock().await;
        let now = Instant::now();
        let mut report = RetryReport::default();
        let mut resend: Vec<(ClientKey, u64, Bytes)> = Vec::new();

        {
            let mut clients = self.clients.lock().expect("push clients lock");
            let mut exhausted: Vec<(ClientKey, u32)> = Vec::new();
            for (client_key, client) in clients.iter_mut() {
                for (seq, pending) in client.pending_mut() {
                    if pending.deadline > now {
                        continue;
                    }
                    if pending.attempts >= self.settings.max_attempts {
                        exhausted.push((client_key.clone(), pending.attempts));
                        break;
                    }
                    pending.attempts += 1;
                    pending.deadline = now + self.settings.backoff(pending.attempts);
                    resend.push((client_key.clone(), *seq, pending.frame.clone()));
                }
            }

            for ((key, addr), attempts) in exhausted {
                clients.remove(&(key.clone(), addr));
                self.subscribers.unsubscribe(&key, addr);
                let failure = PushError::DeliveryFailed {
                    client: addr,
                    attempts,
                };
                warn!(%key, error = %failure, "dropping subscriber");
                report.dropped.push((key, addr));
            }

            if !self.is_draining() {
                let before = clients.len();
                clients.retain(|(key, addr), client| {
                    let idle = client.is_idle(now, self.settings.idle_timeout);
                    if idle {
                        self.subscribers.unsubscribe(key, *addr);
                        debug!(%key, client = %addr, "idle client evicted");
                    }
                    !idle
                });
                report.evicted = before - clients.len();
            }
        }

        for (client_key, seq, frame) in resend {
            // An ack may have settled the frame since it was picked.
            let still_pending = self
                .clients
                .lock()
                .expect("push clients lock")
                .get(&client_key)
                .is_some_and(|client| client.is_pending(seq));
            if !still_pending {
                continue;
            }
            let (key, addr) = client_key;
            report.resent += 1;
            debug!(%key, client = %addr, seq, "push resent");
            if let Err(e) = self.transport.send(addr, frame).await {
                warn!(%key, client = %addr, seq, error = %e, "push resend failed");
            }
        }
        report
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Stop starting new pushes. Acks and retries of frames already in
    /// flight are still processed.
    pub fn begin_drain(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            info!(pending = self.pending_acks(), "push service draining");
        }
    }

    /// Follow change events, acks and the retry tick until shutdown, then
    /// drain: wait for in-flight acks (bounded by `drain_timeout`).
    pub async fn run(&self, mut inbound: Inbound, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.store.subscribe();
        let (debouncer, mut due) = Debouncer::spawn(self.settings.debounce);
        let mut tick = tokio::time::interval(self.settings.retry_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            debounce_ms = self.settings.debounce.as_millis() as u64,
            "push service started"
        );
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    if self.subscribers.has_subscribers(&event.key) {
                        debouncer.push(event.key);
                    }
                }
                Some(key) = due.recv() => {
                    self.push_key(&key).await;
                }
                Some((from, datagram)) = inbound.recv() => {
                    self.handle_ack(from, &datagram);
                }
                _ = tick.tick() => {
                    self.retry_due().await;
                }
                _ = shutdown.changed() => break,
            }
        }

        self.drain(&mut inbound, &mut tick).await;
    }

    async fn drain(&self, inbound: &mut Inbound, tick: &mut tokio::time::Interval) {
        self.begin_drain();
        let deadline = tokio::time::sleep(self.settings.drain_timeout);
        tokio::pin!(deadline);

        while self.pending_acks() > 0 {
            tokio::select! {
                Some((from, datagram)) = inbound.recv() => {
                    self.handle_ack(from, &datagram);
                }
                _ = tick.tick() => {
                    self.retry_due().await;
                }
                _ = &mut deadline => {
                    warn!(pending = self.pending_acks(), "drain timed out with unacknowledged pushes");
                    return;
                }
            }
        }
        info!("push service drained");
    }
}
