//! Delivery state for one (service, client address) pair.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;
use lodestar_core::ServiceKey;
use tokio::time::Instant;

/// A frame waiting for its ack.
#[derive(Debug, Clone)]
pub struct Pending {
    /// Sends so far, including the first.
    pub attempts: u32,
    pub deadline: Instant,
    pub frame: Bytes,
    pub checksum: String,
}

#[derive(Debug)]
pub struct PushClient {
    pub key: ServiceKey,
    pub addr: SocketAddr,
    next_seq: u64,
    /// Checksum of the last acknowledged push.
    acked_checksum: Option<String>,
    pending: BTreeMap<u64, Pending>,
    last_active: Instant,
}

impl PushClient {
    pub fn new(key: ServiceKey, addr: SocketAddr, now: Instant) -> Self {
        Self {
            key,
            addr,
            next_seq: 1,
            acked_checksum: None,
            pending: BTreeMap::new(),
            last_active: now,
        }
    }

    /// Whether a push of `checksum` would tell the client anything new:
    /// it is neither acknowledged nor already in flight.
    pub fn needs(&self, checksum: &str) -> bool {
        match self.pending.values().next_back() {
            Some(inflight) => inflight.checksum != checksum,
            None => self.acked_checksum.as_deref() != Some(checksum),
        }
    }

    /// Allocate the next sequence number and track `frame` as the only
    /// pending push; older pending pushes are superseded.
    pub fn start(&mut self, frame: Bytes, checksum: String, deadline: Instant) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.clear();
        self.pending.insert(
            seq,
            Pending {
                attempts: 1,
                deadline,
                frame,
                checksum,
            },
        );
        seq
    }

    /// Peek the sequence number the next push will carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Settle an ack. Returns `false` for unknown or superseded sequences.
    pub fn ack(&mut self, seq: u64, now: Instant) -> bool {
        self.last_active = now;
        match self.pending.remove(&seq) {
            Some(pending) => {
                self.acked_checksum = Some(pending.checksum);
                true
            }
            None => false,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_active = now;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, seq: u64) -> bool {
        self.pending.contains_key(&seq)
    }

    pub fn pending_mut(&mut self) -> impl Iterator<Item = (&u64, &mut Pending)> {
        self.pending.iter_mut()
    }

    pub fn is_idle(&self, now: Instant, idle_timeout: std::time::Duration) -> bool {
        self.pending.is_empty() && now.saturating_duration_since(self.last_active) >= idle_timeout
    }
}
