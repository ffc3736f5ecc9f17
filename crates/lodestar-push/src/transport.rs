//! Datagram delivery for push frames.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::codec::{PushFrame, decode_push, encode_ack};
use crate::error::PushResult;

/// Datagrams received from clients (acks), with their source address.
pub type Inbound = mpsc::UnboundedReceiver<(SocketAddr, Bytes)>;

/// Largest datagram the receiver accepts.
const MAX_DATAGRAM: usize = 64 * 1024;

#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Fire one frame at `to`. Delivery is not confirmed here; the ack is.
    async fn send(&self, to: SocketAddr, frame: Bytes) -> PushResult<()>;
}

// ── UDP ───────────────────────────────────────────────────────────

pub struct UdpPushTransport {
    socket: Arc<UdpSocket>,
}

impl UdpPushTransport {
    pub async fn bind(addr: &str) -> PushResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> PushResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawn the receive loop; datagrams arrive on the returned channel
    /// until shutdown.
    pub fn listen(&self, mut shutdown: watch::Receiver<bool>) -> Inbound {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, from)) => {
                            if tx.send((from, Bytes::copy_from_slice(&buf[..len]))).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "push socket receive failed"),
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("push receive loop stopped");
        });
        rx
    }
}

#[async_trait]
impl PushTransport for UdpPushTransport {
    async fn send(&self, to: SocketAddr, frame: Bytes) -> PushResult<()> {
        self.socket.send_to(&frame, to).await?;
        Ok(())
    }
}

// ── Recording ─────────────────────────────────────────────────────

/// Captures every frame instead of sending it. With auto-ack on, each
/// delivered push is answered on the inbound channel as a client would.
pub struct RecordingTransport {
    sent: Mutex<Vec<(SocketAddr, Bytes)>>,
    auto_ack: AtomicBool,
    /// Frames still to be swallowed, modelling datagram loss.
    lose: AtomicUsize,
    acks: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
}

impl RecordingTransport {
    pub fn new(auto_ack: bool) -> (Arc<Self>, Inbound) {
        let (acks, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            auto_ack: AtomicBool::new(auto_ack),
            lose: AtomicUsize::new(0),
            acks,
        });
        (transport, rx)
    }

    pub fn set_auto_ack(&self, on: bool) {
        self.auto_ack.store(on, Ordering::SeqCst);
    }

    /// Drop the next `n` frames on the floor (they are still recorded).
    pub fn lose_next(&self, n: usize) {
        self.lose.store(n, Ordering::SeqCst);
    }

    /// Decoded pushes sent to `addr`, in send order.
    pub fn pushes_to(&self, addr: SocketAddr) -> Vec<PushFrame> {
        self.sent
            .lock()
            .expect("recorded frames lock")
            .iter()
            .filter(|(to, _)| *to == addr)
            .filter_map(|(_, frame)| decode_push(frame).ok())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("recorded frames lock").len()
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn send(&self, to: SocketAddr, frame: Bytes) -> PushResult<()> {
        self.sent
            .lock()
            .expect("recorded frames lock")
            .push((to, frame.clone()));

        let lost = self
            .lose
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost || !self.auto_ack.load(Ordering::SeqCst) {
            return Ok(());
        }
        let push = decode_push(&frame)?;
        let _ = self.acks.send((to, encode_ack(push.seq, &push.key)?));
        Ok(())
    }
}
