//! Node assembly: build every subsystem from the configuration, run them
//! until Ctrl-C, then shut down in order.
//!
//! The daemon listens for peers only. Clients register and subscribe through
//! an embedding layer that holds the `Registry`; this binary has no client
//! API of its own.
//!
//! Shutdown first stops replication from originating anything, then lets
//! the push service drain in-flight acknowledgements before the UDP socket
//! is closed.

use std::sync::Arc;

use lodestar_cluster::{DistroMapper, PeerSet};
use lodestar_core::LodestarConfig;
use lodestar_distro::{DistroProtocol, HttpTransport, SyncSettings};
use lodestar_health::{HealthMonitor, HealthSettings, LeaseReaper, LeaseSettings};
use lodestar_naming::Registry;
use lodestar_push::{PushService, PushSettings, SubscriberRegistry, UdpPushTransport};
use lodestar_state::NamingStore;
use tokio::sync::watch;
use tracing::{info, warn};

pub async fn run_node(config: LodestarConfig) -> anyhow::Result<()> {
    let node_id = config.node.node_id();
    info!(node = %node_id, "Lodestar node starting");

    // ── Membership and ownership ─────────────────────────────────

    let members = config.cluster.peers.clone();
    if !members.is_empty() && !members.contains(&node_id) {
        warn!(node = %node_id, "node id is missing from the peer list; peers will not route to it");
    }
    let peers = Arc::new(
        PeerSet::new(node_id.clone(), members)
            .with_failure_threshold(config.cluster.failure_threshold)
            .with_recovery_threshold(config.cluster.recovery_threshold),
    );
    let mapper = Arc::new(DistroMapper::new(node_id.clone(), peers.healthy()));
    info!(members = peers.list_members().len(), "peer set initialized");

    // ── Store and replication ────────────────────────────────────

    let store = NamingStore::new(node_id.clone());
    let sync = SyncSettings::from(&config.distro);
    let transport = Arc::new(HttpTransport::new(sync.sync_timeout)?);
    let distro = Arc::new(
        DistroProtocol::new(store.clone(), mapper.clone(), peers.clone(), transport).with_settings(sync),
    );

    // ── Health ───────────────────────────────────────────────────

    let monitor = Arc::new(
        HealthMonitor::new(store.clone(), mapper.clone()).with_settings(HealthSettings::from(&config.health)),
    );
    let reaper = Arc::new(
        LeaseReaper::new(store.clone(), mapper.clone()).with_settings(LeaseSettings::from(&config.lease)),
    );

    // ── Push ─────────────────────────────────────────────────────

    let udp = UdpPushTransport::bind(&config.node.push_bind).await?;
    info!(addr = %udp.local_addr()?, "push socket bound");
    // The receive loop outlives the main shutdown signal so the drain
    // still sees acknowledgements.
    let (socket_tx, socket_rx) = watch::channel(false);
    let inbound = udp.listen(socket_rx);
    let push = Arc::new(
        PushService::new(store.clone(), Arc::new(SubscriberRegistry::new()), Arc::new(udp))
            .with_settings(PushSettings::from(&config.push)),
    );

    let registry = Arc::new(Registry::new(distro.clone(), push.clone()));

    // ── Shutdown signal ──────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_distro = distro.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
        }
        info!("shutdown signal received");
        signal_distro.stop();
        let _ = shutdown_tx.send(true);
    });

    // ── Background tasks ─────────────────────────────────────────

    let distro_handle = {
        let distro = distro.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { distro.run(shutdown).await })
    };
    let monitor_handle = {
        let monitor = monitor.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { monitor.run(shutdown).await })
    };
    let reaper_handle = {
        let reaper = reaper.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { reaper.run(shutdown).await })
    };
    let push_handle = {
        let push = push.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { push.run(inbound, shutdown).await })
    };

    // ── Peer API ─────────────────────────────────────────────────

    // Replication protocol only.

    let router = lodestar_api::build_router(registry);
    let listener = tokio::net::TcpListener::bind(&config.node.bind).await?;
    info!(addr = %listener.local_addr()?, "peer API listening");
    lodestar_api::serve(listener, router, shutdown_rx).await?;

    // ── Drain ────────────────────────────────────────────────────

    let _ = distro_handle.await;
    let _ = monitor_handle.await;
    let _ = reaper_handle.await;
    let _ = push_handle.await;
    let _ = socket_tx.send(true);

    info!(node = %node_id, "Lodestar node stopped");
    Ok(())
}
