//! lodestar-api: HTTP surface of the node-to-node protocol.
//!
//! Every route decodes a protocol message, hands it to the node's
//! [`PeerEndpoint`] and returns the reply as JSON. Bodies are the bare
//! protocol messages, exactly what `HttpTransport` sends and expects.
//!
//! There are no client routes here. Instance registration, subscription and
//! catalog queries are Rust calls on `lodestar_naming::Registry` and
//! `Catalog`; an embedding service maps them onto its own API.
//!
//! # Peer Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/distro/v1/datum` | Receive a full service record from its owner |
//! | POST | `/distro/v1/checksum` | Compare an anti-entropy digest |
//! | POST | `/distro/v1/query` | Return full records (all when no keys given) |
//! | POST | `/distro/v1/forward` | Apply a client write forwarded by a non-owner |
//! | GET | `/distro/v1/ping` | Liveness and node id |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use lodestar_distro::{
    ENDPOINT_CHECKSUM, ENDPOINT_DATUM, ENDPOINT_FORWARD, ENDPOINT_PING, ENDPOINT_QUERY, PeerEndpoint,
};

/// Shared state for peer handlers.
#[derive(Clone)]
pub struct PeerApiState {
    pub endpoint: Arc<dyn PeerEndpoint>,
}

/// Build the peer protocol router.
pub fn build_router(endpoint: Arc<dyn PeerEndpoint>) -> Router {
    let state = PeerApiState { endpoint };
    Router::new()
        .route(ENDPOINT_DATUM, post(handlers::receive_record))
        .route(ENDPOINT_CHECKSUM, post(handlers::receive_digest))
        .route(ENDPOINT_QUERY, post(handlers::query_records))
        .route(ENDPOINT_FORWARD, post(handlers::receive_forward))
        .route(ENDPOINT_PING, get(handlers::ping))
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` flips.
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
