//! Error types for peer replication.

use lodestar_state::StateError;
use thiserror::Error;

/// Result type alias for replication operations.
pub type DistroResult<T> = Result<T, DistroError>;

#[derive(Debug, Error)]
pub enum DistroError {
    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    #[error("peer {peer} rejected request with status {status}")]
    Rejected { peer: String, status: u16 },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("forward failed: {0}")]
    Forward(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl DistroError {
    /// Whether the failure says something about the peer's liveness.
    pub fn is_peer_failure(&self) -> bool {
        matches!(self, DistroError::PeerUnreachable { .. })
    }
}
