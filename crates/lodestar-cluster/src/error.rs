//! Error types for the cluster view.

use thiserror::Error;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
}
