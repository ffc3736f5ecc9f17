//! Registry facade error types.

use lodestar_core::ServiceKey;
use lodestar_distro::DistroError;
use lodestar_push::PushError;
use lodestar_state::{NodeId, StateError};
use thiserror::Error;

/// Errors surfaced to callers of the registry facade.
#[derive(Debug, Error)]
pub enum NamingError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// The write belongs to another node and could not be forwarded there.
    #[error("{key} is owned by {owner}")]
    OwnershipMismatch { key: ServiceKey, owner: NodeId },

    #[error("state error: {0}")]
    State(StateError),

    #[error("replication error: {0}")]
    Distro(#[from] DistroError),

    #[error("push error: {0}")]
    Push(#[from] PushError),
}

impl From<StateError> for NamingError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(what) => NamingError::NotFound(what),
            StateError::Validation(reason) => NamingError::Validation(reason),
            other => NamingError::State(other),
        }
    }
}

impl From<lodestar_core::KeyError> for NamingError {
    fn from(e: lodestar_core::KeyError) -> Self {
        NamingError::Validation(e.to_string())
    }
}

pub type NamingResult<T> = Result<T, NamingError>;
