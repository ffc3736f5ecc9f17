//! Error types for the naming store.

use thiserror::Error;

use crate::types::Revision;

/// Result type alias for naming store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while reading or mutating the naming store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// A replicated write lost the last-write-wins race against the local copy.
    #[error("stale write for {key}: incoming {incoming} is not newer than local {local}")]
    Conflict {
        key: String,
        local: Revision,
        incoming: Revision,
    },

    #[error("serialization error: {0}")]
    Serialize(String),
}

impl From<lodestar_core::KeyError> for StateError {
    fn from(e: lodestar_core::KeyError) -> Self {
        StateError::Validation(e.to_string())
    }
}
