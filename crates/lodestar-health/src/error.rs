use std::time::Duration;

use thiserror::Error;

/// Result of a single probe: round-trip time on success.
pub type ProbeResult<T> = Result<T, ProbeError>;

/// Why a probe did not succeed. Every variant counts as one failed probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe failed: {0}")]
    Failure(String),
}
