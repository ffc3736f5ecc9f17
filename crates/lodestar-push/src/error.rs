use std::net::SocketAddr;

use thiserror::Error;

pub type PushResult<T> = Result<T, PushError>;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push to {client} not acknowledged after {attempts} attempts")]
    DeliveryFailed { client: SocketAddr, attempts: u32 },

    #[error("push frame codec error: {0}")]
    Codec(String),

    #[error("push socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("push service is draining")]
    Draining,
}
