//! Probe implementations.
//!
//! A cluster's `HealthCheckerConfig` selects the prober; every prober
//! answers with the probe round-trip time or a `ProbeError`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lodestar_state::HealthCheckerConfig;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{ProbeError, ProbeResult};

/// MySQL protocol version carried in the initial handshake packet.
const MYSQL_PROTOCOL_V10: u8 = 10;

#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `addr` (`host:port`), giving up after `timeout`.
    async fn probe(&self, addr: &str, timeout: Duration) -> ProbeResult<Duration>;

    fn kind(&self) -> &'static str;
}

/// Pick the prober for a cluster's checker configuration.
pub fn prober_for(config: &HealthCheckerConfig) -> Arc<dyn Prober> {
    match config {
        HealthCheckerConfig::Tcp => Arc::new(TcpProber),
        HealthCheckerConfig::Http {
            path,
            expected_status,
            headers,
        } => Arc::new(HttpProber {
            path: path.clone(),
            expected_status: *expected_status,
            headers: headers.clone(),
        }),
        HealthCheckerConfig::Mysql => Arc::new(MysqlProber),
        HealthCheckerConfig::None => Arc::new(NoopProber),
    }
}

async fn bounded<F>(timeout: Duration, probe: F) -> ProbeResult<Duration>
where
    F: std::future::Future<Output = ProbeResult<()>>,
{
    let started = Instant::now();
    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(())) => Ok(started.elapsed()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}

async fn connect(addr: &str) -> ProbeResult<TcpStream> {
    TcpStream::connect(addr)
        .await
        .map_err(|e| ProbeError::Failure(format!("connect {addr}: {e}")))
}

// ── TCP ───────────────────────────────────────────────────────────

/// Healthy when a TCP connection can be established.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, addr: &str, timeout: Duration) -> ProbeResult<Duration> {
        bounded(timeout, async {
            connect(addr).await?;
            Ok(())
        })
        .await
    }

    fn kind(&self) -> &'static str {
        "TCP"
    }
}

// ── HTTP ──────────────────────────────────────────────────────────

/// Healthy when `GET path` answers with `expected_status`.
#[derive(Debug, Clone)]
pub struct HttpProber {
    pub path: String,
    pub expected_status: u16,
    pub headers: BTreeMap<String, String>,
}

impl Default for HttpProber {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            expected_status: 200,
            headers: BTreeMap::new(),
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, addr: &str, timeout: Duration) -> ProbeResult<Duration> {
        let uri = format!("http://{addr}{}", self.path);
        bounded(timeout, async {
            let stream = connect(addr).await?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ProbeError::Failure(format!("handshake {uri}: {e}")))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let mut builder = http::Request::builder()
                .method("GET")
                .uri(&uri)
                .header("host", addr)
                .header("user-agent", "lodestar-health/0.1");
            for (name, value) in &self.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let request = builder
                .body(http_body_util::Empty::<bytes::Bytes>::new())
                .map_err(|e| ProbeError::Failure(format!("request {uri}: {e}")))?;

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| ProbeError::Failure(format!("request {uri}: {e}")))?;
            let status = response.status().as_u16();
            if status == self.expected_status {
                Ok(())
            } else {
                debug!(%uri, status, expected = self.expected_status, "health probe status mismatch");
                Err(ProbeError::Failure(format!(
                    "{uri} answered {status}, expected {}",
                    self.expected_status
                )))
            }
        })
        .await
    }

    fn kind(&self) -> &'static str {
        "HTTP"
    }
}

// ── MySQL ─────────────────────────────────────────────────────────

/// Healthy when the server greets with a protocol-10 handshake packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlProber;

#[async_trait]
impl Prober for MysqlProber {
    async fn probe(&self, addr: &str, timeout: Duration) -> ProbeResult<Duration> {
        bounded(timeout, async {
            let mut stream = connect(addr).await?;
            // 3-byte payload length, 1-byte sequence id, then the payload.
            let mut header = [0u8; 5];
            stream
                .read_exact(&mut header)
                .await
                .map_err(|e| ProbeError::Failure(format!("reading handshake from {addr}: {e}")))?;
            match header[4] {
                MYSQL_PROTOCOL_V10 => Ok(()),
                0xff => Err(ProbeError::Failure(format!("{addr} sent an error packet"))),
                other => Err(ProbeError::Failure(format!(
                    "{addr} sent protocol version {other}"
                ))),
            }
        })
        .await
    }

    fn kind(&self) -> &'static str {
        "MYSQL"
    }
}

// ── None ──────────────────────────────────────────────────────────

/// Always healthy; for instances whose health is reported externally.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProber;

#[async_trait]
impl Prober for NoopProber {
    async fn probe(&self, _addr: &str, _timeout: Duration) -> ProbeResult<Duration> {
        Ok(Duration::ZERO)
    }

    fn kind(&self) -> &'static str {
        "NONE"
    }
}
