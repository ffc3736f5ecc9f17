//! HTTP peer transport (JSON over `reqwest`).

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{DistroError, DistroResult};
use crate::protocol::*;
use crate::transport::PeerTransport;

/// Reaches peers at `http://{peer}{endpoint}`; peer ids are host:port.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> DistroResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| DistroError::Codec(format!("building http client: {e}")))?;
        Ok(Self { client })
    }

    async fn post<Req, Resp>(&self, peer: &str, path: &str, body: &Req) -> DistroResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("http://{peer}{path}"))
            .json(body)
            .send()
            .await
            .map_err(|e| unreachable(peer, e))?;
        decode(peer, response).await
    }

    async fn get<Resp: DeserializeOwned>(&self, peer: &str, path: &str) -> DistroResult<Resp> {
        let response = self
            .client
            .get(format!("http://{peer}{path}"))
            .send()
            .await
            .map_err(|e| unreachable(peer, e))?;
        decode(peer, response).await
    }
}

fn unreachable(peer: &str, e: reqwest::Error) -> DistroError {
    DistroError::PeerUnreachable {
        peer: peer.to_string(),
        reason: e.to_string(),
    }
}

async fn decode<Resp: DeserializeOwned>(peer: &str, response: reqwest::Response) -> DistroResult<Resp> {
    let status = response.status();
    if !status.is_success() {
        return Err(DistroError::Rejected {
            peer: peer.to_string(),
            status: status.as_u16(),
        });
    }
    response.json::<Resp>().await.map_err(|e| {
        if e.is_decode() {
            DistroError::Codec(format!("response from {peer}: {e}"))
        } else {
            unreachable(peer, e)
        }
    })
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn send_record(&self, peer: &str, record: &DistroRecord) -> DistroResult<RecordAck> {
        self.post(peer, ENDPOINT_DATUM, record).await
    }

    async fn send_digest(&self, peer: &str, request: &DigestRequest) -> DistroResult<DigestReply> {
        self.post(peer, ENDPOINT_CHECKSUM, request).await
    }

    async fn query(&self, peer: &str, request: &QueryRequest) -> DistroResult<QueryReply> {
        self.post(peer, ENDPOINT_QUERY, request).await
    }

    async fn forward(&self, peer: &str, request: &ForwardRequest) -> DistroResult<ForwardReply> {
        self.post(peer, ENDPOINT_FORWARD, request).await
    }

    async fn ping(&self, peer: &str) -> DistroResult<PingReply> {
        self.get(peer, ENDPOINT_PING).await
    }
}
