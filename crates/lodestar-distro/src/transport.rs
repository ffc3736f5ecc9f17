//! The two sides of a peer call.
//!
//! `PeerTransport` is what a node uses to reach another node;
//! `PeerEndpoint` is what answers on the other end. The HTTP router and the
//! in-memory network both deliver into a `PeerEndpoint`.

use async_trait::async_trait;

use crate::error::{DistroError, DistroResult};
use crate::protocol::*;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send_record(&self, peer: &str, record: &DistroRecord) -> DistroResult<RecordAck>;

    async fn send_digest(&self, peer: &str, request: &DigestRequest) -> DistroResult<DigestReply>;

    async fn query(&self, peer: &str, request: &QueryRequest) -> DistroResult<QueryReply>;

    async fn forward(&self, peer: &str, request: &ForwardRequest) -> DistroResult<ForwardReply>;

    async fn ping(&self, peer: &str) -> DistroResult<PingReply>;
}

#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    fn node_id(&self) -> &str;

    async fn on_record(&self, record: DistroRecord) -> DistroResult<RecordAck>;

    async fn on_digest(&self, request: DigestRequest) -> DistroResult<DigestReply>;

    async fn on_query(&self, request: QueryRequest) -> DistroResult<QueryReply>;

    async fn on_forward(&self, request: ForwardRequest) -> DistroResult<ForwardReply> {
        Err(DistroError::Forward(format!(
            "{} does not accept forwarded {} writes",
            self.node_id(),
            request.write.op()
        )))
    }

    fn on_ping(&self) -> PingReply {
        PingReply {
            node: self.node_id().to_string(),
        }
    }
}
