//! In-process peer network.
//!
//! Nodes attach their endpoint and get a transport bound to their own id.
//! Messages are JSON round-tripped so they exercise the same serde paths as
//! HTTP. Nodes can be taken down and node pairs partitioned to model
//! failures.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use lodestar_state::NodeId;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{DistroError, DistroResult};
use crate::protocol::*;
use crate::transport::{PeerEndpoint, PeerTransport};

#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<NodeId, Weak<dyn PeerEndpoint>>>,
    down: RwLock<HashSet<NodeId>>,
    cuts: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `endpoint` reachable under its node id. The network only holds
    /// a weak reference.
    pub fn attach<E: PeerEndpoint + 'static>(&self, endpoint: &Arc<E>) {
        let weak = Arc::downgrade(endpoint);
        let weak: Weak<dyn PeerEndpoint> = weak;
        self.nodes
            .write()
            .expect("network nodes lock")
            .insert(endpoint.node_id().to_string(), weak);
    }

    /// Transport whose calls originate from `from`.
    pub fn transport(self: &Arc<Self>, from: impl Into<NodeId>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            from: from.into(),
            network: self.clone(),
        })
    }

    /// Take a node off the network (or bring it back).
    pub fn set_down(&self, node: &str, down: bool) {
        let mut set = self.down.write().expect("network down lock");
        if down {
            set.insert(node.to_string());
        } else {
            set.remove(node);
        }
    }

    /// Drop traffic in both directions between `a` and `b`.
    pub fn partition(&self, a: &str, b: &str) {
        let mut cuts = self.cuts.write().expect("network cuts lock");
        cuts.insert((a.to_string(), b.to_string()));
        cuts.insert((b.to_string(), a.to_string()));
    }

    pub fn heal(&self) {
        self.cuts.write().expect("network cuts lock").clear();
        self.down.write().expect("network down lock").clear();
    }

    fn route(&self, from: &str, to: &str) -> DistroResult<Arc<dyn PeerEndpoint>> {
        let unreachable = |reason: &str| DistroError::PeerUnreachable {
            peer: to.to_string(),
            reason: reason.to_string(),
        };
        {
            let down = self.down.read().expect("network down lock");
            if down.contains(to) || down.contains(from) {
                return Err(unreachable("node down"));
            }
        }
        if self
            .cuts
            .read()
            .expect("network cuts lock")
            .contains(&(from.to_string(), to.to_string()))
        {
            return Err(unreachable("partitioned"));
        }
        self.nodes
            .read()
            .expect("network nodes lock")
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| unreachable("connection refused"))
    }
}

fn roundtrip<T: Serialize + DeserializeOwned>(value: &T) -> DistroResult<T> {
    let bytes = serde_json::to_vec(value).map_err(|e| DistroError::Codec(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| DistroError::Codec(e.to_string()))
}

pub struct MemoryTransport {
    from: NodeId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn send_record(&self, peer: &str, record: &DistroRecord) -> DistroResult<RecordAck> {
        let endpoint = self.network.route(&self.from, peer)?;
        endpoint.on_record(roundtrip(record)?).await
    }

    async fn send_digest(&self, peer: &str, request: &DigestRequest) -> DistroResult<DigestReply> {
        let endpoint = self.network.route(&self.from, peer)?;
        let reply = endpoint.on_digest(roundtrip(request)?).await?;
        roundtrip(&reply)
    }

    async fn query(&self, peer: &str, request: &QueryRequest) -> DistroResult<QueryReply> {
        let endpoint = self.network.route(&self.from, peer)?;
        let reply = endpoint.on_query(roundtrip(request)?).await?;
        roundtrip(&reply)
    }

    async fn forward(&self, peer: &str, request: &ForwardRequest) -> DistroResult<ForwardReply> {
        let endpoint = self.network.route(&self.from, peer)?;
        let reply = endpoint.on_forward(roundtrip(request)?).await?;
        roundtrip(&reply)
    }

    async fn ping(&self, peer: &str) -> DistroResult<PingReply> {
        let endpoint = self.network.route(&self.from, peer)?;
        Ok(endpoint.on_ping())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(String);

    #[async_trait]
    impl PeerEndpoint for Echo {
        fn node_id(&self) -> &str {
            &self.0
        }

        async fn on_record(&self, _record: DistroRecord) -> DistroResult<RecordAck> {
            Ok(RecordAck { applied: true })
        }

        async fn on_digest(&self, _request: DigestRequest) -> DistroResult<DigestReply> {
            Ok(DigestReply::default())
        }

        async fn on_query(&self, _request: QueryRequest) -> DistroResult<QueryReply> {
            Ok(QueryReply::default())
        }
    }

    #[tokio::test]
    async fn routes_to_attached_nodes() {
        let network = MemoryNetwork::new();
        let b = Arc::new(Echo("b".to_string()));
        network.attach(&b);
        let from_a = network.transport("a");

        assert_eq!(from_a.ping("b").await.unwrap().node, "b");
        assert!(from_a.ping("c").await.unwrap_err().is_peer_failure());
    }

    #[tokio::test]
    async fn down_and_partitioned_nodes_are_unreachable() {
        let network = MemoryNetwork::new();
        let b = Arc::new(Echo("b".to_string()));
        network.attach(&b);
        let from_a = network.transport("a");
        let from_c = network.transport("c");

        network.partition("a", "b");
        assert!(from_a.ping("b").await.is_err());
        assert!(from_c.ping("b").await.is_ok());

        network.heal();
        network.set_down("b", true);
        assert!(from_c.ping("b").await.is_err());
        network.set_down("b", false);
        assert!(from_a.ping("b").await.is_ok());
    }

    #[tokio::test]
    async fn forward_defaults_to_unsupported() {
        let network = MemoryNetwork::new();
        let b = Arc::new(Echo("b".to_string()));
        network.attach(&b);
        let request = ForwardRequest {
            from: "a".to_string(),
            write: ForwardedWrite::Heartbeat {
                key: lodestar_core::ServiceKey::new("public", "g", "s"),
                instance: "x".to_string(),
            },
            hops: 1,
        };
        let err = network.transport("a").forward("b", &request).await.unwrap_err();
        assert!(matches!(err, DistroError::Forward(_)));
    }

    #[tokio::test]
    async fn dropped_endpoint_refuses_connections() {
        let network = MemoryNetwork::new();
        let b = Arc::new(Echo("b".to_string()));
        network.attach(&b);
        drop(b);
        assert!(network.transport("a").ping("b").await.is_err());
    }
}
