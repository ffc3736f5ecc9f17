//! Node-to-node messages and endpoint paths.

use lodestar_core::ServiceKey;
use lodestar_state::{Instance, InstanceId, NodeId, Service, ServiceDigest, ServiceUpdate};
use serde::{Deserialize, Serialize};

pub const ENDPOINT_DATUM: &str = "/distro/v1/datum";
pub const ENDPOINT_CHECKSUM: &str = "/distro/v1/checksum";
pub const ENDPOINT_QUERY: &str = "/distro/v1/query";
pub const ENDPOINT_FORWARD: &str = "/distro/v1/forward";
pub const ENDPOINT_PING: &str = "/distro/v1/ping";

/// Forwarded writes never travel more than one hop.
pub const MAX_FORWARD_HOPS: u8 = 1;

/// Full snapshot of one service, pushed by its owner after a write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistroRecord {
    pub origin: NodeId,
    pub service: Service,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RecordAck {
    pub applied: bool,
}

pub type DigestEntry = ServiceDigest;

/// Summary of the services the sender owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestRequest {
    pub from: NodeId,
    pub entries: Vec<DigestEntry>,
}

/// Records the receiver holds in a strictly newer version than the digest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DigestReply {
    pub newer: Vec<Service>,
}

/// Request for full records. An empty key list asks for every record the
/// responder holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub from: NodeId,
    pub keys: Vec<ServiceKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryReply {
    pub records: Vec<Service>,
}

/// A client write received by a node that does not own the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ForwardedWrite {
    Register { key: ServiceKey, instance: Instance },
    Deregister { key: ServiceKey, instance: InstanceId },
    Update { key: ServiceKey, instance: Instance },
    Heartbeat { key: ServiceKey, instance: InstanceId },
    UpdateService { key: ServiceKey, update: ServiceUpdate },
}

impl ForwardedWrite {
    pub fn key(&self) -> &ServiceKey {
        match self {
            ForwardedWrite::Register { key, .. }
            | ForwardedWrite::Deregister { key, .. }
            | ForwardedWrite::Update { key, .. }
            | ForwardedWrite::Heartbeat { key, .. }
            | ForwardedWrite::UpdateService { key, .. } => key,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            ForwardedWrite::Register { .. } => "register",
            ForwardedWrite::Deregister { .. } => "deregister",
            ForwardedWrite::Update { .. } => "update",
            ForwardedWrite::Heartbeat { .. } => "heartbeat",
            ForwardedWrite::UpdateService { .. } => "update_service",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub from: NodeId,
    pub write: ForwardedWrite,
    pub hops: u8,
}

/// Outcome of a forwarded write on the owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ForwardReply {
    Applied { changed: bool },
    NotOwner { owner: NodeId },
    NotFound { message: String },
    Invalid { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingReply {
    pub node: NodeId,
}
