//! lodestar-naming: the registry facade of a Lodestar node.
//!
//! # Architecture
//!
//! ```text
//! Registry
//!   ├── validate input (key, instance, protect threshold)
//!   ├── owned key     → NamingStore write → ChangeEvent
//!   │                     ├── DistroProtocol (push-on-write)
//!   │                     └── PushService (debounced push)
//!   ├── foreign key   → forward once to the owner, or redirect
//!   └── reads         → snapshot of the local copy
//!
//! Catalog
//!   └── operator views: service detail, instance pages, publisher and
//!       subscriber overview, probe round trips
//! ```
//!
//! `Registry` also answers the node-to-node protocol, delegating
//! replication messages to its `DistroProtocol` and applying forwarded
//! writes itself.
//!
//! Both types are library surfaces. `lodestard` serves only the peer
//! protocol; client registration, subscription and the operator views are
//! reached by embedding this crate behind an HTTP or gRPC layer of your own.

pub mod catalog;
pub mod error;
pub mod registry;

pub use catalog::{Catalog, ClusterHealth, ServiceDetail, ServiceOverview};
pub use error::{NamingError, NamingResult};
pub use registry::{InstanceList, ListRequest, Registry, ServiceList, WriteAck};
