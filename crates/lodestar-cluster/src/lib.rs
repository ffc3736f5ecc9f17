//! lodestar-cluster: who is alive and who owns what.
//!
//! # Architecture
//!
//! ```text
//! static member list / external membership service
//!   └── PeerSet
//!       ├── counts consecutive failed and successful peer calls
//!       ├── excludes a peer after `failure_threshold` failures
//!       └── publishes the sorted healthy list on a watch channel
//!
//! DistroMapper
//!   ├── owner = sha256(key)[..8] mod len(sorted healthy list)
//!   └── install(list) swaps the view used by every ownership check
//! ```
//!
//! The mapper never reads the `PeerSet` directly: the replicator installs
//! a new view only after it has handed off the keys whose owner moved.

pub mod error;
pub mod mapper;
pub mod membership;

pub use error::{ClusterError, ClusterResult};
pub use mapper::DistroMapper;
pub use membership::{Member, MemberStatus, PeerSet};
