//! lodestar-distro: leaderless replication of naming data between
//! registry nodes.
//!
//! # Architecture
//!
//! ```text
//! DistroProtocol
//!   ├── push-on-write: local change on an owned key
//!   │     └── debounce(sync_delay) → DistroRecord to every healthy peer
//!   ├── anti-entropy: every verify_interval (+ jitter)
//!   │     └── DigestRequest of owned keys to every configured peer
//!   │           ├── peer pulls differing keys back with QueryRequest
//!   │           └── peer returns its strictly newer copies (DigestReply)
//!   ├── handoff: healthy-set change
//!   │     └── push keys whose owner moves, then install the new view
//!   └── startup load: QueryRequest{keys: []} to peers until one answers
//! ```
//!
//! Conflicts are settled by last-write-wins on `(timestamp, node)`. Peer
//! failures are logged and counted against the peer; they never fail the
//! local write that triggered them.

pub mod error;
pub mod http;
pub mod memory;
pub mod protocol;
pub mod replicator;
pub mod transport;

pub use error::{DistroError, DistroResult};
pub use http::HttpTransport;
pub use memory::MemoryNetwork;
pub use protocol::*;
pub use replicator::{DistroProtocol, SyncReport, SyncSettings, VerifyReport};
pub use transport::{PeerEndpoint, PeerTransport};
