//! lodestar-core: shared building blocks for the Lodestar registry.
//!
//! Holds the pieces every other crate leans on: the `lodestar.toml`
//! configuration model, service key formatting, human duration parsing,
//! the key debouncer used by replication and push, list paging, and clock
//! helpers.

pub mod clock;
pub mod config;
pub mod debounce;
pub mod duration;
pub mod key;
pub mod page;

pub use config::LodestarConfig;
pub use debounce::Debouncer;
pub use duration::parse_duration;
pub use key::{KeyError, ServiceKey, DEFAULT_GROUP, DEFAULT_NAMESPACE};
pub use page::{Page, paginate};
