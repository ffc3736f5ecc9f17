//! lodestar-state: in-memory naming data model for Lodestar.
//!
//! Holds namespaces, services, clusters and instances. Each service lives
//! in its own slot guarded by an `RwLock<Arc<Service>>`: readers clone the
//! `Arc` and walk away with an immutable snapshot, writers clone, modify and
//! swap under the slot's write lock. Writers on one key are serialised while
//! different keys proceed in parallel, and no reader ever waits on a probe,
//! a peer call or a push.
//!
//! Every committed mutation is announced as a [`ChangeEvent`] on the
//! subscriber channels handed out by [`NamingStore::subscribe`], in the
//! order the writes were applied.

pub mod error;
pub mod store;
pub mod types;
pub mod validate;

pub use error::{StateError, StateResult};
pub use store::NamingStore;
pub use types::*;
