//! lodestar-health: liveness for registered instances.
//!
//! Persistent instances are probed actively; ephemeral instances live on
//! heartbeats and expire when their lease runs out.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── ChangeEvent stream → reconcile probe tasks per service
//!   └── Per-instance task (owner only)
//!       ├── Prober::probe() → RT or ProbeError
//!       ├── HealthTracker (consecutive failures / successes)
//!       └── NamingStore::set_instance_health on transition
//!
//! LeaseReaper
//!   ├── min-heap of (deadline, instance)
//!   ├── unhealthy_after → mark unhealthy
//!   └── expire_after    → remove
//! ```
//!
//! A state change is written, and therefore announced, only when the
//! tracker crosses a threshold. Repeated failures on an instance that is
//! already unhealthy produce nothing.

pub mod error;
pub mod lease;
pub mod monitor;
pub mod probe;
pub mod tracker;

pub use error::{ProbeError, ProbeResult};
pub use lease::{LeaseReaper, LeaseSettings, ReapReport};
pub use monitor::{ClusterRt, HealthMonitor, HealthSettings, ProberFactory};
pub use probe::{HttpProber, MysqlProber, NoopProber, Prober, TcpProber, prober_for};
pub use tracker::HealthTracker;
