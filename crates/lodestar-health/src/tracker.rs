//! Per-instance health state machine.

use lodestar_core::config::HealthConfig;
use tracing::{debug, info, warn};

/// Tracks consecutive probe outcomes for a single instance.
///
/// Two states only: healthy and unhealthy. The tracker starts from the
/// instance's current health so a restart does not re-announce it.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    healthy: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Failures needed to go unhealthy.
    unhealthy_threshold: u32,
    /// Successes needed to recover.
    healthy_threshold: u32,
}

impl HealthTracker {
    pub fn new(healthy: bool, unhealthy_threshold: u32, healthy_threshold: u32) -> Self {
        Self {
            healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
        }
    }

    pub fn from_config(config: &HealthConfig, healthy: bool) -> Self {
        Self::new(healthy, config.unhealthy_threshold, config.healthy_threshold)
    }

    /// Record one probe outcome. Returns the new health when this probe
    /// caused a transition, `None` otherwise.
    pub fn record(&mut self, success: bool) -> Option<bool> {
        if success {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            if !self.healthy && self.consecutive_successes >= self.healthy_threshold {
                self.healthy = true;
                info!(successes = self.consecutive_successes, "instance recovered to healthy");
                return Some(true);
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.healthy && self.consecutive_failures >= self.unhealthy_threshold {
                self.healthy = false;
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.unhealthy_threshold,
                    "instance marked unhealthy"
                );
                return Some(false);
            }
        }
        None
    }

    /// Adopt health written elsewhere (replica from the previous owner,
    /// operator update) without counting it as a transition.
    pub fn reseed(&mut self, healthy: bool) {
        if self.healthy != healthy {
            debug!(healthy, "tracker reseeded from store");
            self.healthy = healthy;
            self.consecutive_failures = 0;
            self.consecutive_successes = 0;
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }
}
