//! lodestar.toml configuration parser.
//!
//! Every section is optional. Durations are human strings ("5s", "500ms")
//! and each section exposes typed accessors that fall back to the
//! documented default when a value is malformed.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::{parse_duration, parse_or};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LodestarConfig {
    pub node: NodeConfig,
    pub cluster: ClusterConfig,
    pub distro: DistroConfig,
    pub health: HealthConfig,
    pub lease: LeaseConfig,
    pub push: PushConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity; defaults to the peer bind address.
    pub id: Option<String>,
    /// Address the peer protocol listens on.
    pub bind: String,
    /// UDP address used for client pushes.
    pub push_bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Static member list (peer protocol addresses), including this node.
    pub peers: Vec<String>,
    /// Consecutive failed calls before a peer is excluded from ownership.
    pub failure_threshold: u32,
    /// Consecutive successful calls before an excluded peer is re-admitted.
    pub recovery_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistroConfig {
    pub sync_delay: String,
    pub sync_timeout: String,
    pub verify_interval: String,
    pub verify_jitter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval: String,
    pub jitter: String,
    pub timeout: String,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub unhealthy_after: String,
    pub expire_after: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub debounce: String,
    pub ack_timeout: String,
    pub max_attempts: u32,
    pub max_backoff: String,
    /// Bodies larger than this many bytes are gzip-compressed.
    pub compress_threshold: usize,
    pub idle_timeout: String,
    pub drain_timeout: String,
    pub retry_tick: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            bind: "0.0.0.0:8848".to_string(),
            push_bind: "0.0.0.0:8849".to_string(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            failure_threshold: 3,
            recovery_threshold: 1,
        }
    }
}

impl Default for DistroConfig {
    fn default() -> Self {
        Self {
            sync_delay: "1s".to_string(),
            sync_timeout: "3s".to_string(),
            verify_interval: "5s".to_string(),
            verify_jitter: "1s".to_string(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: "5s".to_string(),
            jitter: "1s".to_string(),
            timeout: "2s".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 1,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            unhealthy_after: "15s".to_string(),
            expire_after: "30s".to_string(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            debounce: "200ms".to_string(),
            ack_timeout: "1s".to_string(),
            max_attempts: 3,
            max_backoff: "8s".to_string(),
            compress_threshold: 1024,
            idle_timeout: "10s".to_string(),
            drain_timeout: "5s".to_string(),
            retry_tick: "100ms".to_string(),
        }
    }
}

impl NodeConfig {
    /// Effective node id.
    pub fn node_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.bind.clone())
    }
}

impl DistroConfig {
    pub fn sync_delay(&self) -> Duration {
        parse_or(&self.sync_delay, Duration::from_secs(1))
    }

    pub fn sync_timeout(&self) -> Duration {
        parse_or(&self.sync_timeout, Duration::from_secs(3))
    }

    pub fn verify_interval(&self) -> Duration {
        parse_or(&self.verify_interval, Duration::from_secs(5))
    }

    pub fn verify_jitter(&self) -> Duration {
        parse_or(&self.verify_jitter, Duration::from_secs(1))
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        parse_or(&self.interval, Duration::from_secs(5))
    }

    pub fn jitter(&self) -> Duration {
        parse_or(&self.jitter, Duration::from_secs(1))
    }

    pub fn timeout(&self) -> Duration {
        parse_or(&self.timeout, Duration::from_secs(2))
    }
}

impl LeaseConfig {
    pub fn unhealthy_after(&self) -> Duration {
        parse_or(&self.unhealthy_after, Duration::from_secs(15))
    }

    pub fn expire_after(&self) -> Duration {
        parse_or(&self.expire_after, Duration::from_secs(30))
    }
}

impl PushConfig {
    pub fn debounce(&self) -> Duration {
        parse_or(&self.debounce, Duration::from_millis(200))
    }

    pub fn ack_timeout(&self) -> Duration {
        parse_or(&self.ack_timeout, Duration::from_secs(1))
    }

    pub fn max_backoff(&self) -> Duration {
        parse_or(&self.max_backoff, Duration::from_secs(8))
    }

    pub fn idle_timeout(&self) -> Duration {
        parse_or(&self.idle_timeout, Duration::from_secs(10))
    }

    pub fn drain_timeout(&self) -> Duration {
        parse_or(&self.drain_timeout, Duration::from_secs(5))
    }

    pub fn retry_tick(&self) -> Duration {
        parse_or(&self.retry_tick, Duration::from_millis(100))
    }
}

impl LodestarConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LodestarConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values that would silently fall back to defaults or make
    /// the lease and retry schedules meaningless.
    pub fn validate(&self) -> anyhow::Result<()> {
        let durations = [
            ("distro.sync_delay", &self.distro.sync_delay),
            ("distro.sync_timeout", &self.distro.sync_timeout),
            ("distro.verify_interval", &self.distro.verify_interval),
            ("distro.verify_jitter", &self.distro.verify_jitter),
            ("health.interval", &self.health.interval),
            ("health.jitter", &self.health.jitter),
            ("health.timeout", &self.health.timeout),
            ("lease.unhealthy_after", &self.lease.unhealthy_after),
            ("lease.expire_after", &self.lease.expire_after),
            ("push.debounce", &self.push.debounce),
            ("push.ack_timeout", &self.push.ack_timeout),
            ("push.max_backoff", &self.push.max_backoff),
            ("push.idle_timeout", &self.push.idle_timeout),
            ("push.drain_timeout", &self.push.drain_timeout),
            ("push.retry_tick", &self.push.retry_tick),
        ];
        for (field, value) in durations {
            if parse_duration(value).is_none() {
                anyhow::bail!("{field}: invalid duration {value:?}");
            }
        }

        if self.cluster.failure_threshold == 0 {
            anyhow::bail!("cluster.failure_threshold must be at least 1");
        }
        if self.health.unhealthy_threshold == 0 || self.health.healthy_threshold == 0 {
            anyhow::bail!("health thresholds must be at least 1");
        }
        if self.push.max_attempts == 0 {
            anyhow::bail!("push.max_attempts must be at least 1");
        }
        if self.lease.expire_after() < self.lease.unhealthy_after() {
            anyhow::bail!("lease.expire_after must not be shorter than lease.unhealthy_after");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = LodestarConfig::default();
        config.validate().unwrap();
        assert_eq!(config.push.debounce(), Duration::from_millis(200));
        assert_eq!(config.lease.expire_after(), Duration::from_secs(30));
        assert_eq!(config.node.node_id(), "0.0.0.0:8848");
    }

    #[test]
    fn parse_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[node]
id = "10.0.0.11:8848"
bind = "10.0.0.11:8848"

[cluster]
peers = ["10.0.0.11:8848", "10.0.0.12:8848"]

[push]
debounce = "50ms"
"#
        )
        .unwrap();

        let config = LodestarConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node.node_id(), "10.0.0.11:8848");
        assert_eq!(config.cluster.peers.len(), 2);
        assert_eq!(config.cluster.failure_threshold, 3);
        assert_eq!(config.push.debounce(), Duration::from_millis(50));
        assert_eq!(config.push.max_attempts, 3);
    }

    #[test]
    fn rejects_bad_duration() {
        let config: LodestarConfig = toml::from_str(
            r#"
[health]
interval = "often"
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("health.interval"));
    }

    #[test]
    fn rejects_inverted_lease() {
        let mut config = LodestarConfig::default();
        config.lease.unhealthy_after = "30s".to_string();
        config.lease.expire_after = "10s".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_keeps_values() {
        let mut config = LodestarConfig::default();
        config.cluster.peers = vec!["a:1".to_string()];
        let rendered = config.to_toml_string().unwrap();
        let parsed: LodestarConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.cluster.peers, vec!["a:1"]);
    }
}
