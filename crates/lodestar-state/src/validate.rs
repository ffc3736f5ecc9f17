//! Input validation applied before anything touches the store.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{StateError, StateResult};
use crate::types::Instance;

/// Upper bound accepted for instance weights.
pub const MAX_WEIGHT: f64 = 10_000.0;

static CLUSTER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Za-z-]+$").expect("cluster name pattern"));

static HOSTNAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$")
        .expect("hostname pattern")
});

pub fn validate_cluster_name(name: &str) -> StateResult<()> {
    if CLUSTER_NAME.is_match(name) {
        Ok(())
    } else {
        Err(StateError::Validation(format!(
            "cluster name {name:?} may only contain digits, letters and '-'"
        )))
    }
}

pub fn validate_ip(ip: &str) -> StateResult<()> {
    if ip.parse::<IpAddr>().is_ok() || HOSTNAME.is_match(ip) {
        Ok(())
    } else {
        Err(StateError::Validation(format!("invalid instance address {ip:?}")))
    }
}

pub fn validate_weight(weight: f64) -> StateResult<()> {
    if weight.is_finite() && (0.0..=MAX_WEIGHT).contains(&weight) {
        Ok(())
    } else {
        Err(StateError::Validation(format!(
            "weight {weight} must be within [0, {MAX_WEIGHT}]"
        )))
    }
}

pub fn validate_protect_threshold(threshold: f32) -> StateResult<()> {
    if threshold.is_finite() && (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(StateError::Validation(format!(
            "protect threshold {threshold} must be within [0, 1]"
        )))
    }
}

pub fn validate_instance(instance: &Instance) -> StateResult<()> {
    validate_ip(&instance.ip)?;
    validate_cluster_name(&instance.cluster_name)?;
    validate_weight(instance.weight)?;
    if instance.port == 0 {
        return Err(StateError::Validation("port must not be 0".to_string()));
    }
    Ok(())
}
