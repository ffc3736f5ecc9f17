//! Service keys.
//!
//! A service is identified by `(namespace, group, name)`. Clients usually
//! address it by its grouped name `group@@name` inside a namespace; the
//! registry uses the full form `namespace##group@@name` wherever a single
//! string key is needed (ownership hashing, wire frames, digests).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Namespace that always exists.
pub const DEFAULT_NAMESPACE: &str = "public";

/// Group used when a grouped name carries no group.
pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";

/// Separator between group and service name.
pub const GROUP_SEPARATOR: &str = "@@";

/// Separator between namespace and grouped name.
pub const NAMESPACE_SEPARATOR: &str = "##";

/// Errors produced while parsing or validating a key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("malformed service key: {0}")]
    Malformed(String),
}

/// Identity of a logical service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub group: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(
        namespace: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            group: group.into(),
            name: name.into(),
        }
    }

    /// Build a key from a namespace and a `group@@name` string.
    ///
    /// A grouped name without a group lands in [`DEFAULT_GROUP`].
    pub fn from_grouped(namespace: &str, grouped: &str) -> Result<Self, KeyError> {
        let key = match grouped.split_once(GROUP_SEPARATOR) {
            Some((group, name)) => Self::new(namespace, group, name),
            None => Self::new(namespace, DEFAULT_GROUP, grouped),
        };
        key.validate()?;
        Ok(key)
    }

    /// `group@@name`.
    pub fn grouped_name(&self) -> String {
        format!("{}{GROUP_SEPARATOR}{}", self.group, self.name)
    }

    pub fn validate(&self) -> Result<(), KeyError> {
        if self.namespace.trim().is_empty() {
            return Err(KeyError::Empty("namespace"));
        }
        if self.group.trim().is_empty() {
            return Err(KeyError::Empty("group"));
        }
        if self.name.trim().is_empty() {
            return Err(KeyError::Empty("service name"));
        }
        if self.name.contains(GROUP_SEPARATOR) || self.group.contains(GROUP_SEPARATOR) {
            return Err(KeyError::Malformed(self.to_string()));
        }
        if self.namespace.contains(NAMESPACE_SEPARATOR) {
            return Err(KeyError::Malformed(self.to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{NAMESPACE_SEPARATOR}{}{GROUP_SEPARATOR}{}",
            self.namespace, self.group, self.name
        )
    }
}

impl FromStr for ServiceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, grouped) = s
            .split_once(NAMESPACE_SEPARATOR)
            .ok_or_else(|| KeyError::Malformed(s.to_string()))?;
        if !grouped.contains(GROUP_SEPARATOR) {
            return Err(KeyError::Malformed(s.to_string()));
        }
        Self::from_grouped(namespace, grouped)
    }
}
