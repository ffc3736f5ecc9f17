//! Who listens to which service.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::RwLock;

use lodestar_core::{Page, ServiceKey, paginate};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A client listening for pushes of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    /// UDP address pushes are sent to.
    pub addr: SocketAddr,
    /// Client library and version, e.g. `lodestar-java/1.2.0`.
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub app: String,
}

impl Subscriber {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            agent: String::new(),
            app: String::new(),
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = app.into();
        self
    }
}

#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<ServiceKey, BTreeMap<SocketAddr, Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a subscription. Returns `true` when it is new.
    pub fn subscribe(&self, key: &ServiceKey, subscriber: Subscriber) -> bool {
        self.subscribers
            .write()
            .expect("subscribers lock")
            .entry(key.clone())
            .or_default()
            .insert(subscriber.addr, subscriber)
            .is_none()
    }

    /// Returns `true` when a subscription was removed.
    pub fn unsubscribe(&self, key: &ServiceKey, addr: SocketAddr) -> bool {
        let mut subscribers = self.subscribers.write().expect("subscribers lock");
        let Some(listeners) = subscribers.get_mut(key) else {
            return false;
        };
        let removed = listeners.remove(&addr).is_some();
        if listeners.is_empty() {
            subscribers.remove(key);
        }
        removed
    }

    /// Subscribers of `key`, address order.
    pub fn get_subscribers(&self, key: &ServiceKey) -> Vec<Subscriber> {
        self.subscribers
            .read()
            .expect("subscribers lock")
            .get(key)
            .map(|listeners| listeners.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_subscribers(&self, key: &ServiceKey) -> bool {
        self.subscribers
            .read()
            .expect("subscribers lock")
            .contains_key(key)
    }

    /// Subscribers of every service in `namespace` whose `group@@name`
    /// matches `pattern`. A pattern containing `*` is a wildcard match over
    /// the whole name; any other pattern matches as a substring.
    pub fn get_subscribers_fuzzy(&self, namespace: &str, pattern: &str) -> Vec<(ServiceKey, Subscriber)> {
        let matcher = NameMatcher::new(pattern);
        let subscribers = self.subscribers.read().expect("subscribers lock");
        let mut matched: Vec<(ServiceKey, Subscriber)> = subscribers
            .iter()
            .filter(|(key, _)| key.namespace == namespace && matcher.matches(&key.grouped_name()))
            .flat_map(|(key, listeners)| listeners.values().map(move |s| (key.clone(), s.clone())))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.addr.cmp(&b.1.addr)));
        matched
    }

    /// Paged subscriber listing, exact (`fuzzy = false`) or by pattern over
    /// the grouped name of `key`.
    pub fn page(&self, key: &ServiceKey, fuzzy: bool, page_no: usize, page_size: usize) -> Page<(ServiceKey, Subscriber)> {
        let rows = if fuzzy {
            self.get_subscribers_fuzzy(&key.namespace, &key.grouped_name())
        } else {
            self.get_subscribers(key)
                .into_iter()
                .map(|s| (key.clone(), s))
                .collect()
        };
        paginate(rows, page_no, page_size)
    }

    /// Keys with at least one subscriber, sorted.
    pub fn keys(&self) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = self
            .subscribers
            .read()
            .expect("subscribers lock")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn count(&self) -> usize {
        self.subscribers
            .read()
            .expect("subscribers lock")
            .values()
            .map(BTreeMap::len)
            .sum()
    }
}

enum NameMatcher {
    Wildcard(Regex),
    Substring(String),
}

impl NameMatcher {
    fn new(pattern: &str) -> Self {
        if pattern.contains('*') {
            let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
            if let Ok(re) = Regex::new(&format!("^{}$", escaped.join(".*"))) {
                return NameMatcher::Wildcard(re);
            }
        }
        NameMatcher::Substring(pattern.replace('*', ""))
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            NameMatcher::Wildcard(re) => re.is_match(name),
            NameMatcher::Substring(needle) => name.contains(needle.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 9], port))
    }

    fn key(name: &str) -> ServiceKey {
        ServiceKey::new("public", "group-a", name)
    }

    #[test]
    fn subscribe_is_idempotent_per_address() {
        let registry = SubscriberRegistry::new();
        assert!(registry.subscribe(&key("svc-a"), Subscriber::new(addr(1))));
        assert!(!registry.subscribe(&key("svc-a"), Subscriber::new(addr(1)).with_agent("sdk/2")));
        assert!(registry.subscribe(&key("svc-a"), Subscriber::new(addr(2))));

        let subscribers = registry.get_subscribers(&key("svc-a"));
        assert_eq!(subscribers.len(), 2);
        assert_eq!(subscribers[0].agent, "sdk/2");
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn unsubscribe_removes_empty_keys() {
        let registry = SubscriberRegistry::new();
        registry.subscribe(&key("svc-a"), Subscriber::new(addr(1)));
        assert!(registry.unsubscribe(&key("svc-a"), addr(1)));
        assert!(!registry.unsubscribe(&key("svc-a"), addr(1)));
        assert!(!registry.has_subscribers(&key("svc-a")));
        assert!(registry.keys().is_empty());
    }

    #[test]
    fn fuzzy_match_supports_wildcards_and_substrings() {
        let registry = SubscriberRegistry::new();
        registry.subscribe(&key("svc-a"), Subscriber::new(addr(1)));
        registry.subscribe(&key("svc-b"), Subscriber::new(addr(2)));
        registry.subscribe(&key("orders"), Subscriber::new(addr(3)));
        registry.subscribe(
            &ServiceKey::new("staging", "group-a", "svc-a"),
            Subscriber::new(addr(4)),
        );

        let wildcard = registry.get_subscribers_fuzzy("public", "group-a@@svc-*");
        assert_eq!(wildcard.len(), 2);
        assert_eq!(wildcard[0].0.name, "svc-a");

        let substring = registry.get_subscribers_fuzzy("public", "ord");
        assert_eq!(substring.len(), 1);
        assert_eq!(substring[0].1.addr, addr(3));

        assert!(registry.get_subscribers_fuzzy("public", "svc-*").is_empty(), "wildcards anchor");
        assert_eq!(registry.get_subscribers_fuzzy("public", "*svc-*").len(), 2);
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let registry = SubscriberRegistry::new();
        registry.subscribe(&key("svc.a"), Subscriber::new(addr(1)));
        registry.subscribe(&key("svcxa"), Subscriber::new(addr(2)));
        let matched = registry.get_subscribers_fuzzy("public", "*svc.a");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].0.name, "svc.a");
    }

    #[test]
    fn page_splits_subscribers() {
        let registry = SubscriberRegistry::new();
        for port in 1..=5 {
            registry.subscribe(&key("svc-a"), Subscriber::new(addr(port)));
        }
        let page = registry.page(&key("svc-a"), false, 2, 2);
        assert_eq!(page.count, 5);
        assert_eq!(page.list.len(), 2);
        assert_eq!(page.list[0].1.addr, addr(3));

        let fuzzy = registry.page(&ServiceKey::new("public", "group-a", "svc"), true, 1, 10);
        assert_eq!(fuzzy.count, 5);
    }
}
