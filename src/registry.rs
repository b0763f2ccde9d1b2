//! Subscription registry: maps topic filters to subscribed sessions.
//!
//! Built on the wildcard trie; also keeps a per-client view of active
//! filters so a session teardown can drop everything the client had.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::trie::Trie;
use crate::types::QoS;

/// One subscription as stored in the trie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub client_id: String,
    pub qos: QoS,
}

/// Check topic filter syntax: `+` must occupy a whole level, `#` must
/// occupy the whole last level.
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "+" => {}
            "#" => {
                if levels.peek().is_some() {
                    return false;
                }
            }
            other => {
                if other.contains(['+', '#']) {
                    return false;
                }
            }
        }
    }

    true
}

/// Check whether a single filter matches a topic name.
///
/// Used for retained-message replay, where the lookup direction is
/// reversed: one new filter against many stored topics.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // $ topics never match a filter starting with a wildcard.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // "#" matches the rest, including zero levels: "sport/#"
            // matches "sport".
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Registry of live subscriptions across all sessions.
#[derive(Default)]
pub struct SubscriptionRegistry {
    trie: Trie<SubscriptionEntry>,
    /// client id -> filter -> granted QoS.
    by_client: RwLock<HashMap<String, HashMap<String, QoS>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a subscription, returning the granted QoS.
    ///
    /// Re-subscribing to an existing filter replaces the granted QoS
    /// without duplicating delivery.
    pub fn subscribe(&self, client_id: &str, filter: &str, qos: QoS) -> Result<QoS> {
        if !valid_filter(filter) {
            return Err(Error::InvalidFilter(filter.to_string()));
        }

        let mut by_client = self.by_client.write();
        let filters = by_client.entry(client_id.to_string()).or_default();

        if filters.insert(filter.to_string(), qos).is_some() {
            self.trie.remove(filter, |e| e.client_id == client_id);
        }
        self.trie.insert(
            filter,
            SubscriptionEntry { client_id: client_id.to_string(), qos },
        )?;

        Ok(qos)
    }

    /// Remove one subscription. Returns true if it existed.
    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        let mut by_client = self.by_client.write();
        let Some(filters) = by_client.get_mut(client_id) else {
            return false;
        };

        if filters.remove(filter).is_none() {
            return false;
        }
        if filters.is_empty() {
            by_client.remove(client_id);
        }

        self.trie.remove(filter, |e| e.client_id == client_id)
    }

    /// Drop every subscription a client holds (session teardown).
    pub fn remove_client(&self, client_id: &str) {
        let mut by_client = self.by_client.write();
        if let Some(filters) = by_client.remove(client_id) {
            for filter in filters.keys() {
                self.trie.remove(filter, |e| e.client_id == client_id);
            }
        }
    }

    /// All subscriptions matching a published topic, one entry per
    /// matching filter.
    ///
    /// A client with several overlapping filters gets one entry per
    /// filter, each at its own granted QoS; every one triggers an
    /// independent delivery.
    pub fn matches(&self, topic: &str) -> Vec<SubscriptionEntry> {
        self.trie.matches(topic)
    }

    /// Snapshot of a client's filters and granted QoS.
    pub fn client_subscriptions(&self, client_id: &str) -> Vec<(String, QoS)> {
        self.by_client
            .read()
            .get(client_id)
            .map(|filters| filters.iter().map(|(f, q)| (f.clone(), *q)).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_filter() {
        assert!(valid_filter("a/b/c"));
        assert!(valid_filter("+"));
        assert!(valid_filter("#"));
        assert!(valid_filter("a/+/c"));
        assert!(valid_filter("a/b/#"));
        assert!(valid_filter("+/+/#"));
        assert!(valid_filter("a//b")); // empty levels are legal

        assert!(!valid_filter(""));
        assert!(!valid_filter("a/#/c"));
        assert!(!valid_filter("a/b+"));
        assert!(!valid_filter("a/#b"));
        assert!(!valid_filter("sport/tennis#"));
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("sport/tennis/+", "sport/tennis/player1"));
        assert!(!topic_matches("sport/tennis/+", "sport/tennis/player1/ranking"));
        assert!(topic_matches("sport/#", "sport"));
        assert!(topic_matches("#", "a/b/c"));
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/c"));
        assert!(!topic_matches("+", "a/b"));

        // $ topics and root wildcards.
        assert!(!topic_matches("#", "$internal/stats"));
        assert!(!topic_matches("+/stats", "$internal/stats"));
        assert!(topic_matches("$internal/#", "$internal/stats"));
    }

    #[test]
    fn test_subscribe_and_match() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("c1", "sensors/+/temp", QoS::AtLeastOnce).unwrap();
        registry.subscribe("c2", "sensors/#", QoS::AtMostOnce).unwrap();

        let mut matched = registry.matches("sensors/kitchen/temp");
        matched.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].client_id, "c1");
        assert_eq!(matched[0].qos, QoS::AtLeastOnce);
        assert_eq!(matched[1].client_id, "c2");
        assert_eq!(matched[1].qos, QoS::AtMostOnce);
    }

    #[test]
    fn test_resubscribe_replaces_qos() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("c1", "a/b", QoS::AtMostOnce).unwrap();
        registry.subscribe("c1", "a/b", QoS::ExactlyOnce).unwrap();

        let matched = registry.matches("a/b");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_overlapping_filters_match_independently() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("c1", "a/b", QoS::AtMostOnce).unwrap();
        registry.subscribe("c1", "a/#", QoS::ExactlyOnce).unwrap();

        // Each matching filter is its own entry at its own granted QoS.
        let mut matched = registry.matches("a/b");
        matched.sort_by_key(|e| e.qos);
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].qos, QoS::AtMostOnce);
        assert_eq!(matched[1].qos, QoS::ExactlyOnce);
        assert!(matched.iter().all(|e| e.client_id == "c1"));
    }

    #[test]
    fn test_unsubscribe() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("c1", "a/b", QoS::AtMostOnce).unwrap();

        assert!(registry.unsubscribe("c1", "a/b"));
        assert!(registry.matches("a/b").is_empty());

        // Unknown filter or client is a no-op.
        assert!(!registry.unsubscribe("c1", "a/b"));
        assert!(!registry.unsubscribe("nobody", "a/b"));
    }

    #[test]
    fn test_remove_client_drops_all_filters() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("c1", "a/b", QoS::AtMostOnce).unwrap();
        registry.subscribe("c1", "c/#", QoS::AtLeastOnce).unwrap();
        registry.subscribe("c2", "a/b", QoS::AtMostOnce).unwrap();

        registry.remove_client("c1");
        let matched = registry.matches("a/b");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].client_id, "c2");
        assert!(registry.matches("c/d").is_empty());
        assert!(registry.client_subscriptions("c1").is_empty());
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let registry = SubscriptionRegistry::new();
        assert!(matches!(
            registry.subscribe("c1", "a/#/b", QoS::AtMostOnce),
            Err(Error::InvalidFilter(_))
        ));
    }
}
