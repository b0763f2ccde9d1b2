//! Trie data structure for MQTT topic filter matching.
//!
//! Supports MQTT wildcards:
//! - `+` matches exactly one topic level
//! - `#` matches any number of remaining topic levels, including zero
//!   (must be last)
//!
//! A lookup walks every branch that can match, so a topic published to
//! `sensors/kitchen/temp` collects subscribers of `sensors/kitchen/temp`,
//! `sensors/+/temp` and `sensors/#` in one pass.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;

/// Trie node for MQTT topic filter matching.
pub struct TrieNode<T> {
    children: HashMap<String, TrieNode<T>>,
    match_any: Option<Box<TrieNode<T>>>, // + wildcard
    match_all: Option<Box<TrieNode<T>>>, // # wildcard
    values: Vec<T>,
}

impl<T> Default for TrieNode<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TrieNode<T> {
    /// Create a new empty trie node.
    pub fn new() -> Self {
        Self {
            children: HashMap::new(),
            match_any: None,
            match_all: None,
            values: Vec::new(),
        }
    }

    /// Insert a value at the given filter.
    pub fn insert(&mut self, filter: &str, value: T) -> Result<()> {
        if filter.is_empty() {
            return Err(Error::InvalidFilter("empty topic filter".to_string()));
        }
        self.insert_internal(filter, value)
    }

    fn insert_internal(&mut self, filter: &str, value: T) -> Result<()> {
        if filter.is_empty() {
            self.values.push(value);
            return Ok(());
        }

        let (first, subseq) = match filter.find('/') {
            None => (filter, ""),
            Some(idx) => (&filter[..idx], &filter[idx + 1..]),
        };

        match first {
            "+" => {
                let node = self.match_any.get_or_insert_with(|| Box::new(TrieNode::new()));
                node.insert_internal(subseq, value)
            }
            "#" => {
                if !subseq.is_empty() {
                    return Err(Error::InvalidFilter(
                        "# must be the last segment".to_string(),
                    ));
                }
                let node = self.match_all.get_or_insert_with(|| Box::new(TrieNode::new()));
                node.values.push(value);
                Ok(())
            }
            _ => {
                if first.contains(['+', '#']) {
                    return Err(Error::InvalidFilter(
                        "wildcard must occupy a whole level".to_string(),
                    ));
                }
                let child = self.children.entry(first.to_string()).or_default();
                child.insert_internal(subseq, value)
            }
        }
    }

    /// Collect values from every filter matching the topic.
    pub fn collect_matches(&self, topic: &str) -> Vec<&T> {
        let mut out = Vec::new();
        self.collect_internal(topic, true, &mut out);
        out
    }

    /// `at_root` gates the rule that topics starting with `$` never match
    /// a root-level wildcard.
    fn collect_internal<'a>(&'a self, topic: &str, at_root: bool, out: &mut Vec<&'a T>) {
        if topic.is_empty() {
            out.extend(self.values.iter());
            // "sport/#" matches "sport": the parent of the # node.
            if let Some(ref match_all) = self.match_all {
                out.extend(match_all.values.iter());
            }
            return;
        }

        let (first, subseq) = match topic.find('/') {
            None => (topic, ""),
            Some(idx) => (&topic[..idx], &topic[idx + 1..]),
        };

        let dollar_guard = at_root && first.starts_with('$');

        if let Some(ref match_all) = self.match_all {
            if !dollar_guard {
                out.extend(match_all.values.iter());
            }
        }

        if let Some(child) = self.children.get(first) {
            child.collect_internal(subseq, false, out);
        }

        if let Some(ref match_any) = self.match_any {
            if !dollar_guard {
                match_any.collect_internal(subseq, false, out);
            }
        }
    }

    /// Remove values matching the predicate from the given filter.
    ///
    /// Returns true when at least one value was removed.
    pub fn remove<F>(&mut self, filter: &str, predicate: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        if filter.is_empty() {
            let len_before = self.values.len();
            self.values.retain(|v| !predicate(v));
            return self.values.len() < len_before;
        }

        let (first, subseq) = match filter.find('/') {
            None => (filter, ""),
            Some(idx) => (&filter[..idx], &filter[idx + 1..]),
        };

        match first {
            "+" => {
                if let Some(ref mut match_any) = self.match_any {
                    return match_any.remove(subseq, predicate);
                }
            }
            "#" => {
                if let Some(ref mut match_all) = self.match_all {
                    let len_before = match_all.values.len();
                    match_all.values.retain(|v| !predicate(v));
                    return match_all.values.len() < len_before;
                }
            }
            _ => {
                if let Some(child) = self.children.get_mut(first) {
                    return child.remove(subseq, predicate);
                }
            }
        }

        false
    }
}

impl<T: fmt::Debug> fmt::Debug for TrieNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrieNode")
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .field("match_any", &self.match_any.is_some())
            .field("match_all", &self.match_all.is_some())
            .field("values", &self.values.len())
            .finish()
    }
}

/// Thread-safe trie for MQTT topic filter matching.
pub struct Trie<T> {
    root: RwLock<TrieNode<T>>,
}

impl<T> Default for Trie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Trie<T> {
    /// Create a new empty trie.
    pub fn new() -> Self {
        Self {
            root: RwLock::new(TrieNode::new()),
        }
    }

    /// Insert a value at the given filter.
    pub fn insert(&self, filter: &str, value: T) -> Result<()> {
        self.root.write().insert(filter, value)
    }

    /// Clone the values of every filter matching the topic.
    pub fn matches(&self, topic: &str) -> Vec<T>
    where
        T: Clone,
    {
        self.root
            .read()
            .collect_matches(topic)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Remove values matching the predicate from the given filter.
    pub fn remove<F>(&self, filter: &str, predicate: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        self.root.write().remove(filter, predicate)
    }
}

impl<T: fmt::Debug> fmt::Debug for Trie<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.root.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let trie: Trie<String> = Trie::new();
        trie.insert("sensors/kitchen/temp", "sub1".to_string()).unwrap();

        let values = trie.matches("sensors/kitchen/temp");
        assert_eq!(values, vec!["sub1".to_string()]);

        assert!(trie.matches("sensors/hall/temp").is_empty());
        assert!(trie.matches("sensors/kitchen").is_empty());
        assert!(trie.matches("sensors/kitchen/temp/extra").is_empty());
    }

    #[test]
    fn test_single_level_wildcard() {
        let trie: Trie<String> = Trie::new();
        trie.insert("sensors/+/temp", "plus".to_string()).unwrap();

        assert!(!trie.matches("sensors/kitchen/temp").is_empty());
        assert!(!trie.matches("sensors/hall/temp").is_empty());

        // + matches exactly one level.
        assert!(trie.matches("sensors/temp").is_empty());
        assert!(trie.matches("sensors/a/b/temp").is_empty());
    }

    #[test]
    fn test_multi_level_wildcard() {
        let trie: Trie<String> = Trie::new();
        trie.insert("sensors/#", "hash".to_string()).unwrap();

        assert!(!trie.matches("sensors/kitchen").is_empty());
        assert!(!trie.matches("sensors/kitchen/temp").is_empty());
        assert!(!trie.matches("sensors/a/b/c").is_empty());

        // # also matches zero levels.
        assert!(!trie.matches("sensors").is_empty());

        assert!(trie.matches("other/kitchen").is_empty());
    }

    #[test]
    fn test_hash_must_be_last() {
        let trie: Trie<String> = Trie::new();
        assert!(trie.insert("sensors/#/temp", "bad".to_string()).is_err());
        assert!(trie.insert("", "bad".to_string()).is_err());
        assert!(trie.insert("sen+sors/temp", "bad".to_string()).is_err());
    }

    #[test]
    fn test_overlapping_filters_all_collected() {
        let trie: Trie<String> = Trie::new();
        trie.insert("sensors/kitchen/temp", "exact".to_string()).unwrap();
        trie.insert("sensors/+/temp", "plus".to_string()).unwrap();
        trie.insert("sensors/#", "hash".to_string()).unwrap();
        trie.insert("#", "all".to_string()).unwrap();

        let mut values = trie.matches("sensors/kitchen/temp");
        values.sort();
        assert_eq!(values, vec!["all", "exact", "hash", "plus"]);
    }

    #[test]
    fn test_dollar_topics_skip_root_wildcards() {
        let trie: Trie<String> = Trie::new();
        trie.insert("#", "all".to_string()).unwrap();
        trie.insert("+/status", "plus".to_string()).unwrap();
        trie.insert("$internal/status", "explicit".to_string()).unwrap();
        trie.insert("$internal/+", "inner_plus".to_string()).unwrap();

        // Root-level wildcards never see $ topics.
        let mut values = trie.matches("$internal/status");
        values.sort();
        assert_eq!(values, vec!["explicit", "inner_plus"]);

        // Normal topics still hit the root wildcards.
        let mut values = trie.matches("device/status");
        values.sort();
        assert_eq!(values, vec!["all", "plus"]);
    }

    #[test]
    fn test_remove() {
        let trie: Trie<String> = Trie::new();
        trie.insert("sensors/+/temp", "sub1".to_string()).unwrap();
        trie.insert("sensors/+/temp", "sub2".to_string()).unwrap();

        assert_eq!(trie.matches("sensors/a/temp").len(), 2);

        assert!(trie.remove("sensors/+/temp", |v| v == "sub1"));
        assert_eq!(trie.matches("sensors/a/temp"), vec!["sub2".to_string()]);

        // Removing again finds nothing.
        assert!(!trie.remove("sensors/+/temp", |v| v == "sub1"));
    }

    #[test]
    fn test_duplicate_values_across_filters() {
        // One client subscribed twice shows up once per filter; each
        // match triggers its own delivery.
        let trie: Trie<String> = Trie::new();
        trie.insert("a/#", "c1".to_string()).unwrap();
        trie.insert("a/b", "c1".to_string()).unwrap();

        assert_eq!(trie.matches("a/b").len(), 2);
    }
}
