//! Retained message store.
//!
//! At most one retained message per topic. A retained PUBLISH with an
//! empty payload clears the slot; a new subscription replays every
//! retained message whose topic matches the filter.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::registry::topic_matches;
use crate::types::Message;

#[derive(Default)]
pub struct RetainedStore {
    messages: RwLock<HashMap<String, Message>>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or clear the retained message for a topic.
    pub fn set(&self, message: Message) {
        let mut messages = self.messages.write();
        if message.payload.is_empty() {
            messages.remove(&message.topic);
        } else {
            messages.insert(message.topic.clone(), message);
        }
    }

    /// Retained messages matching a new subscription's filter.
    ///
    /// Replayed copies carry retain=1; the caller caps QoS at the
    /// granted level.
    pub fn matching(&self, filter: &str) -> Vec<Message> {
        self.messages
            .read()
            .values()
            .filter(|m| topic_matches(filter, &m.topic))
            .map(|m| m.clone().with_retain(true))
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.messages.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QoS;
    use bytes::Bytes;

    #[test]
    fn test_set_and_replace() {
        let store = RetainedStore::new();
        store.set(Message::new("a/b", Bytes::from_static(b"v1"), QoS::AtMostOnce));
        store.set(Message::new("a/b", Bytes::from_static(b"v2"), QoS::AtLeastOnce));

        let matched = store.matching("a/b");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].payload.as_ref(), b"v2");
        assert_eq!(matched[0].qos, QoS::AtLeastOnce);
        assert!(matched[0].retain);
    }

    #[test]
    fn test_empty_payload_clears() {
        let store = RetainedStore::new();
        store.set(Message::new("a/b", Bytes::from_static(b"v1"), QoS::AtMostOnce));
        assert_eq!(store.len(), 1);

        store.set(Message::new("a/b", Bytes::new(), QoS::AtMostOnce));
        assert_eq!(store.len(), 0);
        assert!(store.matching("a/b").is_empty());

        // Clearing an empty slot is a no-op.
        store.set(Message::new("a/b", Bytes::new(), QoS::AtMostOnce));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_wildcard_replay() {
        let store = RetainedStore::new();
        store.set(Message::new("sensors/kitchen/temp", Bytes::from_static(b"21"), QoS::AtMostOnce));
        store.set(Message::new("sensors/hall/temp", Bytes::from_static(b"19"), QoS::AtMostOnce));
        store.set(Message::new("status/up", Bytes::from_static(b"1"), QoS::AtMostOnce));

        assert_eq!(store.matching("sensors/+/temp").len(), 2);
        assert_eq!(store.matching("sensors/#").len(), 2);
        assert_eq!(store.matching("#").len(), 3);
        assert_eq!(store.matching("status/up").len(), 1);
    }
}
