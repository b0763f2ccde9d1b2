//! Session persistence.
//!
//! Persistent (CleanSession=0) session state survives a disconnect as a
//! `SessionSnapshot` stored through the `SessionStore` trait. Snapshots
//! serialize with the protocol's own length-prefixed primitives so any
//! byte-oriented backend can hold them; the in-memory store is the
//! default backend.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::protocol::codec::{read_string_slice, read_u16, write_string, write_u16};
use crate::types::QoS;

/// Durable state of a persistent session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Active subscriptions: filter and granted QoS.
    pub subscriptions: Vec<(String, QoS)>,
}

impl SessionSnapshot {
    /// Serialize: a u16 count, then (string filter, qos byte) pairs.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut size = 2;
        for (filter, _) in &self.subscriptions {
            size += 2 + filter.len() + 1;
        }

        let mut buf = vec![0u8; size];
        let count = u16::try_from(self.subscriptions.len())
            .map_err(|_| Error::Storage("too many subscriptions to snapshot".to_string()))?;
        write_u16(&mut buf, count)
            .ok_or_else(|| Error::Storage("snapshot buffer underflow".to_string()))?;
        let mut pos = 2;

        for (filter, qos) in &self.subscriptions {
            let n = write_string(&mut buf[pos..], filter)
                .ok_or_else(|| Error::Storage("snapshot buffer underflow".to_string()))?;
            pos += n;
            buf[pos] = *qos as u8;
            pos += 1;
        }

        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let count = read_u16(buf)
            .ok_or_else(|| Error::Storage("truncated snapshot".to_string()))? as usize;
        let mut pos = 2;

        let mut subscriptions = Vec::with_capacity(count);
        for _ in 0..count {
            let (filter, n) = read_string_slice(&buf[pos..])
                .map_err(|e| Error::Storage(format!("corrupt snapshot: {e}")))?;
            pos += n;

            let qos_byte = *buf
                .get(pos)
                .ok_or_else(|| Error::Storage("truncated snapshot".to_string()))?;
            let qos = QoS::from_u8(qos_byte)
                .map_err(|e| Error::Storage(format!("corrupt snapshot: {e}")))?;
            pos += 1;

            subscriptions.push((filter.to_string(), qos));
        }

        Ok(SessionSnapshot { subscriptions })
    }
}

/// Backend for persistent session snapshots, keyed by client id.
pub trait SessionStore: Send + Sync {
    /// Load a snapshot. `Ok(None)` means no prior session.
    fn load(&self, client_id: &str) -> Result<Option<SessionSnapshot>>;

    /// Store a snapshot, replacing any previous one.
    fn save(&self, client_id: &str, snapshot: &SessionSnapshot) -> Result<()>;

    /// Drop a stored snapshot (clean-session reconnect or takeover).
    fn remove(&self, client_id: &str) -> Result<()>;
}

/// A boxed session store for use in trait objects.
pub type BoxedSessionStore = Box<dyn SessionStore>;

/// In-memory session store backed by a HashMap.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn load(&self, client_id: &str) -> Result<Option<SessionSnapshot>> {
        let data = self.data.lock();
        match data.get(client_id) {
            Some(bytes) => Ok(Some(SessionSnapshot::decode(bytes)?)),
            None => Ok(None),
        }
    }

    fn save(&self, client_id: &str, snapshot: &SessionSnapshot) -> Result<()> {
        let bytes = snapshot.encode()?;
        self.data.lock().insert(client_id.to_string(), bytes);
        Ok(())
    }

    fn remove(&self, client_id: &str) -> Result<()> {
        self.data.lock().remove(client_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_roundtrip() {
        let snapshot = SessionSnapshot {
            subscriptions: vec![
                ("sensors/+/temp".to_string(), QoS::AtLeastOnce),
                ("status/#".to_string(), QoS::ExactlyOnce),
                ("plain/topic".to_string(), QoS::AtMostOnce),
            ],
        };

        let bytes = snapshot.encode().unwrap();
        let decoded = SessionSnapshot::decode(&bytes).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_snapshot_empty() {
        let snapshot = SessionSnapshot::default();
        let bytes = snapshot.encode().unwrap();
        assert_eq!(bytes, vec![0, 0]);
        assert_eq!(SessionSnapshot::decode(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn test_snapshot_decode_rejects_truncation() {
        let snapshot = SessionSnapshot {
            subscriptions: vec![("a/b".to_string(), QoS::AtLeastOnce)],
        };
        let bytes = snapshot.encode().unwrap();

        assert!(SessionSnapshot::decode(&bytes[..1]).is_err());
        assert!(SessionSnapshot::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.load("c1").unwrap().is_none());

        let snapshot = SessionSnapshot {
            subscriptions: vec![("a/#".to_string(), QoS::AtMostOnce)],
        };
        store.save("c1", &snapshot).unwrap();
        assert_eq!(store.load("c1").unwrap().unwrap(), snapshot);

        store.remove("c1").unwrap();
        assert!(store.load("c1").unwrap().is_none());
    }
}
