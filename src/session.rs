//! Session lifecycle and delivery routing.
//!
//! Every client id maps to at most one `Session`. A session owns the
//! QoS in-flight table, the queue of messages that arrived while a
//! persistent client was offline, and (when connected) the sender half
//! of the connection's outgoing channel.
//!
//! Reconnecting with an id that is already connected takes the session
//! over: the old connection is told to shut down and an epoch counter
//! keeps its teardown from touching state the new connection now owns.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::inflight::Inflight;
use crate::storage::{BoxedSessionStore, SessionSnapshot};
use crate::types::{Message, QoS, validate_client_id};

/// Messages pushed to a connection's writer side.
#[derive(Debug)]
pub enum Outgoing {
    /// Deliver an application message (pkid assigned at send time).
    Publish(Message),
    /// Another connection took this client id over; exit without cleanup.
    Shutdown,
}

/// Per-client state that outlives a single network connection.
pub struct Session {
    pub client_id: String,
    pub clean: bool,
    pub inflight: Inflight,
    /// QoS >= 1 messages waiting for a persistent client to reconnect.
    pending: VecDeque<Message>,
    sender: Option<mpsc::Sender<Outgoing>>,
    /// Issued fresh on every (re)connect, unique across the manager so
    /// a replacement session can never reuse an epoch a superseded
    /// connection still holds; teardown is a no-op unless the caller's
    /// epoch still matches.
    epoch: u64,
}

impl Session {
    fn new(client_id: String, clean: bool) -> Self {
        Self {
            client_id,
            clean,
            inflight: Inflight::new(),
            pending: VecDeque::new(),
            sender: None,
            epoch: 0,
        }
    }

    /// Drain messages queued while the client was offline.
    pub fn take_pending(&mut self) -> Vec<Message> {
        self.pending.drain(..).collect()
    }

    fn queue_pending(&mut self, message: Message, max_pending: usize) {
        if self.pending.len() >= max_pending {
            warn!(
                client_id = %self.client_id,
                "offline queue full, dropping oldest message"
            );
            self.pending.pop_front();
        }
        self.pending.push_back(message);
    }
}

/// A freshly opened (or resumed) session, handed to the connection loop.
pub struct OpenedSession {
    pub client_id: String,
    pub session: Arc<Mutex<Session>>,
    /// SessionPresent bit for the CONNACK.
    pub session_present: bool,
    pub epoch: u64,
    pub rx: mpsc::Receiver<Outgoing>,
    /// Subscriptions restored from a stored snapshot; the caller
    /// re-registers them before serving traffic.
    pub resumed_subscriptions: Vec<(String, QoS)>,
}

/// Outcome of closing a connection's hold on a session.
#[derive(Debug, PartialEq, Eq)]
pub enum Teardown {
    /// Clean session removed; the caller drops its subscriptions too.
    Removed,
    /// Persistent session kept for a future reconnect.
    Persisted,
    /// A takeover already replaced this connection; nothing to do.
    Superseded,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    store: BoxedSessionStore,
    assigned_ids: AtomicU64,
    epochs: AtomicU64,
    /// Cap on per-session offline queue length.
    max_pending: usize,
    /// Outgoing channel capacity per connection.
    channel_capacity: usize,
}

impl SessionManager {
    pub fn new(store: BoxedSessionStore, max_pending: usize, channel_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            assigned_ids: AtomicU64::new(0),
            epochs: AtomicU64::new(0),
            max_pending,
            channel_capacity,
        }
    }

    /// Generate a server-assigned client id (23 alphanumeric chars).
    fn assign_client_id(&self) -> String {
        let n = self.assigned_ids.fetch_add(1, Ordering::Relaxed);
        format!("mammoth{n:016x}")
    }

    /// Open a session for a CONNECT.
    ///
    /// Resolves the client id (assigning one for an empty id with
    /// CleanSession=1), computes the SessionPresent bit, and signals a
    /// takeover to any connection already holding the id. Errors map to
    /// CONNACK return code 2 (identifier rejected).
    pub fn open(&self, client_id: &str, clean: bool) -> Result<OpenedSession> {
        let client_id = if client_id.is_empty() {
            // An empty id only works for a session the server cannot be
            // asked to resume later (MQTT-3.1.3-7).
            if !clean {
                return Err(Error::InvalidClientId);
            }
            self.assign_client_id()
        } else {
            validate_client_id(client_id)?;
            client_id.to_string()
        };

        let mut sessions = self.sessions.write();

        let mut session_present = false;
        let mut resumed_subscriptions = Vec::new();

        let session = if clean {
            // Clean start: discard any prior state.
            if let Some(old) = sessions.remove(&client_id) {
                Self::signal_shutdown(&old);
            }
            if let Err(e) = self.store.remove(&client_id) {
                warn!(client_id = %client_id, error = %e, "failed to drop stored session");
            }
            let session = Arc::new(Mutex::new(Session::new(client_id.clone(), true)));
            sessions.insert(client_id.clone(), Arc::clone(&session));
            session
        } else if let Some(existing) = sessions.get(&client_id) {
            // Resume the live session (possibly taking it over).
            Self::signal_shutdown(existing);
            session_present = true;
            {
                let mut s = existing.lock();
                s.clean = false;
            }
            Arc::clone(existing)
        } else {
            // No live session; a stored snapshot still counts as present.
            match self.store.load(&client_id) {
                Ok(Some(snapshot)) => {
                    session_present = true;
                    resumed_subscriptions = snapshot.subscriptions;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(client_id = %client_id, error = %e, "failed to load stored session");
                }
            }
            let session = Arc::new(Mutex::new(Session::new(client_id.clone(), false)));
            sessions.insert(client_id.clone(), Arc::clone(&session));
            session
        };

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut s = session.lock();
            s.sender = Some(tx);
            s.epoch = epoch;
        }

        Ok(OpenedSession {
            client_id,
            session,
            session_present,
            epoch,
            rx,
            resumed_subscriptions,
        })
    }

    fn signal_shutdown(session: &Arc<Mutex<Session>>) {
        let mut s = session.lock();
        if let Some(tx) = s.sender.take() {
            debug!(client_id = %s.client_id, "session taken over by new connection");
            let _ = tx.try_send(Outgoing::Shutdown);
        }
    }

    /// Route one message to a client: over the live channel when
    /// connected, into the offline queue for a persistent client, or
    /// dropped otherwise.
    pub fn deliver(&self, client_id: &str, message: Message) {
        let session = {
            let sessions = self.sessions.read();
            sessions.get(client_id).cloned()
        };
        let Some(session) = session else {
            return;
        };

        let mut s = session.lock();
        let Some(tx) = s.sender.clone() else {
            if !s.clean && message.qos > QoS::AtMostOnce {
                s.queue_pending(message, self.max_pending);
            }
            return;
        };

        match tx.try_send(Outgoing::Publish(message)) {
            Ok(()) => {}
            Err(TrySendError::Full(Outgoing::Publish(message))) => {
                // Slow consumer. QoS 0 is droppable; queue the rest for
                // persistent sessions so the handshake can restart later.
                warn!(client_id = %client_id, "outgoing channel full");
                if !s.clean && message.qos > QoS::AtMostOnce {
                    s.queue_pending(message, self.max_pending);
                }
            }
            Err(TrySendError::Closed(Outgoing::Publish(message))) => {
                s.sender = None;
                if !s.clean && message.qos > QoS::AtMostOnce {
                    s.queue_pending(message, self.max_pending);
                }
            }
            Err(_) => {}
        }
    }

    /// Release a connection's hold on its session.
    ///
    /// `subscriptions` is the client's current filter set, snapshotted
    /// for persistent sessions. The epoch guard makes this a no-op when
    /// a takeover already happened.
    pub fn close(
        &self,
        client_id: &str,
        epoch: u64,
        subscriptions: Vec<(String, QoS)>,
    ) -> Teardown {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get(client_id) else {
            return Teardown::Superseded;
        };

        {
            let mut s = session.lock();
            if s.epoch != epoch {
                return Teardown::Superseded;
            }
            s.sender = None;

            if !s.clean {
                drop(s);
                let snapshot = SessionSnapshot { subscriptions };
                if let Err(e) = self.store.save(client_id, &snapshot) {
                    warn!(client_id = %client_id, error = %e, "failed to store session");
                }
                return Teardown::Persisted;
            }
        }

        sessions.remove(client_id);
        if let Err(e) = self.store.remove(client_id) {
            warn!(client_id = %client_id, error = %e, "failed to drop stored session");
        }
        Teardown::Removed
    }

    /// Look up the live session for a client id.
    pub fn get(&self, client_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().get(client_id).cloned()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.sessions.read().len()
    }
}
