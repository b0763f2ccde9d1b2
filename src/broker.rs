//! MQTT 3.1.1 broker.
//!
//! One task per connection: a select loop multiplexes inbound packets,
//! the session's outgoing channel and a retransmission tick, bounded by
//! the keep-alive deadline. Routing state (subscription registry,
//! retained store, session manager) is shared behind `Arc`.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::inflight::Retransmit;
use crate::protocol::{self, MAX_PACKET_SIZE, Packet, v4};
use crate::registry::SubscriptionRegistry;
use crate::retained::RetainedStore;
use crate::session::{OpenedSession, Outgoing, SessionManager, Teardown};
use crate::storage::{BoxedSessionStore, MemoryStore};
use crate::types::{AllowAll, Authenticator, ConnectReturnCode, Message, QoS};

/// Default per-session offline queue length.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Default outgoing channel capacity per connection.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Callback type alias.
type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Listen address (host:port).
    pub addr: String,
    /// Maximum packet size.
    pub max_packet_size: usize,
    /// Base interval before an unacknowledged QoS packet is resent;
    /// doubles per retry.
    pub retry_interval: Duration,
    /// Retries before an in-flight delivery is abandoned.
    pub max_retries: u32,
    /// Messages queued per offline persistent session.
    pub max_pending: usize,
}

impl BrokerConfig {
    /// Create a new broker config.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_packet_size: MAX_PACKET_SIZE,
            retry_interval: Duration::from_secs(5),
            max_retries: 3,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    /// Set the QoS retransmission base interval.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the retry ceiling for in-flight deliveries.
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }
}

/// Builder for Broker.
pub struct BrokerBuilder {
    config: BrokerConfig,
    store: Option<BoxedSessionStore>,
    authenticator: Option<Arc<dyn Authenticator>>,
    on_connect: Option<Callback>,
    on_disconnect: Option<Callback>,
}

impl BrokerBuilder {
    /// Create a new broker builder.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            store: None,
            authenticator: None,
            on_connect: None,
            on_disconnect: None,
        }
    }

    /// Set the persistent session store.
    pub fn store(mut self, store: BoxedSessionStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the authenticator.
    pub fn authenticator<A: Authenticator + 'static>(mut self, auth: A) -> Self {
        self.authenticator = Some(Arc::new(auth));
        self
    }

    /// Set the on_connect callback.
    pub fn on_connect<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Set the on_disconnect callback.
    pub fn on_disconnect<F: Fn(&str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Build the broker.
    pub fn build(self) -> Broker {
        let store = self.store.unwrap_or_else(|| Box::new(MemoryStore::new()));
        let sessions = SessionManager::new(
            store,
            self.config.max_pending,
            DEFAULT_CHANNEL_CAPACITY,
        );

        Broker {
            config: self.config,
            authenticator: self.authenticator.unwrap_or_else(|| Arc::new(AllowAll)),
            on_connect: self.on_connect,
            on_disconnect: self.on_disconnect,
            sessions: Arc::new(sessions),
            registry: Arc::new(SubscriptionRegistry::new()),
            retained: Arc::new(RetainedStore::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// MQTT 3.1.1 broker with QoS 0/1/2 delivery, retained messages and
/// persistent sessions.
pub struct Broker {
    config: BrokerConfig,
    authenticator: Arc<dyn Authenticator>,
    on_connect: Option<Callback>,
    on_disconnect: Option<Callback>,
    sessions: Arc<SessionManager>,
    registry: Arc<SubscriptionRegistry>,
    retained: Arc<RetainedStore>,
    running: Arc<AtomicBool>,
}

impl Broker {
    /// Create a new broker with the given config.
    pub fn new(config: BrokerConfig) -> Self {
        BrokerBuilder::new(config).build()
    }

    /// Create a builder for this broker.
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    /// Start the broker.
    pub async fn serve(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.config.addr).await?;
        info!("broker listening on {}", self.config.addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("accepted connection from {}", addr);

            let ctx = self.context();
            tokio::spawn(async move {
                if let Err(e) = ctx.handle_connection(stream, addr).await {
                    debug!("connection error: {}", e);
                }
            });
        }
    }

    /// Publish a message from the broker itself.
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        let msg = Message::new(
            topic.to_string(),
            bytes::Bytes::copy_from_slice(payload),
            qos,
        )
        .with_retain(retain);
        self.context().route(msg);
    }

    fn context(&self) -> BrokerContext {
        BrokerContext {
            authenticator: Arc::clone(&self.authenticator),
            on_connect: self.on_connect.clone(),
            on_disconnect: self.on_disconnect.clone(),
            sessions: Arc::clone(&self.sessions),
            registry: Arc::clone(&self.registry),
            retained: Arc::clone(&self.retained),
            max_packet_size: self.config.max_packet_size,
            retry_interval: self.config.retry_interval,
            max_retries: self.config.max_retries,
        }
    }
}

/// How a client loop ended.
enum LoopExit {
    /// Client sent DISCONNECT; the will is discarded.
    Graceful,
    /// A new connection took the client id over.
    Takeover,
}

/// Internal broker context for handling connections.
struct BrokerContext {
    authenticator: Arc<dyn Authenticator>,
    on_connect: Option<Callback>,
    on_disconnect: Option<Callback>,
    sessions: Arc<SessionManager>,
    registry: Arc<SubscriptionRegistry>,
    retained: Arc<RetainedStore>,
    max_packet_size: usize,
    retry_interval: Duration,
    max_retries: u32,
}

impl BrokerContext {
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(4096);

        let packet =
            match protocol::read_packet(&mut reader, &mut read_buf, self.max_packet_size).await {
                Ok(packet) => packet,
                Err(Error::InvalidProtocolLevel(level)) => {
                    // Answer before closing so the client learns why.
                    warn!("client at {} requested protocol level {}", addr, level);
                    let connack = v4::ConnAck::new(
                        ConnectReturnCode::UnacceptableProtocolVersion,
                        false,
                    );
                    protocol::write_packet(&mut writer, &Packet::ConnAck(connack)).await?;
                    return Err(Error::InvalidProtocolLevel(level));
                }
                Err(e) => return Err(e),
            };

        let Packet::Connect(connect) = packet else {
            return Err(Error::ProtocolViolation("first packet must be CONNECT"));
        };

        let username = connect.username.as_deref().unwrap_or("");
        let password = connect.password.as_deref().unwrap_or(&[]);
        if !self.authenticator.authenticate(&connect.client_id, username, password) {
            warn!("authentication failed for {:?}", connect.client_id);
            let connack = v4::ConnAck::new(ConnectReturnCode::NotAuthorized, false);
            protocol::write_packet(&mut writer, &Packet::ConnAck(connack)).await?;
            return Ok(());
        }

        let opened = match self.sessions.open(&connect.client_id, connect.clean_session) {
            Ok(opened) => opened,
            Err(Error::InvalidClientId) => {
                let connack = v4::ConnAck::new(ConnectReturnCode::IdentifierRejected, false);
                protocol::write_packet(&mut writer, &Packet::ConnAck(connack)).await?;
                return Err(Error::InvalidClientId);
            }
            Err(e) => return Err(e),
        };

        // A clean start discards whatever subscriptions a prior session
        // with this id left behind.
        if connect.clean_session {
            self.registry.remove_client(&opened.client_id);
        }

        let connack = v4::ConnAck::new(ConnectReturnCode::Accepted, opened.session_present);
        protocol::write_packet(&mut writer, &Packet::ConnAck(connack)).await?;

        // Subscriptions restored from a stored snapshot go back into the
        // registry before any traffic flows.
        for (filter, qos) in &opened.resumed_subscriptions {
            if let Err(e) = self.registry.subscribe(&opened.client_id, filter, *qos) {
                warn!(
                    client_id = %opened.client_id,
                    filter = %filter,
                    "failed to restore subscription: {}", e
                );
            }
        }

        if let Some(ref on_connect) = self.on_connect {
            on_connect(&opened.client_id);
        }
        info!(
            client_id = %opened.client_id,
            clean_session = connect.clean_session,
            keep_alive = connect.keep_alive,
            "client connected"
        );

        let client_id = opened.client_id.clone();
        let epoch = opened.epoch;
        let will = connect.will.clone();

        let result = self
            .client_loop(opened, connect.keep_alive, reader, writer, read_buf)
            .await;

        let graceful = matches!(result, Ok(LoopExit::Graceful));
        if !graceful {
            // Abnormal drop or takeover: the will fires.
            if let Some(will) = will {
                debug!(client_id = %client_id, topic = %will.topic, "publishing will");
                let msg = Message::new(will.topic, will.payload, will.qos)
                    .with_retain(will.retain);
                self.route(msg);
            }
        }

        let teardown = self.sessions.close(
            &client_id,
            epoch,
            self.registry.client_subscriptions(&client_id),
        );
        match teardown {
            Teardown::Removed => self.registry.remove_client(&client_id),
            Teardown::Persisted => {}
            // The new connection owns the registry entries now.
            Teardown::Superseded => {}
        }

        if teardown != Teardown::Superseded {
            if let Some(ref on_disconnect) = self.on_disconnect {
                on_disconnect(&client_id);
            }
            info!(client_id = %client_id, "client disconnected");
        }

        result.map(|_| ())
    }

    async fn client_loop(
        &self,
        opened: OpenedSession,
        keep_alive: u16,
        mut reader: ReadHalf<TcpStream>,
        mut writer: WriteHalf<TcpStream>,
        mut read_buf: BytesMut,
    ) -> Result<LoopExit> {
        let OpenedSession { client_id, session, mut rx, .. } = opened;

        // MQTT-3.1.2-24: disconnect after 1.5 x keep_alive without a packet.
        // keep_alive 0 disables the timer.
        let keepalive_window = (keep_alive > 0)
            .then(|| Duration::from_secs((keep_alive as u64 * 3) / 2));
        let mut inbound_deadline =
            keepalive_window.map(|w| Instant::now() + w).unwrap_or_else(far_future);

        // Messages queued while the client was offline restart delivery.
        let pending = session.lock().take_pending();
        for msg in pending {
            self.send_publish(&mut writer, &session, msg, false).await?;
        }

        let mut retry_tick = tokio::time::interval(Duration::from_secs(1));
        retry_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(Outgoing::Publish(msg)) => {
                            self.send_publish(&mut writer, &session, msg, false).await?;
                        }
                        Some(Outgoing::Shutdown) | None => {
                            debug!(client_id = %client_id, "connection superseded");
                            return Ok(LoopExit::Takeover);
                        }
                    }
                }

                result = protocol::read_packet(&mut reader, &mut read_buf, self.max_packet_size) => {
                    let packet = result?;
                    if let Some(w) = keepalive_window {
                        inbound_deadline = Instant::now() + w;
                    }

                    match packet {
                        Packet::Publish(publish) => {
                            self.handle_publish(&client_id, &session, &mut writer, publish).await?;
                        }
                        Packet::PubAck(ack) => {
                            if !session.lock().inflight.on_puback(ack.pkid) {
                                warn!(client_id = %client_id, pkid = ack.pkid, "unexpected PUBACK");
                            }
                        }
                        Packet::PubRec(rec) => {
                            if session.lock().inflight.on_pubrec(rec.pkid, Instant::now().into_std()) {
                                let pubrel = Packet::PubRel(v4::PubRel { pkid: rec.pkid });
                                protocol::write_packet(&mut writer, &pubrel).await?;
                            } else {
                                warn!(client_id = %client_id, pkid = rec.pkid, "unexpected PUBREC");
                            }
                        }
                        Packet::PubRel(rel) => {
                            // Exactly-once release point for an inbound QoS 2
                            // publish. A repeated PUBREL still gets PUBCOMP.
                            let released = session.lock().inflight.release_incoming(rel.pkid);
                            if let Some(msg) = released {
                                self.route(msg);
                            }
                            let pubcomp = Packet::PubComp(v4::PubComp { pkid: rel.pkid });
                            protocol::write_packet(&mut writer, &pubcomp).await?;
                        }
                        Packet::PubComp(comp) => {
                            if !session.lock().inflight.on_pubcomp(comp.pkid) {
                                warn!(client_id = %client_id, pkid = comp.pkid, "unexpected PUBCOMP");
                            }
                        }
                        Packet::Subscribe(subscribe) => {
                            self.handle_subscribe(&client_id, &session, &mut writer, subscribe).await?;
                        }
                        Packet::Unsubscribe(unsubscribe) => {
                            for topic in &unsubscribe.topics {
                                if self.registry.unsubscribe(&client_id, topic) {
                                    debug!(client_id = %client_id, filter = %topic, "unsubscribed");
                                }
                            }
                            let unsuback = Packet::UnsubAck(v4::UnsubAck { pkid: unsubscribe.pkid });
                            protocol::write_packet(&mut writer, &unsuback).await?;
                        }
                        Packet::PingReq => {
                            trace!(client_id = %client_id, "ping");
                            protocol::write_packet(&mut writer, &Packet::PingResp).await?;
                        }
                        Packet::Disconnect => {
                            return Ok(LoopExit::Graceful);
                        }
                        Packet::Connect(_) => {
                            return Err(Error::ProtocolViolation("duplicate CONNECT"));
                        }
                        Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                            return Err(Error::ProtocolViolation("server-only packet from client"));
                        }
                    }
                }

                _ = retry_tick.tick() => {
                    let (retransmits, expired) = session.lock().inflight.due(
                        std::time::Instant::now(),
                        self.retry_interval,
                        self.max_retries,
                    );
                    for pkid in expired {
                        warn!(client_id = %client_id, pkid, "delivery abandoned after retries");
                    }
                    for retransmit in retransmits {
                        match retransmit {
                            Retransmit::Publish { pkid, message } => {
                                debug!(client_id = %client_id, pkid, "retransmitting PUBLISH");
                                let publish = v4::Publish {
                                    topic: message.topic,
                                    payload: message.payload,
                                    qos: message.qos,
                                    retain: message.retain,
                                    dup: true,
                                    pkid,
                                };
                                protocol::write_packet(&mut writer, &Packet::Publish(publish)).await?;
                            }
                            Retransmit::PubRel { pkid } => {
                                debug!(client_id = %client_id, pkid, "retransmitting PUBREL");
                                let pubrel = Packet::PubRel(v4::PubRel { pkid });
                                protocol::write_packet(&mut writer, &pubrel).await?;
                            }
                        }
                    }
                }

                _ = tokio::time::sleep_until(inbound_deadline) => {
                    warn!(client_id = %client_id, keep_alive, "keep-alive expired");
                    return Err(Error::KeepAliveExpired);
                }
            }
        }
    }

    /// An inbound PUBLISH, per its QoS.
    async fn handle_publish(
        &self,
        client_id: &str,
        session: &Arc<parking_lot::Mutex<crate::session::Session>>,
        writer: &mut WriteHalf<TcpStream>,
        publish: v4::Publish,
    ) -> Result<()> {
        trace!(client_id = %client_id, topic = %publish.topic, qos = ?publish.qos, "publish");

        let msg = Message::new(publish.topic, publish.payload, publish.qos)
            .with_retain(publish.retain);

        match publish.qos {
            QoS::AtMostOnce => {
                self.route(msg);
            }
            QoS::AtLeastOnce => {
                // Route before acknowledging: PUBACK states the broker has
                // taken responsibility for the message.
                self.route(msg);
                let puback = Packet::PubAck(v4::PubAck { pkid: publish.pkid });
                protocol::write_packet(writer, &puback).await?;
            }
            QoS::ExactlyOnce => {
                // Park until PUBREL; a dup of a known pkid is not re-stored,
                // so the message routes once no matter how often the PUBLISH
                // is retransmitted.
                session.lock().inflight.store_incoming(publish.pkid, msg);
                let pubrec = Packet::PubRec(v4::PubRec { pkid: publish.pkid });
                protocol::write_packet(writer, &pubrec).await?;
            }
        }

        Ok(())
    }

    async fn handle_subscribe(
        &self,
        client_id: &str,
        session: &Arc<parking_lot::Mutex<crate::session::Session>>,
        writer: &mut WriteHalf<TcpStream>,
        subscribe: v4::Subscribe,
    ) -> Result<()> {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut granted = Vec::new();

        for filter in &subscribe.filters {
            match self.registry.subscribe(client_id, &filter.path, filter.qos) {
                Ok(qos) => {
                    debug!(client_id = %client_id, filter = %filter.path, qos = ?qos, "subscribed");
                    return_codes.push(v4::SubscribeReturnCode::Success(qos));
                    granted.push((filter.path.clone(), qos));
                }
                Err(e) => {
                    warn!(client_id = %client_id, filter = %filter.path, "subscribe rejected: {}", e);
                    return_codes.push(v4::SubscribeReturnCode::Failure);
                }
            }
        }

        let suback = Packet::SubAck(v4::SubAck { pkid: subscribe.pkid, return_codes });
        protocol::write_packet(writer, &suback).await?;

        // Retained replay after the SUBACK, one copy per granted filter,
        // capped at the granted QoS.
        for (filter, granted_qos) in granted {
            for mut msg in self.retained.matching(&filter) {
                msg.qos = msg.qos.min(granted_qos);
                self.send_publish(writer, session, msg, true).await?;
            }
        }

        Ok(())
    }

    /// Write one PUBLISH to this connection, registering QoS state.
    async fn send_publish(
        &self,
        writer: &mut WriteHalf<TcpStream>,
        session: &Arc<parking_lot::Mutex<crate::session::Session>>,
        msg: Message,
        retain: bool,
    ) -> Result<()> {
        let pkid = if msg.qos == QoS::AtMostOnce {
            0
        } else {
            let mut s = session.lock();
            let Some(pkid) = s.inflight.alloc_pkid() else {
                warn!(client_id = %s.client_id, "no free packet ids, dropping message");
                return Ok(());
            };
            match msg.qos {
                QoS::AtLeastOnce => s.inflight.sent_qos1(pkid, msg.clone(), std::time::Instant::now()),
                QoS::ExactlyOnce => s.inflight.sent_qos2(pkid, msg.clone(), std::time::Instant::now()),
                QoS::AtMostOnce => unreachable!(),
            }
            pkid
        };

        let publish = v4::Publish {
            topic: msg.topic,
            payload: msg.payload,
            qos: msg.qos,
            retain,
            dup: false,
            pkid,
        };
        protocol::write_packet(writer, &Packet::Publish(publish)).await
    }

    /// Store the retained copy if flagged, then fan out to subscribers.
    ///
    /// Forwarded copies carry retain=0 and the minimum of the publish
    /// QoS and each subscription's granted QoS.
    fn route(&self, msg: Message) {
        if msg.retain {
            self.retained.set(msg.clone());
        }

        for entry in self.registry.matches(&msg.topic) {
            let mut out = msg.clone();
            out.qos = out.qos.min(entry.qos);
            out.retain = false;
            self.sessions.deliver(&entry.client_id, out);
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_config_defaults() {
        let config = BrokerConfig::new("127.0.0.1:1883");
        assert_eq!(config.addr, "127.0.0.1:1883");
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_broker_builder() {
        struct TestAuth;
        impl Authenticator for TestAuth {
            fn authenticate(&self, _: &str, _: &str, _: &[u8]) -> bool {
                true
            }
        }

        let broker = Broker::builder(BrokerConfig::new("127.0.0.1:1883"))
            .authenticator(TestAuth)
            .on_connect(|id| println!("connected: {}", id))
            .on_disconnect(|id| println!("disconnected: {}", id))
            .build();

        assert_eq!(broker.config.addr, "127.0.0.1:1883");
    }
}
