//! Common types for mammoth.

use bytes::Bytes;

use crate::error::{Error, Result};

/// MQTT control packet type (high nibble of the fixed header's first byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }
}

/// Quality of Service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once delivery (PUBLISH / PUBACK).
    AtLeastOnce = 1,
    /// Exactly once delivery (PUBLISH / PUBREC / PUBREL / PUBCOMP).
    ExactlyOnce = 2,
}

impl QoS {
    /// Parse a QoS value; both bits set (3) is reserved and rejected.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(Error::InvalidQoS(other)),
        }
    }
}

/// CONNACK return code (MQTT 3.1.1 table 3.1).
///
/// A non-zero code forces SessionPresent to 0 and the server closes the
/// network connection after the CONNACK is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServerUnavailable),
            4 => Ok(ConnectReturnCode::BadUserNameOrPassword),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            other => Err(Error::InvalidReturnCode(other)),
        }
    }
}

/// CONNECT flags byte, decomposed into named fields.
///
/// Bit layout: 7 user name, 6 password, 5 will retain, 4-3 will QoS,
/// 2 will flag, 1 clean session, 0 reserved (must be zero).
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectFlags {
    pub username: bool,
    pub password: bool,
    pub will_retain: bool,
    pub will_qos: QoS,
    pub will: bool,
    pub clean_session: bool,
}

const USERNAME_FLAG: u8 = 0x80;
const PASSWORD_FLAG: u8 = 0x40;
const WILL_RETAIN_FLAG: u8 = 0x20;
const WILL_QOS_MASK: u8 = 0x18;
const WILL_QOS_SHIFT: u8 = 3;
const WILL_FLAG: u8 = 0x04;
const CLEAN_SESSION_FLAG: u8 = 0x02;
const RESERVED_FLAG: u8 = 0x01;

impl ConnectFlags {
    /// Decode the flags byte, enforcing the reserved-bit and will-field
    /// consistency rules (MQTT-3.1.2-3, -13, -14, -15).
    pub fn decode(byte: u8) -> Result<Self> {
        if byte & RESERVED_FLAG != 0 {
            return Err(Error::ProtocolViolation("connect flags reserved bit set"));
        }

        let will = byte & WILL_FLAG != 0;
        let will_qos = QoS::from_u8((byte & WILL_QOS_MASK) >> WILL_QOS_SHIFT)?;
        let will_retain = byte & WILL_RETAIN_FLAG != 0;

        if !will && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(Error::ProtocolViolation("will qos/retain set without will flag"));
        }

        Ok(ConnectFlags {
            username: byte & USERNAME_FLAG != 0,
            password: byte & PASSWORD_FLAG != 0,
            will_retain,
            will_qos,
            will,
            clean_session: byte & CLEAN_SESSION_FLAG != 0,
        })
    }

    pub fn encode(&self) -> u8 {
        let mut byte = 0u8;
        if self.username {
            byte |= USERNAME_FLAG;
        }
        if self.password {
            byte |= PASSWORD_FLAG;
        }
        if self.will {
            byte |= WILL_FLAG;
            byte |= (self.will_qos as u8) << WILL_QOS_SHIFT;
            if self.will_retain {
                byte |= WILL_RETAIN_FLAG;
            }
        }
        if self.clean_session {
            byte |= CLEAN_SESSION_FLAG;
        }
        byte
    }
}

/// Validate a client identifier: 1..=23 characters of `[0-9A-Za-z]`.
///
/// The zero-length special case (server-assigned id) is handled by the
/// broker before this check.
pub fn validate_client_id(client_id: &str) -> Result<()> {
    if client_id.is_empty() || client_id.len() > 23 {
        return Err(Error::InvalidClientId);
    }
    if !client_id.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(Error::InvalidClientId);
    }
    Ok(())
}

/// Decides whether a CONNECT is allowed.
pub trait Authenticator: Send + Sync {
    /// Authenticate a client. Rejection maps to CONNACK return code 5.
    fn authenticate(&self, client_id: &str, username: &str, password: &[u8]) -> bool;
}

/// Authenticator that accepts everyone (the default).
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _client_id: &str, _username: &str, _password: &[u8]) -> bool {
        true
    }
}

/// An application message as routed between sessions.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic name (no wildcards).
    pub topic: String,
    /// Message payload, possibly empty.
    pub payload: Bytes,
    /// Delivery QoS. For outbound fan-out this is already the minimum of
    /// the publisher's QoS and the subscriber's granted QoS.
    pub qos: QoS,
    /// Retain flag: set only on retained-message replay and will messages.
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }

    /// Set retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}
