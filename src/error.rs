//! Error types for mammoth.

use std::io;

/// Result type alias for mammoth.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mammoth operations.
///
/// Decode and dispatch failures fall into four families: framing errors
/// (malformed packets, connection closed without a response), protocol
/// violations (well-formed but illegal, connection closed), caller-side
/// argument errors (no network effect), and QoS delivery timeouts
/// (retried, then surfaced without closing).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Not enough bytes buffered to finish decoding.
    ///
    /// Transient: the reader fetches more bytes and retries.
    #[error("incomplete packet: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Remaining Length field would exceed its 4-byte ceiling.
    #[error("malformed remaining length")]
    MalformedRemainingLength,

    /// Framing or field decode failure.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// A length-prefixed string field is not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// Packet exceeds the configured maximum size.
    #[error("packet size {size} exceeds limit {max}")]
    PacketTooLarge { size: usize, max: usize },

    /// Control packet type nibble is 0 or 15.
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    /// Well-formed but semantically illegal packet.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// CONNECT carried a protocol level other than 4.
    ///
    /// Answered with CONNACK return code 1 before the close.
    #[error("unsupported protocol level: {0}")]
    InvalidProtocolLevel(u8),

    /// QoS value outside 0..=2 (or a SUBACK code outside its set).
    #[error("invalid qos: {0}")]
    InvalidQoS(u8),

    /// Client identifier outside 1..=23 chars of `[0-9A-Za-z]`.
    #[error("invalid client id")]
    InvalidClientId,

    /// CONNACK return code above 5 handed to the encoder.
    #[error("invalid connect return code: {0}")]
    InvalidReturnCode(u8),

    /// Topic filter fails wildcard placement rules.
    #[error("invalid topic filter: {0}")]
    InvalidFilter(String),

    /// Destination buffer too small for the encoded packet.
    #[error("buffer too small: required {required}, available {available}")]
    BufferTooSmall { required: usize, available: usize },

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// QoS handshake stage unacknowledged after bounded retries.
    #[error("delivery timeout for packet id {pkid} after {retries} retries")]
    Timeout { pkid: u16, retries: u32 },

    /// No traffic for 1.5 times the negotiated keep-alive interval.
    #[error("keep-alive expired")]
    KeepAliveExpired,

    /// Session store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Broker is already running.
    #[error("broker already running")]
    AlreadyRunning,
}
