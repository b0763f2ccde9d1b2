//! MQTT 3.1.1 control packets.
//!
//! Each variant embeds the shared fixed header by composition: encoders
//! write the header (type, flags, Remaining Length computed from the
//! serialized body) followed by the variable header and payload; decoders
//! receive the already-parsed header and read exactly `remaining_length`
//! bytes positionally.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::types::{ConnectFlags, ConnectReturnCode, PacketType, QoS};

use super::codec::{
    read_binary_slice, read_fixed_header, read_string_slice, read_u16, variable_int_len,
    write_binary, write_fixed_header, write_string, write_u16,
};

/// MQTT 3.1.1 control packet, one variant per control type.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

/// CONNECT packet.
#[derive(Debug, Clone)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<Will>,
}

/// Last Will and Testament.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

impl ConnAck {
    /// A non-zero return code forces SessionPresent to 0 (MQTT-3.2.2-4).
    pub fn new(code: ConnectReturnCode, session_present: bool) -> Self {
        ConnAck {
            session_present: session_present && code == ConnectReturnCode::Accepted,
            code,
        }
    }
}

/// PUBLISH packet.
#[derive(Debug, Clone)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Present on the wire only when qos > 0.
    pub pkid: u16,
}

/// PUBACK packet (QoS 1 acknowledgment).
#[derive(Debug, Clone, Copy)]
pub struct PubAck {
    pub pkid: u16,
}

/// PUBREC packet (QoS 2 assured delivery, part 1).
#[derive(Debug, Clone, Copy)]
pub struct PubRec {
    pub pkid: u16,
}

/// PUBREL packet (QoS 2 assured delivery, part 2).
#[derive(Debug, Clone, Copy)]
pub struct PubRel {
    pub pkid: u16,
}

/// PUBCOMP packet (QoS 2 assured delivery, part 3).
#[derive(Debug, Clone, Copy)]
pub struct PubComp {
    pub pkid: u16,
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

/// One (topic filter, requested QoS) pair in a SUBSCRIBE payload.
#[derive(Debug, Clone)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

/// SUBACK packet.
#[derive(Debug, Clone)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// SUBACK return code: granted QoS or 0x80 failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    /// Only 0x00, 0x01, 0x02 and 0x80 are legal (MQTT-3.9.3-2).
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SubscribeReturnCode::Success(QoS::AtMostOnce)),
            1 => Ok(SubscribeReturnCode::Success(QoS::AtLeastOnce)),
            2 => Ok(SubscribeReturnCode::Success(QoS::ExactlyOnce)),
            0x80 => Ok(SubscribeReturnCode::Failure),
            other => Err(Error::InvalidQoS(other)),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SubscribeReturnCode::Success(qos) => qos as u8,
            SubscribeReturnCode::Failure => 0x80,
        }
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

/// UNSUBACK packet.
#[derive(Debug, Clone, Copy)]
pub struct UnsubAck {
    pub pkid: u16,
}

/// Map a mid-body short read to `MalformedPacket`: `Packet::read` only
/// dispatches once the full Remaining Length is buffered, so a field
/// running past the end is a framing error, not missing bytes.
fn truncated(err: Error) -> Error {
    match err {
        Error::Incomplete { .. } => Error::MalformedPacket("field runs past remaining length"),
        other => other,
    }
}

// ============================================================================
// Packet parsing
// ============================================================================

impl Packet {
    /// Parse one packet from the buffer, returning it and the bytes consumed.
    ///
    /// `Incomplete` means more bytes are needed; every other error is
    /// connection-fatal for the caller.
    pub fn read(buf: &[u8], max_size: usize) -> Result<(Packet, usize)> {
        let header = read_fixed_header(buf)?;
        let total_len = header.header_length + header.remaining_length as usize;

        if total_len > max_size {
            return Err(Error::PacketTooLarge { size: total_len, max: max_size });
        }

        if buf.len() < total_len {
            return Err(Error::Incomplete { needed: total_len - buf.len() });
        }

        let payload = &buf[header.header_length..total_len];

        let packet = match header.packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(payload).map_err(truncated)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(payload).map_err(truncated)?),
            PacketType::Publish => {
                Packet::Publish(Publish::read(header.flags, payload).map_err(truncated)?)
            }
            PacketType::PubAck => Packet::PubAck(PubAck { pkid: read_pkid(payload)? }),
            PacketType::PubRec => Packet::PubRec(PubRec { pkid: read_pkid(payload)? }),
            PacketType::PubRel => Packet::PubRel(PubRel { pkid: read_pkid(payload)? }),
            PacketType::PubComp => Packet::PubComp(PubComp { pkid: read_pkid(payload)? }),
            PacketType::Subscribe => {
                Packet::Subscribe(Subscribe::read(payload).map_err(truncated)?)
            }
            PacketType::SubAck => Packet::SubAck(SubAck::read(payload).map_err(truncated)?),
            PacketType::Unsubscribe => {
                Packet::Unsubscribe(Unsubscribe::read(payload).map_err(truncated)?)
            }
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck { pkid: read_pkid(payload)? }),
            PacketType::PingReq => {
                expect_empty(payload)?;
                Packet::PingReq
            }
            PacketType::PingResp => {
                expect_empty(payload)?;
                Packet::PingResp
            }
            PacketType::Disconnect => {
                expect_empty(payload)?;
                Packet::Disconnect
            }
        };

        Ok((packet, total_len))
    }

    /// Write the packet, returning the number of bytes written.
    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Packet::Connect(p) => p.write(buf),
            Packet::ConnAck(p) => p.write(buf),
            Packet::Publish(p) => p.write(buf),
            Packet::PubAck(p) => write_ack(buf, PacketType::PubAck, 0, p.pkid),
            Packet::PubRec(p) => write_ack(buf, PacketType::PubRec, 0, p.pkid),
            Packet::PubRel(p) => write_ack(buf, PacketType::PubRel, 0x02, p.pkid),
            Packet::PubComp(p) => write_ack(buf, PacketType::PubComp, 0, p.pkid),
            Packet::Subscribe(p) => p.write(buf),
            Packet::SubAck(p) => p.write(buf),
            Packet::Unsubscribe(p) => p.write(buf),
            Packet::UnsubAck(p) => write_ack(buf, PacketType::UnsubAck, 0, p.pkid),
            Packet::PingReq => write_empty(buf, PacketType::PingReq),
            Packet::PingResp => write_empty(buf, PacketType::PingResp),
            Packet::Disconnect => write_empty(buf, PacketType::Disconnect),
        }
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        match self {
            Packet::Connect(p) => p.size(),
            Packet::ConnAck(_) => 4,
            Packet::Publish(p) => p.size(),
            Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubRel(_)
            | Packet::PubComp(_)
            | Packet::UnsubAck(_) => 4,
            Packet::Subscribe(p) => p.size(),
            Packet::SubAck(p) => p.size(),
            Packet::Unsubscribe(p) => p.size(),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 2,
        }
    }
}

fn read_pkid(buf: &[u8]) -> Result<u16> {
    if buf.len() != 2 {
        return Err(Error::MalformedPacket("ack body must be a 2-byte packet id"));
    }
    read_u16(buf).ok_or(Error::MalformedPacket("ack body must be a 2-byte packet id"))
}

fn expect_empty(buf: &[u8]) -> Result<()> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(Error::MalformedPacket("unexpected payload"))
    }
}

fn write_ack(buf: &mut [u8], packet_type: PacketType, flags: u8, pkid: u16) -> Result<usize> {
    if buf.len() < 4 {
        return Err(Error::BufferTooSmall { required: 4, available: buf.len() });
    }

    write_fixed_header(buf, packet_type, flags, 2)
        .ok_or(Error::BufferTooSmall { required: 2, available: buf.len() })?;
    write_u16(&mut buf[2..], pkid)
        .ok_or(Error::BufferTooSmall { required: 2, available: buf.len() - 2 })?;

    Ok(4)
}

fn write_empty(buf: &mut [u8], packet_type: PacketType) -> Result<usize> {
    if buf.len() < 2 {
        return Err(Error::BufferTooSmall { required: 2, available: buf.len() });
    }
    write_fixed_header(buf, packet_type, 0, 0)
        .ok_or(Error::BufferTooSmall { required: 2, available: buf.len() })
}

// ============================================================================
// Individual packet implementations
// ============================================================================

impl Connect {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut pos = 0;

        let (name, len) = read_string_slice(buf)?;
        if name != "MQTT" {
            return Err(Error::MalformedPacket("invalid protocol name"));
        }
        pos += len;

        if buf.len() < pos + 1 {
            return Err(Error::Incomplete { needed: 1 });
        }
        let protocol_level = buf[pos];
        if protocol_level != 4 {
            return Err(Error::InvalidProtocolLevel(protocol_level));
        }
        pos += 1;

        if buf.len() < pos + 1 {
            return Err(Error::Incomplete { needed: 1 });
        }
        let flags = ConnectFlags::decode(buf[pos])?;
        pos += 1;

        let keep_alive = read_u16(&buf[pos..]).ok_or(Error::Incomplete { needed: 2 })?;
        pos += 2;

        // Client id validation (length, charset, empty-id rules) is the
        // broker's job: it answers with a CONNACK return code instead of
        // dropping the connection.
        let (client_id, len) = read_string_slice(&buf[pos..])?;
        let client_id = client_id.to_string();
        pos += len;

        let will = if flags.will {
            let (topic, len) = read_string_slice(&buf[pos..])?;
            let topic = topic.to_string();
            pos += len;
            let (payload, len) = read_binary_slice(&buf[pos..])?;
            let payload = Bytes::copy_from_slice(payload);
            pos += len;
            Some(Will { topic, payload, qos: flags.will_qos, retain: flags.will_retain })
        } else {
            None
        };

        let username = if flags.username {
            let (u, len) = read_string_slice(&buf[pos..])?;
            pos += len;
            Some(u.to_string())
        } else {
            None
        };

        let password = if flags.password {
            let (p, _) = read_binary_slice(&buf[pos..])?;
            Some(p.to_vec())
        } else {
            None
        };

        Ok(Connect {
            client_id,
            keep_alive,
            clean_session: flags.clean_session,
            username,
            password,
            will,
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        // Encoder-side argument check; an empty id is the server-assigned
        // special case and passes through.
        if !self.client_id.is_empty() {
            crate::types::validate_client_id(&self.client_id)?;
        }

        let remaining_len = self.remaining_length();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::BufferTooSmall { required: total, available: buf.len() });
        }

        let mut pos = write_fixed_header(buf, PacketType::Connect, 0, remaining_len as u32)
            .ok_or(Error::BufferTooSmall { required: header_len, available: buf.len() })?;

        pos += write_string(&mut buf[pos..], "MQTT")
            .ok_or(Error::BufferTooSmall { required: 6, available: buf.len() - pos })?;

        buf[pos] = 4; // protocol level
        pos += 1;

        let mut flags = ConnectFlags {
            clean_session: self.clean_session,
            username: self.username.is_some(),
            password: self.password.is_some(),
            ..Default::default()
        };
        if let Some(ref will) = self.will {
            flags.will = true;
            flags.will_qos = will.qos;
            flags.will_retain = will.retain;
        }
        buf[pos] = flags.encode();
        pos += 1;

        write_u16(&mut buf[pos..], self.keep_alive)
            .ok_or(Error::BufferTooSmall { required: 2, available: buf.len() - pos })?;
        pos += 2;

        pos += write_string(&mut buf[pos..], &self.client_id).ok_or(Error::BufferTooSmall {
            required: 2 + self.client_id.len(),
            available: buf.len() - pos,
        })?;

        if let Some(ref will) = self.will {
            pos += write_string(&mut buf[pos..], &will.topic).ok_or(Error::BufferTooSmall {
                required: 2 + will.topic.len(),
                available: buf.len() - pos,
            })?;
            pos += write_binary(&mut buf[pos..], &will.payload).ok_or(Error::BufferTooSmall {
                required: 2 + will.payload.len(),
                available: buf.len() - pos,
            })?;
        }

        if let Some(ref username) = self.username {
            pos += write_string(&mut buf[pos..], username).ok_or(Error::BufferTooSmall {
                required: 2 + username.len(),
                available: buf.len() - pos,
            })?;
        }

        if let Some(ref password) = self.password {
            pos += write_binary(&mut buf[pos..], password).ok_or(Error::BufferTooSmall {
                required: 2 + password.len(),
                available: buf.len() - pos,
            })?;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        // protocol name + level + flags + keep alive
        let mut len = 2 + 4 + 1 + 1 + 2;
        len += 2 + self.client_id.len();

        if let Some(ref will) = self.will {
            len += 2 + will.topic.len();
            len += 2 + will.payload.len();
        }
        if let Some(ref username) = self.username {
            len += 2 + username.len();
        }
        if let Some(ref password) = self.password {
            len += 2 + password.len();
        }

        len
    }

    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

impl ConnAck {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() != 2 {
            return Err(Error::MalformedPacket("connack body must be 2 bytes"));
        }

        if buf[0] & 0xFE != 0 {
            return Err(Error::ProtocolViolation("connack reserved ack flags set"));
        }
        let session_present = buf[0] & 0x01 != 0;
        let code = ConnectReturnCode::from_u8(buf[1])?;

        Ok(ConnAck { session_present, code })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < 4 {
            return Err(Error::BufferTooSmall { required: 4, available: buf.len() });
        }

        write_fixed_header(buf, PacketType::ConnAck, 0, 2)
            .ok_or(Error::BufferTooSmall { required: 2, available: buf.len() })?;

        let session_present = self.session_present && self.code == ConnectReturnCode::Accepted;
        buf[2] = if session_present { 0x01 } else { 0x00 };
        buf[3] = self.code as u8;

        Ok(4)
    }
}

impl Publish {
    pub fn read(flags: u8, buf: &[u8]) -> Result<Self> {
        let dup = flags & 0x08 != 0;
        let qos = QoS::from_u8((flags >> 1) & 0x03)?;
        let retain = flags & 0x01 != 0;

        let mut pos = 0;

        let (topic, len) = read_string_slice(buf)?;
        if topic.is_empty() {
            return Err(Error::MalformedPacket("empty topic name"));
        }
        if topic.contains(['+', '#']) {
            return Err(Error::ProtocolViolation("wildcard in publish topic name"));
        }
        let topic = topic.to_string();
        pos += len;

        let pkid = if qos != QoS::AtMostOnce {
            let id = read_u16(&buf[pos..]).ok_or(Error::Incomplete { needed: 2 })?;
            if id == 0 {
                return Err(Error::ProtocolViolation("zero packet id"));
            }
            pos += 2;
            id
        } else {
            0
        };

        let payload = Bytes::copy_from_slice(&buf[pos..]);

        Ok(Publish { topic, payload, qos, retain, dup, pkid })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = self.remaining_length();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::BufferTooSmall { required: total, available: buf.len() });
        }

        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.retain {
            flags |= 0x01;
        }

        let mut pos = write_fixed_header(buf, PacketType::Publish, flags, remaining_len as u32)
            .ok_or(Error::BufferTooSmall { required: header_len, available: buf.len() })?;

        pos += write_string(&mut buf[pos..], &self.topic).ok_or(Error::BufferTooSmall {
            required: 2 + self.topic.len(),
            available: buf.len() - pos,
        })?;

        if self.qos != QoS::AtMostOnce {
            write_u16(&mut buf[pos..], self.pkid)
                .ok_or(Error::BufferTooSmall { required: 2, available: buf.len() - pos })?;
            pos += 2;
        }

        buf[pos..pos + self.payload.len()].copy_from_slice(&self.payload);
        pos += self.payload.len();

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2 + self.topic.len() + self.payload.len();
        if self.qos != QoS::AtMostOnce {
            len += 2;
        }
        len
    }

    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

impl Subscribe {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let pkid = read_u16(buf).ok_or(Error::Incomplete { needed: 2 })?;
        if pkid == 0 {
            return Err(Error::ProtocolViolation("zero packet id"));
        }
        let mut pos = 2;

        let mut filters = Vec::new();
        while pos < buf.len() {
            let (path, len) = read_string_slice(&buf[pos..])?;
            pos += len;

            if pos >= buf.len() {
                return Err(Error::Incomplete { needed: 1 });
            }
            // Full byte checked: upper bits are reserved, 3 is illegal.
            let qos = QoS::from_u8(buf[pos])?;
            pos += 1;

            filters.push(SubscribeFilter { path: path.to_string(), qos });
        }

        if filters.is_empty() {
            return Err(Error::ProtocolViolation("subscribe with no topic filters"));
        }

        Ok(Subscribe { pkid, filters })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = self.remaining_length();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::BufferTooSmall { required: total, available: buf.len() });
        }

        let mut pos = write_fixed_header(buf, PacketType::Subscribe, 0x02, remaining_len as u32)
            .ok_or(Error::BufferTooSmall { required: header_len, available: buf.len() })?;

        write_u16(&mut buf[pos..], self.pkid)
            .ok_or(Error::BufferTooSmall { required: 2, available: buf.len() - pos })?;
        pos += 2;

        for filter in &self.filters {
            pos += write_string(&mut buf[pos..], &filter.path).ok_or(Error::BufferTooSmall {
                required: 2 + filter.path.len(),
                available: buf.len() - pos,
            })?;
            buf[pos] = filter.qos as u8;
            pos += 1;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2;
        for filter in &self.filters {
            len += 2 + filter.path.len() + 1;
        }
        len
    }

    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

impl SubAck {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let pkid = read_u16(buf).ok_or(Error::Incomplete { needed: 2 })?;

        let return_codes = buf[2..]
            .iter()
            .map(|&b| SubscribeReturnCode::from_u8(b))
            .collect::<Result<Vec<_>>>()?;

        if return_codes.is_empty() {
            return Err(Error::MalformedPacket("suback with no return codes"));
        }

        Ok(SubAck { pkid, return_codes })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = 2 + self.return_codes.len();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::BufferTooSmall { required: total, available: buf.len() });
        }

        let mut pos = write_fixed_header(buf, PacketType::SubAck, 0, remaining_len as u32)
            .ok_or(Error::BufferTooSmall { required: header_len, available: buf.len() })?;

        write_u16(&mut buf[pos..], self.pkid)
            .ok_or(Error::BufferTooSmall { required: 2, available: buf.len() - pos })?;
        pos += 2;

        for code in &self.return_codes {
            buf[pos] = code.to_u8();
            pos += 1;
        }

        Ok(pos)
    }

    pub fn size(&self) -> usize {
        let remaining = 2 + self.return_codes.len();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

impl Unsubscribe {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let pkid = read_u16(buf).ok_or(Error::Incomplete { needed: 2 })?;
        if pkid == 0 {
            return Err(Error::ProtocolViolation("zero packet id"));
        }
        let mut pos = 2;

        let mut topics = Vec::new();
        while pos < buf.len() {
            let (topic, len) = read_string_slice(&buf[pos..])?;
            topics.push(topic.to_string());
            pos += len;
        }

        if topics.is_empty() {
            return Err(Error::ProtocolViolation("unsubscribe with no topic filters"));
        }

        Ok(Unsubscribe { pkid, topics })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = self.remaining_length();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::BufferTooSmall { required: total, available: buf.len() });
        }

        let mut pos = write_fixed_header(buf, PacketType::Unsubscribe, 0x02, remaining_len as u32)
            .ok_or(Error::BufferTooSmall { required: header_len, available: buf.len() })?;

        write_u16(&mut buf[pos..], self.pkid)
            .ok_or(Error::BufferTooSmall { required: 2, available: buf.len() - pos })?;
        pos += 2;

        for topic in &self.topics {
            pos += write_string(&mut buf[pos..], topic).ok_or(Error::BufferTooSmall {
                required: 2 + topic.len(),
                available: buf.len() - pos,
            })?;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2;
        for topic in &self.topics {
            len += 2 + topic.len();
        }
        len
    }

    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) -> Packet {
        let mut buf = vec![0u8; packet.size()];
        let written = packet.write(&mut buf).unwrap();
        assert_eq!(written, buf.len());

        let (parsed, consumed) = Packet::read(&buf, 1024 * 1024).unwrap();
        assert_eq!(consumed, written);
        parsed
    }

    #[test]
    fn test_connect_roundtrip() {
        let connect = Connect {
            client_id: "sensor7".to_string(),
            keep_alive: 30,
            clean_session: false,
            username: Some("user".to_string()),
            password: Some(b"secret".to_vec()),
            will: Some(Will {
                topic: "status/sensor7".to_string(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
        };

        let parsed = roundtrip(Packet::Connect(connect));
        let Packet::Connect(c) = parsed else { panic!("expected Connect") };
        assert_eq!(c.client_id, "sensor7");
        assert_eq!(c.keep_alive, 30);
        assert!(!c.clean_session);
        assert_eq!(c.username.as_deref(), Some("user"));
        assert_eq!(c.password.as_deref(), Some(b"secret".as_slice()));
        let will = c.will.unwrap();
        assert_eq!(will.topic, "status/sensor7");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }

    #[test]
    fn test_connect_write_rejects_bad_client_id() {
        let connect = Connect {
            client_id: "bad-id!".to_string(),
            keep_alive: 0,
            clean_session: true,
            username: None,
            password: None,
            will: None,
        };
        let mut buf = vec![0u8; 64];
        assert!(matches!(connect.write(&mut buf), Err(Error::InvalidClientId)));
    }

    #[test]
    fn test_connect_rejects_wrong_protocol() {
        // "MQIsdp" style name.
        let connect = Connect {
            client_id: "c1".to_string(),
            keep_alive: 0,
            clean_session: true,
            username: None,
            password: None,
            will: None,
        };
        let mut buf = vec![0u8; connect.size()];
        connect.write(&mut buf).unwrap();

        // Corrupt protocol level.
        buf[8] = 3;
        let err = Packet::read(&buf, 1024).unwrap_err();
        assert!(matches!(err, Error::InvalidProtocolLevel(3)));
    }

    #[test]
    fn test_connack_roundtrip() {
        let parsed = roundtrip(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted, true)));
        let Packet::ConnAck(c) = parsed else { panic!("expected ConnAck") };
        assert!(c.session_present);
        assert_eq!(c.code, ConnectReturnCode::Accepted);
    }

    #[test]
    fn test_connack_nonzero_code_clears_session_present() {
        let connack = ConnAck::new(ConnectReturnCode::IdentifierRejected, true);
        assert!(!connack.session_present);

        let mut buf = [0u8; 4];
        connack.write(&mut buf).unwrap();
        assert_eq!(buf[2], 0x00);
        assert_eq!(buf[3], 2);
    }

    #[test]
    fn test_connack_rejects_code_above_five() {
        let buf = [0x20, 0x02, 0x00, 0x06];
        assert!(matches!(
            Packet::read(&buf, 1024),
            Err(Error::InvalidReturnCode(6))
        ));
    }

    #[test]
    fn test_publish_roundtrip_qos0() {
        let publish = Publish {
            topic: "sensors/kitchen/temp".to_string(),
            payload: Bytes::from_static(b"21.5"),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            pkid: 0,
        };

        let parsed = roundtrip(Packet::Publish(publish));
        let Packet::Publish(p) = parsed else { panic!("expected Publish") };
        assert_eq!(p.topic, "sensors/kitchen/temp");
        assert_eq!(p.payload.as_ref(), b"21.5");
        assert_eq!(p.qos, QoS::AtMostOnce);
    }

    #[test]
    fn test_publish_roundtrip_qos2_with_pkid() {
        let publish = Publish {
            topic: "a/b".to_string(),
            payload: Bytes::new(),
            qos: QoS::ExactlyOnce,
            retain: true,
            dup: true,
            pkid: 7,
        };

        let parsed = roundtrip(Packet::Publish(publish));
        let Packet::Publish(p) = parsed else { panic!("expected Publish") };
        assert_eq!(p.pkid, 7);
        assert!(p.retain && p.dup);
        assert!(p.payload.is_empty());
        assert_eq!(p.qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_publish_rejects_wildcard_topic() {
        let publish = Publish {
            topic: "sensors/+/temp".to_string(),
            payload: Bytes::new(),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            pkid: 0,
        };
        let mut buf = vec![0u8; publish.size()];
        publish.write(&mut buf).unwrap();

        assert!(matches!(
            Packet::read(&buf, 1024),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_publish_rejects_zero_pkid() {
        let publish = Publish {
            topic: "a".to_string(),
            payload: Bytes::new(),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            pkid: 0,
        };
        let mut buf = vec![0u8; publish.size()];
        publish.write(&mut buf).unwrap();

        assert!(matches!(
            Packet::read(&buf, 1024),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_qos_acks_roundtrip() {
        for (packet, expected_first_byte) in [
            (Packet::PubAck(PubAck { pkid: 10 }), 0x40u8),
            (Packet::PubRec(PubRec { pkid: 11 }), 0x50),
            (Packet::PubRel(PubRel { pkid: 12 }), 0x62),
            (Packet::PubComp(PubComp { pkid: 13 }), 0x70),
            (Packet::UnsubAck(UnsubAck { pkid: 14 }), 0xB0),
        ] {
            let mut buf = vec![0u8; packet.size()];
            let written = packet.write(&mut buf).unwrap();
            assert_eq!(written, 4);
            assert_eq!(buf[0], expected_first_byte);

            let (parsed, _) = Packet::read(&buf, 1024).unwrap();
            match (&packet, &parsed) {
                (Packet::PubAck(a), Packet::PubAck(b)) => assert_eq!(a.pkid, b.pkid),
                (Packet::PubRec(a), Packet::PubRec(b)) => assert_eq!(a.pkid, b.pkid),
                (Packet::PubRel(a), Packet::PubRel(b)) => assert_eq!(a.pkid, b.pkid),
                (Packet::PubComp(a), Packet::PubComp(b)) => assert_eq!(a.pkid, b.pkid),
                (Packet::UnsubAck(a), Packet::UnsubAck(b)) => assert_eq!(a.pkid, b.pkid),
                _ => panic!("variant changed across roundtrip"),
            }
        }
    }

    #[test]
    fn test_pubrel_requires_flags_0010() {
        // PUBREL with flags 0000.
        let buf = [0x60, 0x02, 0x00, 0x07];
        assert!(matches!(
            Packet::read(&buf, 1024),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_subscribe_roundtrip() {
        let subscribe = Subscribe {
            pkid: 3,
            filters: vec![
                SubscribeFilter { path: "sensors/+/temp".to_string(), qos: QoS::AtLeastOnce },
                SubscribeFilter { path: "status/#".to_string(), qos: QoS::ExactlyOnce },
            ],
        };

        let parsed = roundtrip(Packet::Subscribe(subscribe));
        let Packet::Subscribe(s) = parsed else { panic!("expected Subscribe") };
        assert_eq!(s.pkid, 3);
        assert_eq!(s.filters.len(), 2);
        assert_eq!(s.filters[0].path, "sensors/+/temp");
        assert_eq!(s.filters[0].qos, QoS::AtLeastOnce);
        assert_eq!(s.filters[1].qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_subscribe_rejects_qos3() {
        let subscribe = Subscribe {
            pkid: 3,
            filters: vec![SubscribeFilter { path: "a".to_string(), qos: QoS::AtMostOnce }],
        };
        let mut buf = vec![0u8; subscribe.size()];
        let written = subscribe.write(&mut buf).unwrap();
        buf[written - 1] = 3; // requested QoS byte

        assert!(matches!(Packet::read(&buf, 1024), Err(Error::InvalidQoS(3))));
    }

    #[test]
    fn test_subscribe_rejects_empty_payload() {
        // SUBSCRIBE with only a packet id.
        let buf = [0x82, 0x02, 0x00, 0x01];
        assert!(matches!(
            Packet::read(&buf, 1024),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_suback_roundtrip() {
        let suback = SubAck {
            pkid: 3,
            return_codes: vec![
                SubscribeReturnCode::Success(QoS::AtLeastOnce),
                SubscribeReturnCode::Failure,
            ],
        };

        let parsed = roundtrip(Packet::SubAck(suback));
        let Packet::SubAck(s) = parsed else { panic!("expected SubAck") };
        assert_eq!(s.pkid, 3);
        assert_eq!(s.return_codes[0], SubscribeReturnCode::Success(QoS::AtLeastOnce));
        assert_eq!(s.return_codes[1], SubscribeReturnCode::Failure);
    }

    #[test]
    fn test_suback_return_code_set() {
        for v in [0u8, 1, 2, 0x80] {
            assert!(SubscribeReturnCode::from_u8(v).is_ok());
        }
        for v in [3u8, 0x7F, 0x81, 0xFF] {
            assert!(matches!(
                SubscribeReturnCode::from_u8(v),
                Err(Error::InvalidQoS(_))
            ));
        }
    }

    #[test]
    fn test_unsubscribe_roundtrip() {
        let unsubscribe = Unsubscribe {
            pkid: 9,
            topics: vec!["a/b".to_string(), "c/#".to_string()],
        };

        let parsed = roundtrip(Packet::Unsubscribe(unsubscribe));
        let Packet::Unsubscribe(u) = parsed else { panic!("expected Unsubscribe") };
        assert_eq!(u.pkid, 9);
        assert_eq!(u.topics, vec!["a/b".to_string(), "c/#".to_string()]);
    }

    #[test]
    fn test_simple_packets_roundtrip() {
        assert!(matches!(roundtrip(Packet::PingReq), Packet::PingReq));
        assert!(matches!(roundtrip(Packet::PingResp), Packet::PingResp));
        assert!(matches!(roundtrip(Packet::Disconnect), Packet::Disconnect));
    }

    #[test]
    fn test_read_incomplete_and_too_large() {
        let publish = Publish {
            topic: "a/b".to_string(),
            payload: Bytes::from_static(b"xyz"),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            pkid: 0,
        };
        let mut buf = vec![0u8; publish.size()];
        let written = publish.write(&mut buf).unwrap();

        assert!(matches!(
            Packet::read(&buf[..written - 2], 1024),
            Err(Error::Incomplete { needed: 2 })
        ));
        assert!(matches!(
            Packet::read(&buf, 4),
            Err(Error::PacketTooLarge { .. })
        ));
    }
}
