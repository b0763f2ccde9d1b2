//! Low-level MQTT wire primitives.
//!
//! Remaining-Length varint, big-endian integers, length-prefixed strings
//! and binary fields, and the fixed header shared by every control packet.

use crate::error::{Error, Result};
use crate::types::PacketType;

/// Largest value the 4-byte Remaining Length encoding can carry.
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

/// Decoded fixed header: control type, flags nibble and Remaining Length.
#[derive(Debug, Clone, Copy)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    /// Byte count of the variable header plus payload.
    pub remaining_length: u32,
    /// Bytes the header itself occupied (1 + varint length).
    pub header_length: usize,
}

/// Read a Remaining-Length varint.
///
/// Accumulates 7-bit groups; fails with `MalformedRemainingLength` once a
/// fifth byte would be needed, and with `Incomplete` when the buffer ends
/// before the continuation bit clears.
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize)> {
    let mut value = 0u32;
    let mut shift = 0u32;

    for (i, &byte) in buf.iter().enumerate() {
        value |= ((byte & 0x7F) as u32) << shift;

        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }

        shift += 7;
        if shift > 21 {
            return Err(Error::MalformedRemainingLength);
        }
    }

    Err(Error::Incomplete { needed: 1 })
}

/// Write a Remaining-Length varint.
///
/// Returns the number of bytes written, or `None` if the buffer is too small.
pub fn write_variable_int(buf: &mut [u8], mut value: u32) -> Option<usize> {
    let mut i = 0;

    loop {
        if i >= buf.len() {
            return None;
        }

        let mut byte = (value % 128) as u8;
        value /= 128;

        if value > 0 {
            byte |= 0x80;
        }

        buf[i] = byte;
        i += 1;

        if value == 0 {
            break;
        }
    }

    Some(i)
}

/// Number of bytes a Remaining-Length varint occupies.
pub const fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 128 * 128 {
        2
    } else if value < 128 * 128 * 128 {
        3
    } else {
        4
    }
}

/// Read a 2-byte big-endian u16.
pub fn read_u16(buf: &[u8]) -> Option<u16> {
    if buf.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Write a 2-byte big-endian u16.
pub fn write_u16(buf: &mut [u8], value: u16) -> Option<()> {
    if buf.len() < 2 {
        return None;
    }
    buf[..2].copy_from_slice(&value.to_be_bytes());
    Some(())
}

/// Read a UTF-8 string as a slice (2-byte length prefix + data).
pub fn read_string_slice(buf: &[u8]) -> Result<(&str, usize)> {
    let len = read_u16(buf).ok_or(Error::Incomplete { needed: 2 })? as usize;

    if buf.len() < 2 + len {
        return Err(Error::Incomplete { needed: 2 + len - buf.len() });
    }

    let s = core::str::from_utf8(&buf[2..2 + len]).map_err(|_| Error::InvalidUtf8)?;

    Ok((s, 2 + len))
}

/// Write a UTF-8 string (2-byte length prefix + data).
pub fn write_string(buf: &mut [u8], s: &str) -> Option<usize> {
    write_binary(buf, s.as_bytes())
}

/// Read binary data as a slice (2-byte length prefix + data).
pub fn read_binary_slice(buf: &[u8]) -> Result<(&[u8], usize)> {
    let len = read_u16(buf).ok_or(Error::Incomplete { needed: 2 })? as usize;

    if buf.len() < 2 + len {
        return Err(Error::Incomplete { needed: 2 + len - buf.len() });
    }

    Ok((&buf[2..2 + len], 2 + len))
}

/// Write binary data (2-byte length prefix + data).
pub fn write_binary(buf: &mut [u8], data: &[u8]) -> Option<usize> {
    let len = data.len();

    if len > u16::MAX as usize || buf.len() < 2 + len {
        return None;
    }

    write_u16(buf, len as u16)?;
    buf[2..2 + len].copy_from_slice(data);

    Some(2 + len)
}

/// Parse a fixed header, validating the flags nibble for the packet type.
pub fn read_fixed_header(buf: &[u8]) -> Result<FixedHeader> {
    if buf.is_empty() {
        return Err(Error::Incomplete { needed: 1 });
    }

    let first_byte = buf[0];
    let packet_type_byte = first_byte >> 4;
    let flags = first_byte & 0x0F;

    let packet_type =
        PacketType::from_u8(packet_type_byte).ok_or(Error::InvalidPacketType(packet_type_byte))?;

    validate_flags(packet_type, flags)?;

    let (remaining_length, var_len) = read_variable_int(&buf[1..])?;

    Ok(FixedHeader {
        packet_type,
        flags,
        remaining_length,
        header_length: 1 + var_len,
    })
}

/// Reserved-bit rules (MQTT 3.1.1 table 2.2).
///
/// PUBLISH flags carry dup/qos/retain but must not set both QoS bits;
/// PUBREL, SUBSCRIBE and UNSUBSCRIBE require `0b0010`; every other type
/// requires `0b0000`. A violation closes the connection without a response.
fn validate_flags(packet_type: PacketType, flags: u8) -> Result<()> {
    match packet_type {
        PacketType::Publish => {
            if (flags >> 1) & 0x03 == 0x03 {
                Err(Error::ProtocolViolation("publish with both qos bits set"))
            } else {
                Ok(())
            }
        }
        PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => {
            if flags == 0x02 {
                Ok(())
            } else {
                Err(Error::ProtocolViolation("reserved header flags must be 0010"))
            }
        }
        _ => {
            if flags == 0 {
                Ok(())
            } else {
                Err(Error::ProtocolViolation("reserved header flags must be 0000"))
            }
        }
    }
}

/// Write a fixed header to buffer.
pub fn write_fixed_header(
    buf: &mut [u8],
    packet_type: PacketType,
    flags: u8,
    remaining_length: u32,
) -> Option<usize> {
    if buf.is_empty() {
        return None;
    }

    buf[0] = ((packet_type as u8) << 4) | (flags & 0x0F);
    let var_len = write_variable_int(&mut buf[1..], remaining_length)?;

    Some(1 + var_len)
}
