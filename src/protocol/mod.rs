//! MQTT 3.1.1 protocol layer.
//!
//! `codec` holds the wire primitives (varint, strings, fixed header),
//! `v4` the control packet types, and this module the async framing
//! functions that move whole packets over a stream.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub mod codec;
pub mod v4;

pub use codec::{FixedHeader, MAX_REMAINING_LENGTH};
pub use v4::Packet;

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Read a single packet from an async reader.
///
/// Leftover bytes stay in `buf` for the next call, so pipelined packets
/// are not lost.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Packet> {
    loop {
        if !buf.is_empty() {
            match Packet::read(buf, max_size) {
                Ok((packet, consumed)) => {
                    buf.advance(consumed);
                    return Ok(packet);
                }
                Err(Error::Incomplete { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let mut tmp = [0u8; 4096];
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// Write a single packet to an async writer and flush it.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let mut buf = vec![0u8; packet.size()];
    let n = packet.write(&mut buf)?;
    writer.write_all(&buf[..n]).await?;
    writer.flush().await?;
    Ok(())
}
