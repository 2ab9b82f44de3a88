//! Frame codec for L2 frames on a serial byte stream.
//!
//! Payload layout before stuffing:
//!
//! ```text
//! [len_hi][len_lo][L2 bytes ...][crc_b3][crc_b2][crc_b1][crc_b0]
//! ```
//!
//! The 16-bit big-endian length equals the L2 byte count; the CRC-32C
//! covers the length prefix and the L2 bytes. The stuffed payload is
//! followed by a single `0x00` terminator on the wire.

use crate::checksum::crc32c;
use crate::stuffing::{max_stuffed_len, stuff, unstuff};
use crate::WireError;

/// Fixed per-frame overhead: 2-byte length prefix + 4-byte CRC-32C.
pub const FRAME_OVERHEAD: usize = 6;

/// Largest L2 frame carried over the serial link (Ethernet MTU + header +
/// VLAN tag).
pub const MAX_L2_FRAME: usize = 1522;

/// Largest on-wire frame: stuffed payload plus the terminator.
pub const MAX_WIRE_FRAME: usize = max_stuffed_len(MAX_L2_FRAME + FRAME_OVERHEAD) + 1;

/// Largest pre-stuffing payload.
const MAX_PAYLOAD: usize = MAX_L2_FRAME + FRAME_OVERHEAD;

/// Encode `l2` into `wire` (stuffed, `0x00`-terminated).
///
/// Returns the total number of bytes written, terminator included.
pub fn encode(wire: &mut [u8], l2: &[u8]) -> Result<usize, WireError> {
    if l2.is_empty() || l2.len() > MAX_L2_FRAME {
        return Err(WireError::FrameLength(l2.len()));
    }

    let payload_len = l2.len() + FRAME_OVERHEAD;
    let mut payload = [0u8; MAX_PAYLOAD];

    payload[..2].copy_from_slice(&(l2.len() as u16).to_be_bytes());
    payload[2..2 + l2.len()].copy_from_slice(l2);

    let crc = crc32c(&payload[..2 + l2.len()]);
    payload[2 + l2.len()..payload_len].copy_from_slice(&crc.to_be_bytes());

    if wire.len() < max_stuffed_len(payload_len) + 1 {
        return Err(WireError::Capacity);
    }
    let limit = wire.len() - 1; // keep room for the terminator
    let stuffed = stuff(&mut wire[..limit], &payload[..payload_len])?;

    wire[stuffed] = 0x00;
    Ok(stuffed + 1)
}

/// Decode a wire frame (without its `0x00` terminator) into `l2`.
///
/// Returns the L2 byte count. Any validation failure — stuffing error,
/// length mismatch, checksum mismatch — is an error and the frame must be
/// dropped.
pub fn decode(l2: &mut [u8], wire: &[u8]) -> Result<usize, WireError> {
    if wire.is_empty() {
        return Err(WireError::Truncated);
    }

    let mut payload = [0u8; MAX_PAYLOAD];
    let payload_len = unstuff(&mut payload, wire)?;
    if payload_len < FRAME_OVERHEAD {
        return Err(WireError::Truncated);
    }

    let frame_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if frame_len == 0 || frame_len > MAX_L2_FRAME {
        return Err(WireError::FrameLength(frame_len));
    }
    if payload_len != frame_len + FRAME_OVERHEAD {
        return Err(WireError::LengthField);
    }

    let crc_offset = 2 + frame_len;
    let computed = crc32c(&payload[..crc_offset]);
    let received = u32::from_be_bytes([
        payload[crc_offset],
        payload[crc_offset + 1],
        payload[crc_offset + 2],
        payload[crc_offset + 3],
    ]);
    if computed != received {
        return Err(WireError::Checksum);
    }

    if frame_len > l2.len() {
        return Err(WireError::Capacity);
    }
    l2[..frame_len].copy_from_slice(&payload[2..crc_offset]);
    Ok(frame_len)
}
