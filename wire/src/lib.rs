//! Wire framing for the serial leg of a bm-sbc mesh node.
//!
//! This crate implements the byte-reversible framing used to carry L2
//! Ethernet frames over a raw serial byte stream:
//!
//! ```text
//! [ stuffed( len_be16 | L2 bytes | crc32c_be over (len_be16 | L2 bytes) ) ] [0x00]
//! ```
//!
//! - **Byte stuffing**: the encoded body contains no `0x00` byte, so `0x00`
//!   can serve as an unambiguous frame terminator.
//! - **CRC-32C**: Castagnoli checksum over the length prefix and the L2
//!   payload, serialized big-endian.
//! - **Frame codec**: length validation, checksum verification, and
//!   terminator handling in one encode/decode pair.
//!
//! All operations work on caller-provided slices and fail with a typed
//! [`WireError`] instead of writing past a bound.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checksum;
pub mod error;
pub mod frame;
pub mod stuffing;

pub use checksum::{crc32c, crc32c_extend};
pub use error::WireError;
pub use frame::{decode, encode, FRAME_OVERHEAD, MAX_L2_FRAME, MAX_WIRE_FRAME};
pub use stuffing::{max_stuffed_len, stuff, unstuff};
