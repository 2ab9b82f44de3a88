//! CRC-32C (Castagnoli) helpers for frame integrity.
//!
//! Polynomial 0x1EDC6F41 (bit-reflected 0x82F63B78), initial value and
//! final XOR 0xFFFFFFFF. Castagnoli detects the burst errors common on
//! serial links better than CRC-32 IEEE.

/// Compute CRC-32C over `data`.
pub fn crc32c(data: &[u8]) -> u32 {
    ::crc32c::crc32c(data)
}

/// Continue a CRC-32C over additional data.
///
/// `crc` is the value returned by [`crc32c`] or a previous call; the result
/// equals the one-shot checksum over the concatenated input.
pub fn crc32c_extend(crc: u32, data: &[u8]) -> u32 {
    ::crc32c::crc32c_append(crc, data)
}
