//! Wire framing error types.

use thiserror::Error;

/// Framing errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Output slice too small for the result
    #[error("output buffer too small")]
    Capacity,

    /// Malformed byte-stuffed data (zero code byte, zero inside a block,
    /// or a declared run past the end of input)
    #[error("malformed stuffed data")]
    Stuffing,

    /// L2 length outside the supported range
    #[error("frame length {0} out of range")]
    FrameLength(usize),

    /// Length prefix disagrees with the decoded byte count
    #[error("length field mismatch")]
    LengthField,

    /// Checksum verification failed
    #[error("checksum mismatch")]
    Checksum,

    /// Frame shorter than the fixed overhead
    #[error("frame too short")]
    Truncated,
}
