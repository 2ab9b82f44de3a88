//! Byte stuffing (COBS) for zero-delimited framing.
//!
//! Encodes arbitrary byte strings so that `0x00` never appears in the
//! output. The encoding is a sequence of blocks: one code byte equal to
//! (data-bytes-in-block + 1), followed by up to 254 non-zero data bytes. A
//! zero in the source ends the current block; a full 254-byte run emits code
//! `0xFF` and consumes no zero.

use crate::WireError;

/// Longest run of data bytes a single block can carry.
const MAX_RUN: u8 = 0xFF;

/// Worst-case stuffed length for `len` source bytes.
///
/// One code byte per started 254-byte run, plus the leading code byte.
pub const fn max_stuffed_len(len: usize) -> usize {
    len + len / 254 + 1
}

/// Stuff `src` into `dst`, returning the number of bytes written.
///
/// The output contains no zero byte. Fails with [`WireError::Capacity`]
/// when `dst` cannot hold the encoding.
pub fn stuff(dst: &mut [u8], src: &[u8]) -> Result<usize, WireError> {
    if dst.is_empty() {
        return Err(WireError::Capacity);
    }

    let mut out = 1; // first code byte is reserved at dst[0]
    let mut code_idx = 0;
    let mut code: u8 = 1;

    for (i, &byte) in src.iter().enumerate() {
        let last = i + 1 == src.len();
        if byte == 0 {
            // Zero ends the block; its value is implied by the code byte.
            dst[code_idx] = code;
            code_idx = out;
            code = 1;
            if out >= dst.len() {
                return Err(WireError::Capacity);
            }
            out += 1;
        } else {
            if out >= dst.len() {
                return Err(WireError::Capacity);
            }
            dst[out] = byte;
            out += 1;
            code += 1;
            if code == MAX_RUN {
                // 254 data bytes without a zero: close the block early.
                dst[code_idx] = code;
                if last {
                    return Ok(out);
                }
                code_idx = out;
                code = 1;
                if out >= dst.len() {
                    return Err(WireError::Capacity);
                }
                out += 1;
            }
        }
    }

    dst[code_idx] = code;
    Ok(out)
}

/// Unstuff `src` into `dst`, returning the number of bytes written.
///
/// `src` must not include the trailing `0x00` terminator. Fails with
/// [`WireError::Stuffing`] on a zero code byte, a zero inside a block, or a
/// run that extends past the end of input.
pub fn unstuff(dst: &mut [u8], src: &[u8]) -> Result<usize, WireError> {
    if src.is_empty() {
        return Err(WireError::Stuffing);
    }

    let mut out = 0;
    let mut idx = 0;

    while idx < src.len() {
        let code = src[idx];
        idx += 1;
        if code == 0 {
            return Err(WireError::Stuffing);
        }

        let run = (code - 1) as usize;
        if idx + run > src.len() {
            return Err(WireError::Stuffing);
        }

        for _ in 0..run {
            let byte = src[idx];
            idx += 1;
            if byte == 0 {
                return Err(WireError::Stuffing);
            }
            if out >= dst.len() {
                return Err(WireError::Capacity);
            }
            dst[out] = byte;
            out += 1;
        }

        // A block shorter than the maximum run implies a zero, unless it
        // was the final block.
        if code < MAX_RUN && idx < src.len() {
            if out >= dst.len() {
                return Err(WireError::Capacity);
            }
            dst[out] = 0;
            out += 1;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(src: &[u8]) -> Vec<u8> {
        let mut stuffed = vec![0u8; max_stuffed_len(src.len())];
        let n = stuff(&mut stuffed, src).unwrap();
        assert!(
            stuffed[..n].iter().all(|&b| b != 0),
            "stuffed output contains a zero byte"
        );
        assert!(n <= max_stuffed_len(src.len()));

        let mut plain = vec![0u8; src.len()];
        let m = unstuff(&mut plain, &stuffed[..n]).unwrap();
        plain.truncate(m);
        plain
    }

    #[test]
    fn test_roundtrip_empty() {
        assert_eq!(roundtrip(&[]), Vec::<u8>::new());
    }

    #[test]
    fn test_roundtrip_all_zero() {
        for len in 1..16 {
            let src = vec![0u8; len];
            assert_eq!(roundtrip(&src), src);
        }
    }

    #[test]
    fn test_roundtrip_no_zero() {
        let src: Vec<u8> = (1..=255u8).collect();
        assert_eq!(roundtrip(&src), src);
    }

    #[test]
    fn test_roundtrip_mixed() {
        let src = [0, 1, 0, 2, 3, 0, 0, 4, 255, 0];
        assert_eq!(roundtrip(&src), src);
    }

    #[test]
    fn test_roundtrip_long_runs() {
        // Lengths around the 254-byte block boundary are the edge cases.
        for len in [253usize, 254, 255, 256, 508, 509, 1024] {
            let src: Vec<u8> = (0..len).map(|i| (i % 255 + 1) as u8).collect();
            assert_eq!(roundtrip(&src), src);

            let mut with_zeros = src.clone();
            with_zeros[len / 2] = 0;
            assert_eq!(roundtrip(&with_zeros), with_zeros);
        }
    }

    #[test]
    fn test_exact_run_encoding() {
        // 254 non-zero bytes encode as one 0xFF block with no trailing code.
        let src = [7u8; 254];
        let mut stuffed = vec![0u8; max_stuffed_len(src.len())];
        let n = stuff(&mut stuffed, &src).unwrap();
        assert_eq!(n, 255);
        assert_eq!(stuffed[0], 0xFF);
    }

    #[test]
    fn test_stuff_buffer_one_byte_short() {
        for src in [vec![1u8; 10], vec![0u8; 10], (0..300).map(|i| i as u8).collect()] {
            let mut exact = vec![0u8; max_stuffed_len(src.len())];
            let n = stuff(&mut exact, &src).unwrap();

            let mut short = vec![0u8; n - 1];
            assert_eq!(stuff(&mut short, &src), Err(WireError::Capacity));
        }
    }

    #[test]
    fn test_unstuff_rejects_zero_code() {
        let mut dst = [0u8; 16];
        assert_eq!(unstuff(&mut dst, &[0x00]), Err(WireError::Stuffing));
        assert_eq!(unstuff(&mut dst, &[0x03, 1, 0x00]), Err(WireError::Stuffing));
    }

    #[test]
    fn test_unstuff_rejects_truncated_run() {
        let mut dst = [0u8; 16];
        assert_eq!(unstuff(&mut dst, &[0x05, 1, 2]), Err(WireError::Stuffing));
    }

    #[test]
    fn test_unstuff_rejects_empty() {
        let mut dst = [0u8; 16];
        assert_eq!(unstuff(&mut dst, &[]), Err(WireError::Stuffing));
    }
}
