//! Header length prefix of a wire message.
//!
//! The prefix is an unsigned LEB128 varint: 7 data bits per byte, least
//! significant group first, high bit set on every byte except the last.

use crate::error::DecodeError;

/// Maximum number of bytes the header length prefix may occupy.
pub const MAX_HEADER_LENGTH_BYTES: usize = 6;

/// Decode the header length prefix at the start of `buf`.
///
/// Returns `(header_len, bytes_consumed)`.
///
/// # Errors
///
/// [`DecodeError::MalformedLengthPrefix`] if no terminating byte is found
/// within [`MAX_HEADER_LENGTH_BYTES`], or if `buf` ends before one is found.
pub fn decode_header_length(buf: &[u8]) -> Result<(u64, usize), DecodeError> {
    let mut value: u64 = 0;

    for (i, &byte) in buf.iter().take(MAX_HEADER_LENGTH_BYTES).enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }

    Err(DecodeError::MalformedLengthPrefix {
        prefix: buf[..buf.len().min(MAX_HEADER_LENGTH_BYTES)].to_vec(),
    })
}

/// Append `value` as an unsigned LEB128 varint.
pub fn encode_length(mut value: u64, out: &mut Vec<u8>) {
    while value > 0x7F {
        out.push(0x80 | (value as u8 & 0x7F));
        value >>= 7;
    }
    out.push(value as u8);
}

/// Number of bytes [`encode_length`] writes for `value`.
pub fn encoded_len(value: u64) -> usize {
    let mut n = 1;
    let mut v = value >> 7;
    while v != 0 {
        n += 1;
        v >>= 7;
    }
    n
}
