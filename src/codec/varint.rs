//! Unsigned LEB128 varints, zigzag integers and length-prefixed strings.

use super::error::{CodecError, FramingError, ProtocolError};
use crate::buffer::Buffer;

/// Longest encoding of a `u32`.
pub const MAX_U32_LEN: usize = 5;
/// Longest encoding of a `u64`.
pub const MAX_U64_LEN: usize = 10;

/// Append `value` to `out`.
pub fn put_uvarint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Decode a varint at the start of `data`.
///
/// Returns `Ok(None)` when `data` ends mid-varint, otherwise the value and
/// the bytes it occupied.
///
/// # Errors
///
/// Fails if the varint is longer than ten bytes or overflows.
pub fn uvarint(data: &[u8]) -> Result<Option<(u64, usize)>, FramingError> {
    let mut value = 0_u64;
    for (i, &byte) in data.iter().take(MAX_U64_LEN).enumerate() {
        let bits = u64::from(byte & 0x7f);
        if i == MAX_U64_LEN - 1 && byte > 1 {
            return Err(FramingError::InvalidLengthEncoding);
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if data.len() >= MAX_U64_LEN {
        return Err(FramingError::InvalidLengthEncoding);
    }
    Ok(None)
}

/// Map signed to unsigned so small magnitudes stay short.
#[must_use]
pub fn zigzag(v: i64) -> u64 { ((v << 1) ^ (v >> 63)) as u64 }

/// Inverse of [`zigzag`].
#[must_use]
pub fn unzigzag(v: u64) -> i64 { ((v >> 1) as i64) ^ -((v & 1) as i64) }

/// Append a length-prefixed UTF-8 string.
pub fn put_str(out: &mut Vec<u8>, s: &str) {
    put_uvarint(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

/// Read a varint from the cursor of a complete frame.
///
/// # Errors
///
/// Fails if the frame ends mid-varint.
pub fn read_uvarint(buf: &mut Buffer) -> Result<u64, FramingError> {
    let mut head = [0_u8; MAX_U64_LEN];
    let n = buf.peek(&mut head);
    let (value, used) = uvarint(&head[..n])?.ok_or(FramingError::Truncated("varint"))?;
    bytes::Buf::advance(buf, used);
    Ok(value)
}

/// Read a varint that must fit in `u32`.
///
/// # Errors
///
/// Fails if the frame ends mid-varint or the value is too large.
pub fn read_u32(buf: &mut Buffer) -> Result<u32, FramingError> {
    u32::try_from(read_uvarint(buf)?).map_err(|_| FramingError::InvalidLengthEncoding)
}

/// Read a length-prefixed UTF-8 string.
///
/// # Errors
///
/// Fails on truncation or invalid UTF-8.
pub fn read_str(buf: &mut Buffer, field: &'static str) -> Result<String, CodecError> {
    let len = usize::try_from(read_uvarint(buf)?).map_err(|_| FramingError::InvalidLengthEncoding)?;
    if buf.available() < len {
        return Err(FramingError::Truncated(field).into());
    }
    let bytes = buf
        .read_n(len)
        .map_err(|_| FramingError::Truncated(field))?
        .bytes();
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8(field).into())
}
