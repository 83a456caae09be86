//! Compressed unsigned integers.
//!
//! Seven payload bits per byte, least significant group first, the high bit
//! marks a continuation. Small counts (tree sizes, entry counts, key lengths)
//! take a single byte.

use super::EncodingError;
use crate::error::Result;

/// Longest encoding of a u64.
pub const MAX_VARINT_LEN: usize = 10;

pub fn write_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Decodes a value from the front of `buf`, returning it with the number of
/// bytes consumed.
pub fn read_u64(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        let bits = (byte & 0x7f) as u64;
        if i == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(EncodingError::Overflow.into());
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        Err(EncodingError::Overflow.into())
    } else {
        Err(EncodingError::TruncatedData.into())
    }
}

pub fn encoded_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Sequential reader over a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let (value, len) = read_u64(&self.buf[self.pos..])?;
        self.pos += len;
        Ok(value)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(EncodingError::TruncatedData)?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Reads a length-prefixed byte string.
    pub fn read_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u64()? as usize;
        self.read_bytes(len)
    }
}

pub fn write_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}
