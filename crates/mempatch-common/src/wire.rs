//! Little-endian length-prefixed serialisation used on the control channel.
//!
//! Layout rules:
//!
//! - Integers are raw little-endian.
//! - `usize` values (lengths, counts, RVAs) occupy **4 bytes** on the wire.
//!   The patch targets are 32-bit processes and both peers must agree on one
//!   width, so a length above `u32::MAX` is rejected at encode time.
//! - Byte-like containers are `u32 byte_length || bytes`; strings are the
//!   byte-like form of their UTF-8.
//! - Containers of serialisable elements are
//!   `u32 element_count || repeat(u32 element_byte_length || element_bytes)`.
//! - Enum discriminants are `u32` in declaration order, `Blank` at 0.

use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Types with a control-channel wire representation.
pub trait Wire: Sized {
    fn encode(&self, out: &mut Vec<u8>);
    fn decode(r: &mut WireReader<'_>) -> Result<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1024);
        self.encode(&mut out);
        out
    }

    /// Decode from a standalone buffer. Trailing bytes are tolerated: nested
    /// entities are carried inside length-prefixed blocks and decode only
    /// their own fields.
    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(data);
        Self::decode(&mut r)
    }
}

/// Cursor over a received byte buffer. Every read is bounds-checked and a
/// short buffer surfaces as [`Error::Truncated`].
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(Error::Truncated {
                needed: count - self.remaining(),
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buf))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// A `usize` travels as 4 bytes (see module docs).
    pub fn size(&mut self) -> Result<usize> {
        Ok(self.u32()? as usize)
    }

    /// Byte-like container: `u32 byte_length || bytes`.
    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.size()?;
        Ok(self.take(len)?.to_vec())
    }

    /// Exactly `count` raw bytes with no length prefix.
    pub fn raw(&mut self, count: usize) -> Result<Vec<u8>> {
        Ok(self.take(count)?.to_vec())
    }

    /// A length-prefixed block holding a nested entity's encoding.
    pub fn block(&mut self) -> Result<&'a [u8]> {
        let len = self.size()?;
        self.take(len)
    }

    pub fn string(&mut self) -> Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes).map_err(|e| Error::protocol(format!("invalid UTF-8: {}", e)))
    }

    /// Set of `usize` serialised as a byte-like container of raw `u32`s.
    pub fn size_set(&mut self) -> Result<BTreeSet<usize>> {
        let byte_len = self.size()?;
        if byte_len % 4 != 0 {
            return Err(Error::protocol(format!(
                "integral set byte length {} is not a multiple of 4",
                byte_len
            )));
        }
        let mut set = BTreeSet::new();
        for _ in 0..byte_len / 4 {
            set.insert(self.u32()? as usize);
        }
        Ok(set)
    }

    /// Decode a nested entity out of its length-prefixed block.
    pub fn entity<T: Wire>(&mut self) -> Result<T> {
        let block = self.block()?;
        T::from_bytes(block)
    }

    /// Container of serialisable elements.
    pub fn entities<T: Wire>(&mut self) -> Result<Vec<T>> {
        let count = self.size()?;
        let mut result = Vec::new();
        for _ in 0..count {
            result.push(self.entity::<T>()?);
        }
        Ok(result)
    }

    pub fn strings(&mut self) -> Result<Vec<String>> {
        let count = self.size()?;
        let mut result = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            result.push(self.string()?);
        }
        Ok(result)
    }
}

pub fn put_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

pub fn put_bool(out: &mut Vec<u8>, value: bool) {
    out.push(value as u8);
}

pub fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn put_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn put_size(out: &mut Vec<u8>, value: usize) {
    debug_assert!(value <= u32::MAX as usize);
    put_u32(out, value as u32);
}

pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_size(out, bytes.len());
    out.extend_from_slice(bytes);
}

pub fn put_string(out: &mut Vec<u8>, value: &str) {
    put_bytes(out, value.as_bytes());
}

pub fn put_size_set(out: &mut Vec<u8>, set: &BTreeSet<usize>) {
    put_size(out, set.len() * 4);
    for value in set {
        put_u32(out, *value as u32);
    }
}

pub fn put_entity<T: Wire>(out: &mut Vec<u8>, entity: &T) {
    put_bytes(out, &entity.to_bytes());
}

pub fn put_entities<T: Wire>(out: &mut Vec<u8>, entities: &[T]) {
    put_size(out, entities.len());
    for entity in entities {
        put_entity(out, entity);
    }
}

pub fn put_strings(out: &mut Vec<u8>, strings: &[String]) {
    put_size(out, strings.len());
    for s in strings {
        put_string(out, s);
    }
}
