//! Byte-level encoding used by the wire protocol and block blobs.
//!
//! Fixed-width integers are little-endian; collection lengths use a
//! LEB128-style varint. Decoding is bounds-checked and never panics.

use thiserror::Error;

use crate::primitives::{Hash, HASH_SIZE};

/// Largest varint-prefixed collection we will allocate for.
pub const MAX_COLLECTION_LEN: u64 = 50_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEnd(usize),
    #[error("varint longer than 10 bytes")]
    VarintOverflow,
    #[error("collection length {0} exceeds limit")]
    OversizedCollection(u64),
    #[error("{0}")]
    Invalid(&'static str),
}

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_varint(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_hash(&mut self, hash: &Hash) {
        self.buf.extend_from_slice(hash.as_bytes());
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEnd(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes(raw.try_into().unwrap()))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        let raw = self.take(8)?;
        Ok(u64::from_le_bytes(raw.try_into().unwrap()))
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let mut value: u64 = 0;
        for shift in (0..64).step_by(7) {
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DecodeError::VarintOverflow)
    }

    /// Varint length prefix for a collection, checked against the cap.
    pub fn read_len(&mut self) -> Result<usize, DecodeError> {
        let len = self.read_varint()?;
        if len > MAX_COLLECTION_LEN {
            return Err(DecodeError::OversizedCollection(len));
        }
        Ok(len as usize)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.take(n)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_len()?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_hash(&mut self) -> Result<Hash, DecodeError> {
        let raw = self.take(HASH_SIZE)?;
        Ok(Hash(raw.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::sha256;

    #[test]
    fn varint_round_trip() {
        for v in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut enc = Encoder::new();
            enc.write_varint(v);
            let buf = enc.into_inner();
            let mut dec = Decoder::new(&buf);
            assert_eq!(dec.read_varint().unwrap(), v);
            assert!(dec.is_empty());
        }
    }

    #[test]
    fn mixed_fields_round_trip() {
        let h = sha256(b"field");
        let mut enc = Encoder::new();
        enc.write_u8(7);
        enc.write_u32_le(0xdead_beef);
        enc.write_u64_le(42);
        enc.write_hash(&h);
        enc.write_var_bytes(b"payload");
        let buf = enc.into_inner();

        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.read_u8().unwrap(), 7);
        assert_eq!(dec.read_u32_le().unwrap(), 0xdead_beef);
        assert_eq!(dec.read_u64_le().unwrap(), 42);
        assert_eq!(dec.read_hash().unwrap(), h);
        assert_eq!(dec.read_var_bytes().unwrap(), b"payload");
        assert!(dec.is_empty());
    }

    #[test]
    fn truncated_input_errors() {
        let mut enc = Encoder::new();
        enc.write_u64_le(1);
        let buf = enc.into_inner();
        let mut dec = Decoder::new(&buf[..3]);
        assert!(matches!(
            dec.read_u64_le(),
            Err(DecodeError::UnexpectedEnd(_))
        ));
    }

    #[test]
    fn oversized_collection_rejected() {
        let mut enc = Encoder::new();
        enc.write_varint(MAX_COLLECTION_LEN + 1);
        let buf = enc.into_inner();
        let mut dec = Decoder::new(&buf);
        assert!(matches!(
            dec.read_len(),
            Err(DecodeError::OversizedCollection(_))
        ));
    }
}
