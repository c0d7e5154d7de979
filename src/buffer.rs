//! DataOutput / DataInput
//!
//! Growable output buffer and bounds-checked input cursor shared by the
//! serializers, the collection node codecs and the store record formats.
//!
//! Fixed-width integers are big-endian. `pack_*` writes an unsigned LEB128
//! varint (7 bits per byte, high bit = continuation).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{AtlasError, Result};

/// Longest valid varint for a u64
const MAX_VARINT_LEN: usize = 10;

// =============================================================================
// DataOutput
// =============================================================================

/// Growable byte buffer written by serializers
#[derive(Debug, Default, Clone)]
pub struct DataOutput {
    buf: BytesMut,
}

impl DataOutput {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_f64(v);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Write an unsigned varint
    pub fn pack_u64(&mut self, mut v: u64) {
        while v >= 0x80 {
            self.buf.put_u8((v as u8 & 0x7F) | 0x80);
            v >>= 7;
        }
        self.buf.put_u8(v as u8);
    }

    pub fn pack_u32(&mut self, v: u32) {
        self.pack_u64(v as u64);
    }

    /// Write a varint length followed by the bytes
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.pack_u64(bytes.len() as u64);
        self.buf.put_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

// =============================================================================
// DataInput
// =============================================================================

/// Cursor over a byte slice; every read is bounds-checked
#[derive(Debug, Clone)]
pub struct DataInput<'a> {
    buf: &'a [u8],
    total: usize,
}

impl<'a> DataInput<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            total: buf.len(),
        }
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.total - self.buf.len()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(AtlasError::Corruption(format!(
                "truncated input reading {}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(AtlasError::Corruption(format!(
                "invalid boolean tag: {}",
                other
            ))),
        }
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.need(8, "i64")?;
        Ok(self.buf.get_i64())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.need(8, "f64")?;
        Ok(self.buf.get_f64())
    }

    /// Borrow the next `n` bytes
    pub fn read_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n, "byte run")?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Read an unsigned varint
    pub fn unpack_u64(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7F) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(AtlasError::Corruption("varint longer than 10 bytes".to_string()))
    }

    pub fn unpack_u32(&mut self) -> Result<u32> {
        let v = self.unpack_u64()?;
        u32::try_from(v)
            .map_err(|_| AtlasError::Corruption(format!("varint {} overflows u32", v)))
    }

    /// Read a varint length followed by that many bytes
    pub fn read_blob(&mut self) -> Result<&'a [u8]> {
        let len = self.unpack_u64()? as usize;
        self.read_slice(len)
    }
}

// =============================================================================
// Tests
// =============================================================================
