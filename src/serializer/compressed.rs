//! LZ4 compression, as a serializer wrapper and as a block codec for the
//! compression engine layer.

use crate::buffer::{DataInput, DataOutput};
use crate::error::{AtlasError, Result};

use super::{Serializer, SerializerId};

/// Block tag: bytes stored as given
const TAG_PLAIN: u8 = 0;

/// Block tag: LZ4 block with a 4-byte little-endian uncompressed length
const TAG_LZ4: u8 = 1;

/// Upper bound on how far an LZ4 block can expand
const MAX_EXPANSION: usize = 255;

/// Compresses the encoding of an inner serializer
#[derive(Debug, Clone, Default)]
pub struct Compressed<S> {
    inner: S,
}

impl<S> Compressed<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<T, S: Serializer<T>> Serializer<T> for Compressed<S> {
    fn serialize(&self, out: &mut DataOutput, value: &T) -> Result<()> {
        let mut plain = DataOutput::new();
        self.inner.serialize(&mut plain, value)?;
        let packed = lz4_flex::compress_prepend_size(plain.as_slice());
        out.write_blob(&packed);
        Ok(())
    }

    fn deserialize(&self, input: &mut DataInput<'_>, _available: usize) -> Result<T> {
        let packed = input.read_blob()?;
        let plain = decompress(packed)?;
        let mut plain_input = DataInput::new(&plain);
        let value = self.inner.deserialize(&mut plain_input, plain.len())?;
        if plain_input.remaining() != 0 {
            return Err(AtlasError::Corruption(format!(
                "{} trailing bytes after compressed value",
                plain_input.remaining()
            )));
        }
        Ok(value)
    }

    fn id(&self) -> SerializerId {
        SerializerId::Compressed(Box::new(self.inner.id()))
    }
}

/// Encode a record for the compression layer. Falls back to the plain
/// bytes when LZ4 does not make them smaller.
pub(crate) fn pack_block(data: &[u8]) -> Vec<u8> {
    let compressed = lz4_flex::compress_prepend_size(data);
    if compressed.len() < data.len() {
        let mut out = Vec::with_capacity(1 + compressed.len());
        out.push(TAG_LZ4);
        out.extend_from_slice(&compressed);
        out
    } else {
        let mut out = Vec::with_capacity(1 + data.len());
        out.push(TAG_PLAIN);
        out.extend_from_slice(data);
        out
    }
}

/// Decode a record written by [`pack_block`]. Empty input is an empty record
/// (a preallocated handle that was never written).
pub(crate) fn unpack_block(block: &[u8]) -> Result<Vec<u8>> {
    let Some((&tag, body)) = block.split_first() else {
        return Ok(Vec::new());
    };
    match tag {
        TAG_PLAIN => Ok(body.to_vec()),
        TAG_LZ4 => decompress(body),
        other => Err(AtlasError::Corruption(format!(
            "unknown compression tag: {}",
            other
        ))),
    }
}

/// Decompress a size-prefixed LZ4 block, refusing a prefix the block
/// could not possibly expand to
fn decompress(packed: &[u8]) -> Result<Vec<u8>> {
    let Some(prefix) = packed.get(..4) else {
        return Err(AtlasError::Corruption(format!(
            "lz4 block of {} bytes has no size prefix",
            packed.len()
        )));
    };
    let claimed = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    let body = packed.len() - 4;
    if claimed > body.saturating_mul(MAX_EXPANSION) {
        return Err(AtlasError::Corruption(format!(
            "lz4 block claims {} bytes from {} compressed",
            claimed, body
        )));
    }
    lz4_flex::decompress_size_prepended(packed)
        .map_err(|e| AtlasError::Corruption(format!("lz4 block: {}", e)))
}
