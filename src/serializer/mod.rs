//! Serializer Module
//!
//! Converts typed values to and from bytes. One serializer is bound to each
//! collection key/value at creation time and recorded in the catalog by its
//! [`SerializerId`].
//!
//! ## Responsibilities
//! - Self-delimiting, deterministic encodings (equal values give equal bytes,
//!   since hash collections compare serialized keys)
//! - Constant width for fixed-size types
//! - `Corruption` on truncated input or invalid tags
//!
//! ## Registry
//! There is no lookup by type name at runtime. `SerializerId` is the tag that
//! gets persisted, and [`DefaultSerializer`] maps a Rust type to the factory
//! for its default serializer.

mod builtin;
mod compressed;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::{DataInput, DataOutput};
use crate::error::{AtlasError, Result};

pub use builtin::{
    Bincode, BooleanSerializer, ByteArraySerializer, DoubleSerializer, IntegerSerializer,
    LongSerializer, RawSerializer, StringSerializer, UnitSerializer, BOOLEAN, BYTE_ARRAY,
    DOUBLE, INTEGER, LONG, RAW, STRING, UNIT,
};
pub use compressed::Compressed;
pub(crate) use compressed::{pack_block, unpack_block};

/// Persisted descriptor of a serializer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerializerId {
    Long,
    Integer,
    Boolean,
    Double,
    String,
    ByteArray,
    Unit,
    /// Unframed bytes; only used for byte-level collection access
    Raw,
    /// serde/bincode encoding of the named Rust type
    Bincode(String),
    /// LZ4 wrapper around another serializer
    Compressed(Box<SerializerId>),
}

/// Converts values of `T` to and from bytes
pub trait Serializer<T>: Send + Sync {
    /// Append the encoding of `value` to `out`
    fn serialize(&self, out: &mut DataOutput, value: &T) -> Result<()>;

    /// Read one value; `available` is the number of bytes the caller knows
    /// belong to this value
    fn deserialize(&self, input: &mut DataInput<'_>, available: usize) -> Result<T>;

    /// Encoded width when it is the same for every value
    fn fixed_size(&self) -> Option<usize> {
        None
    }

    fn id(&self) -> SerializerId;
}

impl<T, S: Serializer<T> + ?Sized> Serializer<T> for Arc<S> {
    fn serialize(&self, out: &mut DataOutput, value: &T) -> Result<()> {
        (**self).serialize(out, value)
    }

    fn deserialize(&self, input: &mut DataInput<'_>, available: usize) -> Result<T> {
        (**self).deserialize(input, available)
    }

    fn fixed_size(&self) -> Option<usize> {
        (**self).fixed_size()
    }

    fn id(&self) -> SerializerId {
        (**self).id()
    }
}

/// Serialize a single value into a fresh buffer
pub fn to_bytes<T, S: Serializer<T> + ?Sized>(serializer: &S, value: &T) -> Result<Vec<u8>> {
    let mut out = match serializer.fixed_size() {
        Some(n) => DataOutput::with_capacity(n),
        None => DataOutput::new(),
    };
    serializer.serialize(&mut out, value)?;
    Ok(out.into_vec())
}

/// Deserialize a value that must occupy all of `bytes`
pub fn from_bytes<T, S: Serializer<T> + ?Sized>(serializer: &S, bytes: &[u8]) -> Result<T> {
    let mut input = DataInput::new(bytes);
    let value = serializer.deserialize(&mut input, bytes.len())?;
    if input.remaining() != 0 {
        return Err(AtlasError::Corruption(format!(
            "{} trailing bytes after {:?} value",
            input.remaining(),
            serializer.id()
        )));
    }
    Ok(value)
}

/// Types with a built-in serializer
pub trait DefaultSerializer: Sized + 'static {
    fn default_serializer() -> Arc<dyn Serializer<Self>>;
}

impl DefaultSerializer for i64 {
    fn default_serializer() -> Arc<dyn Serializer<Self>> {
        Arc::new(LONG)
    }
}

impl DefaultSerializer for i32 {
    fn default_serializer() -> Arc<dyn Serializer<Self>> {
        Arc::new(INTEGER)
    }
}

impl DefaultSerializer for bool {
    fn default_serializer() -> Arc<dyn Serializer<Self>> {
        Arc::new(BOOLEAN)
    }
}

impl DefaultSerializer for f64 {
    fn default_serializer() -> Arc<dyn Serializer<Self>> {
        Arc::new(DOUBLE)
    }
}

impl DefaultSerializer for String {
    fn default_serializer() -> Arc<dyn Serializer<Self>> {
        Arc::new(STRING)
    }
}

impl DefaultSerializer for Vec<u8> {
    fn default_serializer() -> Arc<dyn Serializer<Self>> {
        Arc::new(BYTE_ARRAY)
    }
}

impl DefaultSerializer for () {
    fn default_serializer() -> Arc<dyn Serializer<Self>> {
        Arc::new(UNIT)
    }
}
