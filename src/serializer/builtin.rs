//! Built-in serializers

use std::any::type_name;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::buffer::{DataInput, DataOutput};
use crate::error::{AtlasError, Result};

use super::{Serializer, SerializerId};

pub const LONG: LongSerializer = LongSerializer;
pub const INTEGER: IntegerSerializer = IntegerSerializer;
pub const BOOLEAN: BooleanSerializer = BooleanSerializer;
pub const DOUBLE: DoubleSerializer = DoubleSerializer;
pub const STRING: StringSerializer = StringSerializer;
pub const BYTE_ARRAY: ByteArraySerializer = ByteArraySerializer;
pub const UNIT: UnitSerializer = UnitSerializer;
pub const RAW: RawSerializer = RawSerializer;

// =============================================================================
// Fixed-width
// =============================================================================

/// `i64`, 8 bytes big-endian
#[derive(Debug, Clone, Copy, Default)]
pub struct LongSerializer;

impl Serializer<i64> for LongSerializer {
    fn serialize(&self, out: &mut DataOutput, value: &i64) -> Result<()> {
        out.write_i64(*value);
        Ok(())
    }

    fn deserialize(&self, input: &mut DataInput<'_>, _available: usize) -> Result<i64> {
        input.read_i64()
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(8)
    }

    fn id(&self) -> SerializerId {
        SerializerId::Long
    }
}

/// `i32`, 4 bytes big-endian
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerSerializer;

impl Serializer<i32> for IntegerSerializer {
    fn serialize(&self, out: &mut DataOutput, value: &i32) -> Result<()> {
        out.write_i32(*value);
        Ok(())
    }

    fn deserialize(&self, input: &mut DataInput<'_>, _available: usize) -> Result<i32> {
        input.read_i32()
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(4)
    }

    fn id(&self) -> SerializerId {
        SerializerId::Integer
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BooleanSerializer;

impl Serializer<bool> for BooleanSerializer {
    fn serialize(&self, out: &mut DataOutput, value: &bool) -> Result<()> {
        out.write_bool(*value);
        Ok(())
    }

    fn deserialize(&self, input: &mut DataInput<'_>, _available: usize) -> Result<bool> {
        input.read_bool()
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(1)
    }

    fn id(&self) -> SerializerId {
        SerializerId::Boolean
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DoubleSerializer;

impl Serializer<f64> for DoubleSerializer {
    fn serialize(&self, out: &mut DataOutput, value: &f64) -> Result<()> {
        out.write_f64(*value);
        Ok(())
    }

    fn deserialize(&self, input: &mut DataInput<'_>, _available: usize) -> Result<f64> {
        input.read_f64()
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(8)
    }

    fn id(&self) -> SerializerId {
        SerializerId::Double
    }
}

/// Zero bytes; the value type of sets
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitSerializer;

impl Serializer<()> for UnitSerializer {
    fn serialize(&self, _out: &mut DataOutput, _value: &()) -> Result<()> {
        Ok(())
    }

    fn deserialize(&self, _input: &mut DataInput<'_>, _available: usize) -> Result<()> {
        Ok(())
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(0)
    }

    fn id(&self) -> SerializerId {
        SerializerId::Unit
    }
}

// =============================================================================
// Length-prefixed
// =============================================================================

/// UTF-8 with a varint length prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialize(&self, out: &mut DataOutput, value: &String) -> Result<()> {
        out.write_blob(value.as_bytes());
        Ok(())
    }

    fn deserialize(&self, input: &mut DataInput<'_>, _available: usize) -> Result<String> {
        let bytes = input.read_blob()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| AtlasError::Corruption(format!("invalid UTF-8 in string: {}", e)))
    }

    fn id(&self) -> SerializerId {
        SerializerId::String
    }
}

/// Byte array with a varint length prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteArraySerializer;

impl Serializer<Vec<u8>> for ByteArraySerializer {
    fn serialize(&self, out: &mut DataOutput, value: &Vec<u8>) -> Result<()> {
        out.write_blob(value);
        Ok(())
    }

    fn deserialize(&self, input: &mut DataInput<'_>, _available: usize) -> Result<Vec<u8>> {
        Ok(input.read_blob()?.to_vec())
    }

    fn id(&self) -> SerializerId {
        SerializerId::ByteArray
    }
}

/// Unframed bytes: consumes exactly `available` bytes.
///
/// Only valid where the caller already knows the value's extent, such as
/// node blobs that carry their own length.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSerializer;

impl Serializer<Vec<u8>> for RawSerializer {
    fn serialize(&self, out: &mut DataOutput, value: &Vec<u8>) -> Result<()> {
        out.write_bytes(value);
        Ok(())
    }

    fn deserialize(&self, input: &mut DataInput<'_>, available: usize) -> Result<Vec<u8>> {
        Ok(input.read_slice(available)?.to_vec())
    }

    fn id(&self) -> SerializerId {
        SerializerId::Raw
    }
}

/// Any serde type, bincode-encoded with a varint length prefix
pub struct Bincode<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Bincode<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Bincode<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Bincode<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Serializer<T> for Bincode<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, out: &mut DataOutput, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        out.write_blob(&bytes);
        Ok(())
    }

    fn deserialize(&self, input: &mut DataInput<'_>, _available: usize) -> Result<T> {
        let bytes = input.read_blob()?;
        bincode::deserialize(bytes)
            .map_err(|e| AtlasError::Corruption(format!("bincode value: {}", e)))
    }

    fn id(&self) -> SerializerId {
        SerializerId::Bincode(type_name::<T>().to_string())
    }
}
