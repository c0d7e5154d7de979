//! Tests for the built-in serializers
//!
//! These tests verify:
//! - Values survive serialize/deserialize for every built-in
//! - Fixed widths and persisted ids
//! - Malformed input is corruption, never a partial value

use std::sync::Arc;

use atlasdb::serializer::{
    from_bytes, to_bytes, Bincode, Compressed, BOOLEAN, BYTE_ARRAY, DOUBLE, INTEGER, LONG, RAW,
    STRING, UNIT,
};
use atlasdb::{AtlasError, DataInput, DataOutput, DefaultSerializer, Serializer, SerializerId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Holding {
    title: String,
    copies: u32,
    shelves: Vec<String>,
}

fn round_trip<T, S>(serializer: &S, value: T)
where
    T: PartialEq + std::fmt::Debug,
    S: Serializer<T>,
{
    let bytes = to_bytes(serializer, &value).unwrap();
    if let Some(width) = serializer.fixed_size() {
        assert_eq!(bytes.len(), width);
    }
    assert_eq!(from_bytes(serializer, &bytes).unwrap(), value);
}

// =============================================================================
// Round Trips
// =============================================================================

#[test]
fn test_numeric_round_trips() {
    for v in [i64::MIN, -1, 0, 1, i64::MAX] {
        round_trip(&LONG, v);
    }
    for v in [i32::MIN, -7, 0, 42, i32::MAX] {
        round_trip(&INTEGER, v);
    }
    for v in [0.0, -1.5, f64::MAX, f64::MIN_POSITIVE] {
        round_trip(&DOUBLE, v);
    }
    round_trip(&BOOLEAN, true);
    round_trip(&BOOLEAN, false);
    round_trip(&UNIT, ());
}

#[test]
fn test_variable_length_round_trips() {
    round_trip(&STRING, String::new());
    round_trip(&STRING, "Grüße, 世界".to_string());
    round_trip(&BYTE_ARRAY, Vec::new());
    round_trip(&BYTE_ARRAY, (0..=255u8).collect::<Vec<_>>());
    round_trip(&RAW, b"unframed".to_vec());
}

#[test]
fn test_bincode_round_trip() {
    let holding = Holding {
        title: "Annals".to_string(),
        copies: 3,
        shelves: vec!["A1".to_string(), "B7".to_string()],
    };
    round_trip(&Bincode::<Holding>::new(), holding);
}

#[test]
fn test_compressed_round_trip_and_size() {
    let serializer = Compressed::new(BYTE_ARRAY);
    let value = vec![0u8; 10_000];

    let bytes = to_bytes(&serializer, &value).unwrap();
    assert!(bytes.len() < 200);
    assert_eq!(from_bytes(&serializer, &bytes).unwrap(), value);
}

#[test]
fn test_values_are_self_delimiting() {
    let mut out = DataOutput::new();
    STRING.serialize(&mut out, &"first".to_string()).unwrap();
    LONG.serialize(&mut out, &9).unwrap();
    STRING.serialize(&mut out, &"second".to_string()).unwrap();

    let bytes = out.into_vec();
    let mut input = DataInput::new(&bytes);
    let total = bytes.len();
    assert_eq!(STRING.deserialize(&mut input, total).unwrap(), "first");
    assert_eq!(LONG.deserialize(&mut input, total).unwrap(), 9);
    assert_eq!(STRING.deserialize(&mut input, total).unwrap(), "second");
}

#[test]
fn test_equal_values_encode_equally() {
    let a = to_bytes(&STRING, &"key".to_string()).unwrap();
    let b = to_bytes(&STRING, &String::from("key")).unwrap();
    assert_eq!(a, b);
}

// =============================================================================
// Ids and Defaults
// =============================================================================

#[test]
fn test_ids() {
    assert_eq!(LONG.id(), SerializerId::Long);
    assert_eq!(STRING.id(), SerializerId::String);
    assert_eq!(
        Compressed::new(STRING).id(),
        SerializerId::Compressed(Box::new(SerializerId::String))
    );
    assert!(matches!(
        Bincode::<Holding>::new().id(),
        SerializerId::Bincode(name) if name.ends_with("Holding")
    ));
}

#[test]
fn test_default_serializers() {
    assert_eq!(i64::default_serializer().id(), SerializerId::Long);
    assert_eq!(String::default_serializer().id(), SerializerId::String);
    assert_eq!(<()>::default_serializer().id(), SerializerId::Unit);

    let shared: Arc<dyn Serializer<Vec<u8>>> = Vec::<u8>::default_serializer();
    assert_eq!(shared.id(), SerializerId::ByteArray);
}

// =============================================================================
// Corruption
// =============================================================================

#[test]
fn test_truncated_long_is_corruption() {
    assert!(matches!(
        from_bytes(&LONG, &[0, 1, 2]),
        Err(AtlasError::Corruption(_))
    ));
}

#[test]
fn test_trailing_bytes_are_corruption() {
    assert!(matches!(
        from_bytes(&INTEGER, &[0, 0, 0, 1, 9]),
        Err(AtlasError::Corruption(_))
    ));
}

#[test]
fn test_invalid_utf8_is_corruption() {
    assert!(matches!(
        from_bytes(&STRING, &[2, 0xC3, 0x28]),
        Err(AtlasError::Corruption(_))
    ));
}

#[test]
fn test_damaged_compressed_block_is_corruption() {
    let serializer = Compressed::new(BYTE_ARRAY);
    let mut bytes = to_bytes(&serializer, &vec![7u8; 1_000]).unwrap();
    bytes.truncate(bytes.len() - 2);
    assert!(matches!(
        from_bytes(&serializer, &bytes),
        Err(AtlasError::Corruption(_))
    ));
}
