//! Tests for WAL entry framing
//!
//! These tests verify:
//! - Every operation kind survives encode/decode
//! - The CRC catches damage to the data and to the LSN
//! - Short or inconsistent frames are rejected

use atlasdb::wal::{Operation, WalEntry, HEADER_SIZE};
use atlasdb::AtlasError;

fn write(recid: u64, value: &[u8]) -> Operation {
    Operation::Write {
        recid,
        value: value.to_vec(),
    }
}

// =============================================================================
// Encoding
// =============================================================================

#[test]
fn test_each_operation_decodes_to_itself() {
    let operations = vec![
        write(7, b"payload"),
        write(8, b""),
        Operation::Delete { recid: 7 },
        Operation::Commit { tx_id: 3 },
    ];

    for (lsn, op) in operations.into_iter().enumerate() {
        let entry = WalEntry::new(lsn as u64 + 1, op);
        let decoded = WalEntry::deserialize(&entry.serialize().unwrap()).unwrap();
        assert_eq!(decoded, entry);
    }
}

#[test]
fn test_header_layout() {
    let entry = WalEntry::new(0x0102_0304_0506_0708, write(1, b"abc"));
    let bytes = entry.serialize().unwrap();

    assert_eq!(&bytes[0..8], &0x0102_0304_0506_0708u64.to_le_bytes());
    assert_eq!(&bytes[8..12], &entry.compute_crc().unwrap().to_le_bytes());
    let len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    assert_eq!(bytes.len(), HEADER_SIZE + len);
    assert_eq!(entry.serialized_size().unwrap(), bytes.len());
}

#[test]
fn test_deserialize_ignores_following_bytes() {
    let first = WalEntry::new(1, write(1, b"one")).serialize().unwrap();
    let second = WalEntry::new(2, Operation::Commit { tx_id: 1 }).serialize().unwrap();

    let mut both = first.clone();
    both.extend_from_slice(&second);

    assert_eq!(WalEntry::deserialize(&both).unwrap().lsn, 1);
}

#[test]
fn test_large_value() {
    let value: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let entry = WalEntry::new(1, write(99, &value));

    let decoded = WalEntry::deserialize(&entry.serialize().unwrap()).unwrap();
    match decoded.operation {
        Operation::Write { recid, value: v } => {
            assert_eq!(recid, 99);
            assert_eq!(v, value);
        }
        other => panic!("unexpected operation {:?}", other),
    }
}

// =============================================================================
// Corruption
// =============================================================================

#[test]
fn test_flipped_data_byte_is_detected() {
    let mut bytes = WalEntry::new(1, write(1, b"value")).serialize().unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;

    let err = WalEntry::deserialize(&bytes).unwrap_err();
    assert!(matches!(err, AtlasError::WalCorruption(_)));
}

#[test]
fn test_altered_lsn_is_detected() {
    let mut bytes = WalEntry::new(5, write(1, b"value")).serialize().unwrap();
    bytes[0] = 6;

    assert!(matches!(
        WalEntry::deserialize(&bytes),
        Err(AtlasError::WalCorruption(_))
    ));
}

#[test]
fn test_short_header_is_rejected() {
    let bytes = WalEntry::new(1, write(1, b"v")).serialize().unwrap();
    assert!(matches!(
        WalEntry::deserialize(&bytes[..HEADER_SIZE - 1]),
        Err(AtlasError::WalCorruption(_))
    ));
}

#[test]
fn test_truncated_data_is_rejected() {
    let bytes = WalEntry::new(1, write(1, b"some value")).serialize().unwrap();
    assert!(matches!(
        WalEntry::deserialize(&bytes[..bytes.len() - 3]),
        Err(AtlasError::WalCorruption(_))
    ));
}

#[test]
fn test_crc_depends_on_content() {
    let a = WalEntry::new(1, write(1, b"a"));
    let b = WalEntry::new(1, write(2, b"a"));
    let c = WalEntry::new(1, write(1, b"b"));

    // Timestamps may differ between entries; compare entries built from one
    let mut a2 = a.clone();
    a2.operation = b.operation.clone();
    let mut a3 = a.clone();
    a3.operation = c.operation.clone();

    assert_ne!(a.compute_crc().unwrap(), a2.compute_crc().unwrap());
    assert_ne!(a.compute_crc().unwrap(), a3.compute_crc().unwrap());
}
