//! Tests for WAL recovery
//!
//! These tests verify:
//! - A clean log is returned whole and left untouched
//! - Torn tails and damaged entries are cut off on disk
//! - `verify` reports the same figures without modifying the file

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use atlasdb::config::WalSyncStrategy;
use atlasdb::wal::{Operation, WalEntry, WalRecovery, WalWriter};
use tempfile::TempDir;

fn setup() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("wal.log");
    (dir, path)
}

/// Log `groups` transactions of two writes and a commit marker each
fn write_groups(path: &Path, groups: u64) {
    let mut writer = WalWriter::open(path, WalSyncStrategy::EveryWrite).unwrap();
    for tx in 1..=groups {
        for recid in [tx * 10, tx * 10 + 1] {
            writer
                .append(Operation::Write {
                    recid,
                    value: vec![tx as u8; 8],
                })
                .unwrap();
        }
        writer.append(Operation::Commit { tx_id: tx }).unwrap();
    }
}

fn append_raw(path: &Path, bytes: &[u8]) {
    let mut file = fs::OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).unwrap().len()
}

// =============================================================================
// Clean Logs
// =============================================================================

#[test]
fn test_recover_empty_file() {
    let (_dir, path) = setup();
    File::create(&path).unwrap();

    let (entries, result) = WalRecovery::recover(&path).unwrap();

    assert!(entries.is_empty());
    assert_eq!(result.entries_recovered, 0);
    assert_eq!(result.entries_corrupted, 0);
    assert_eq!(result.last_lsn, 0);
    assert!(!result.was_truncated);
}

#[test]
fn test_recover_clean_log() {
    let (_dir, path) = setup();
    write_groups(&path, 4);
    let len_before = file_len(&path);

    let (entries, result) = WalRecovery::recover(&path).unwrap();

    assert_eq!(entries.len(), 12);
    assert_eq!(result.last_lsn, 12);
    assert!(!result.was_truncated);
    assert_eq!(file_len(&path), len_before);

    let markers = entries
        .iter()
        .filter(|e| matches!(e.operation, Operation::Commit { .. }))
        .count();
    assert_eq!(markers, 4);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.lsn, i as u64 + 1);
    }
}

// =============================================================================
// Torn Tails
// =============================================================================

#[test]
fn test_recover_cuts_partial_header() {
    let (_dir, path) = setup();
    write_groups(&path, 1);
    let valid_len = file_len(&path);
    append_raw(&path, &[0u8; 7]);

    let (entries, result) = WalRecovery::recover(&path).unwrap();

    assert_eq!(entries.len(), 3);
    assert_eq!(result.entries_corrupted, 0);
    assert!(result.was_truncated);
    assert_eq!(file_len(&path), valid_len);
}

#[test]
fn test_recover_cuts_uncommitted_torn_group() {
    let (_dir, path) = setup();
    write_groups(&path, 2);
    let valid_len = file_len(&path);

    // Start of a third transaction whose write never completed
    let torn = WalEntry::new(
        7,
        Operation::Write {
            recid: 30,
            value: vec![3; 32],
        },
    )
    .serialize()
    .unwrap();
    append_raw(&path, &torn[..torn.len() / 2]);

    let (entries, result) = WalRecovery::recover(&path).unwrap();

    assert_eq!(entries.len(), 6);
    assert_eq!(result.last_lsn, 6);
    assert!(result.was_truncated);
    assert_eq!(file_len(&path), valid_len);

    // A second recovery sees a clean log
    let (_, again) = WalRecovery::recover(&path).unwrap();
    assert!(!again.was_truncated);
    assert_eq!(again.entries_recovered, 6);
}

// =============================================================================
// Damaged Entries
// =============================================================================

#[test]
fn test_recover_stops_at_damaged_entry() {
    let (_dir, path) = setup();
    write_groups(&path, 1);
    let valid_len = file_len(&path);

    let mut bad = WalEntry::new(4, Operation::Commit { tx_id: 2 })
        .serialize()
        .unwrap();
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;
    append_raw(&path, &bad);
    // A good entry after the damage is not trusted either
    append_raw(
        &path,
        &WalEntry::new(5, Operation::Delete { recid: 10 })
            .serialize()
            .unwrap(),
    );

    let (entries, result) = WalRecovery::recover(&path).unwrap();

    assert_eq!(entries.len(), 3);
    assert_eq!(result.entries_corrupted, 1);
    assert_eq!(result.last_lsn, 3);
    assert!(result.was_truncated);
    assert_eq!(file_len(&path), valid_len);
}

#[test]
fn test_recover_damaged_first_entry() {
    let (_dir, path) = setup();
    let mut bytes = WalEntry::new(1, Operation::Delete { recid: 4 })
        .serialize()
        .unwrap();
    bytes[16] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let (entries, result) = WalRecovery::recover(&path).unwrap();

    assert!(entries.is_empty());
    assert_eq!(result.entries_corrupted, 1);
    assert_eq!(result.last_lsn, 0);
    assert_eq!(file_len(&path), 0);
}

// =============================================================================
// Verify
// =============================================================================

#[test]
fn test_verify_does_not_modify_file() {
    let (_dir, path) = setup();
    write_groups(&path, 2);
    append_raw(&path, &[1, 2, 3]);
    let len_before = file_len(&path);

    let result = WalRecovery::verify(&path).unwrap();

    assert_eq!(result.entries_recovered, 6);
    assert!(result.was_truncated);
    assert_eq!(file_len(&path), len_before);
}

#[test]
fn test_recover_and_verify_agree() {
    let (_dir, path) = setup();
    write_groups(&path, 3);
    append_raw(&path, &[9; 10]);

    let verified = WalRecovery::verify(&path).unwrap();
    let (_, recovered) = WalRecovery::recover(&path).unwrap();

    assert_eq!(verified, recovered);
}
