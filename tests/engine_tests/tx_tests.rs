//! Tests for the transaction layer
//!
//! These tests verify:
//! - Mutations stay private to the layer until commit
//! - Rollback discards the group and releases preallocated ids
//! - A commit that fails after the WAL sync is replayed on reopen
//! - Only WAL groups ending in a commit marker are replayed

use std::path::{Path, PathBuf};
use std::sync::Arc;

use atlasdb::config::WalSyncStrategy;
use atlasdb::engine::{TxEngine, TxState};
use atlasdb::failpoint;
use atlasdb::store::Store;
use atlasdb::wal::{Operation, WalWriter};
use atlasdb::{AtlasError, Engine};
use tempfile::TempDir;

#[path = "../common/mod.rs"]
mod common;

struct Paths {
    _dir: TempDir,
    store: PathBuf,
    wal: PathBuf,
}

fn paths() -> Paths {
    let dir = TempDir::new().unwrap();
    Paths {
        store: dir.path().join("data.db"),
        wal: dir.path().join("data.db.wal"),
        _dir: dir,
    }
}

fn open(store_path: &Path, wal: &Path) -> (Arc<Store>, TxEngine) {
    let store = Arc::new(Store::open_file(store_path, false).unwrap());
    let tx = TxEngine::open(
        store.clone(),
        Some(wal),
        WalSyncStrategy::EveryWrite,
        false,
    )
    .unwrap();
    (store, tx)
}

fn heap_tx() -> (Arc<Store>, TxEngine) {
    let store = Arc::new(Store::heap().unwrap());
    let tx = TxEngine::open(store.clone(), None, WalSyncStrategy::EveryWrite, false).unwrap();
    (store, tx)
}

// =============================================================================
// Commit / Rollback
// =============================================================================

#[test]
fn test_writes_are_buffered_until_commit() {
    let (store, tx) = heap_tx();

    let recid = tx.put(b"pending").unwrap();

    assert_eq!(tx.get(recid).unwrap().as_ref(), b"pending");
    assert_eq!(tx.pending_count(), 1);
    // The store only holds the reservation
    assert!(store.get(recid).unwrap().is_empty());

    tx.commit().unwrap();

    assert_eq!(store.get(recid).unwrap().as_ref(), b"pending");
    assert_eq!(tx.pending_count(), 0);
    assert_eq!(tx.state(), TxState::Durable);
}

#[test]
fn test_rollback_discards_group() {
    let (store, tx) = heap_tx();
    let kept = tx.put(b"kept").unwrap();
    tx.commit().unwrap();

    tx.update(kept, b"changed").unwrap();
    tx.delete(kept).unwrap();
    let fresh = tx.put(b"fresh").unwrap();
    assert!(tx.get(kept).unwrap_err().is_not_found());

    tx.rollback().unwrap();

    assert_eq!(tx.state(), TxState::Discarded);
    assert_eq!(tx.get(kept).unwrap().as_ref(), b"kept");
    assert!(!tx.contains(fresh).unwrap());
    assert!(!store.contains(fresh).unwrap());
    // The released id is handed out again
    assert_eq!(tx.put(b"again").unwrap(), fresh);
}

#[test]
fn test_recids_reflect_pending_changes() {
    let (_store, tx) = heap_tx();
    let a = tx.put(b"a").unwrap();
    let b = tx.put(b"b").unwrap();
    tx.commit().unwrap();

    tx.delete(a).unwrap();
    let c = tx.put(b"c").unwrap();

    assert_eq!(tx.recids().unwrap(), vec![1, b, c]);
}

#[test]
fn test_update_of_missing_record_fails() {
    let (_store, tx) = heap_tx();
    assert!(tx.update(42, b"x").unwrap_err().is_not_found());
    assert!(tx.delete(42).unwrap_err().is_not_found());
    assert!(tx.can_rollback());
}

#[test]
fn test_commit_truncates_wal() {
    let p = paths();
    let (_store, tx) = open(&p.store, &p.wal);

    tx.put(b"value").unwrap();
    tx.commit().unwrap();

    assert_eq!(std::fs::metadata(&p.wal).unwrap().len(), 0);
    assert_eq!(tx.wal_path(), Some(p.wal.as_path()));
}

// =============================================================================
// Crash Recovery
// =============================================================================

#[test]
fn test_failure_after_wal_sync_is_replayed() {
    common::init_tracing();
    let p = paths();
    let recid;
    {
        let (_store, tx) = open(&p.store, &p.wal);
        recid = tx.put(b"survivor").unwrap();

        failpoint::enable("tx.after_wal_sync");
        let result = tx.commit();
        failpoint::disable("tx.after_wal_sync");

        assert!(matches!(result, Err(AtlasError::Io(_))));
        assert_eq!(tx.state(), TxState::Durable);
        assert!(std::fs::metadata(&p.wal).unwrap().len() > 0);
        // Simulated crash: nothing is closed
    }

    let (store, tx) = open(&p.store, &p.wal);
    assert_eq!(tx.get(recid).unwrap().as_ref(), b"survivor");
    assert_eq!(store.get(recid).unwrap().as_ref(), b"survivor");
    assert_eq!(std::fs::metadata(&p.wal).unwrap().len(), 0);
}

#[test]
fn test_durable_group_is_retried_by_next_commit() {
    let (store, tx) = heap_tx();
    let recid = tx.put(b"retry me").unwrap();

    failpoint::enable("tx.after_wal_sync");
    assert!(tx.commit().is_err());
    failpoint::disable("tx.after_wal_sync");

    // New work is refused until the durable group is applied
    assert!(matches!(tx.put(b"blocked"), Err(AtlasError::Storage(_))));
    assert!(tx.rollback().is_err());

    tx.commit().unwrap();
    assert_eq!(store.get(recid).unwrap().as_ref(), b"retry me");
    tx.put(b"unblocked").unwrap();
}

#[test]
fn test_replay_applies_only_terminated_groups() {
    let p = paths();
    {
        let store = Store::open_file(&p.store, false).unwrap();
        store.close().unwrap();
    }
    {
        let mut wal = WalWriter::open(&p.wal, WalSyncStrategy::EveryWrite).unwrap();
        wal.append(Operation::Write {
            recid: 5,
            value: b"committed".to_vec(),
        })
        .unwrap();
        wal.append(Operation::Commit { tx_id: 1 }).unwrap();
        wal.append(Operation::Write {
            recid: 6,
            value: b"unterminated".to_vec(),
        })
        .unwrap();
    }

    let (store, tx) = open(&p.store, &p.wal);

    assert_eq!(tx.get(5).unwrap().as_ref(), b"committed");
    assert!(!tx.contains(6).unwrap());
    assert!(!store.contains(6).unwrap());
}

#[test]
fn test_replay_applies_deletes() {
    let p = paths();
    let recid;
    {
        let store = Store::open_file(&p.store, false).unwrap();
        recid = store.put(b"to delete").unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }
    {
        let mut wal = WalWriter::open(&p.wal, WalSyncStrategy::EveryWrite).unwrap();
        wal.append(Operation::Delete { recid }).unwrap();
        // Deleting an id that is already gone is not an error on replay
        wal.append(Operation::Delete { recid: 77 }).unwrap();
        wal.append(Operation::Commit { tx_id: 4 }).unwrap();
    }

    let (_store, tx) = open(&p.store, &p.wal);
    assert!(!tx.contains(recid).unwrap());
}

#[test]
fn test_close_discards_uncommitted_changes() {
    let p = paths();
    let recid;
    {
        let (_store, tx) = open(&p.store, &p.wal);
        recid = tx.put(b"never committed").unwrap();
        tx.close().unwrap();
        assert!(matches!(tx.get(recid), Err(AtlasError::Closed)));
    }

    let (_store, tx) = open(&p.store, &p.wal);
    assert!(!tx.contains(recid).unwrap());
}
