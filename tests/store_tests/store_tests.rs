//! Tests for the update-in-place Store
//!
//! These tests verify:
//! - Handle stability across updates that grow and shrink records
//! - Delete, id reuse and RecordNotFound
//! - Preallocation and restore
//! - Persistence across reopen and compaction
//! - Failed writes and interrupted compaction leave committed records intact

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use atlasdb::failpoint;
use atlasdb::serializer::{LONG, STRING};
use atlasdb::store::{HeapVolume, Store, Volume};
use atlasdb::{AtlasError, Engine, EngineExt, CATALOG_RECID};
use tempfile::TempDir;

fn file_store(dir: &TempDir) -> Store {
    Store::open_file(&dir.path().join("data.db"), false).unwrap()
}

/// Heap volume that outlives the store using it and can be told to
/// reject writes
#[derive(Clone, Default)]
struct SharedVolume {
    bytes: Arc<HeapVolume>,
    fail_writes: Arc<AtomicBool>,
}

impl SharedVolume {
    fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Volume for SharedVolume {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> atlasdb::Result<()> {
        self.bytes.read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> atlasdb::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("write rejected").into());
        }
        self.bytes.write_at(offset, data)
    }

    fn len(&self) -> u64 {
        self.bytes.len()
    }

    fn truncate(&self, len: u64) -> atlasdb::Result<()> {
        self.bytes.truncate(len)
    }

    fn sync(&self) -> atlasdb::Result<()> {
        Ok(())
    }

    fn close(&self) -> atlasdb::Result<()> {
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}

/// Store over shared volumes; reopening with the same pair sees what a
/// crashed process left behind
fn shared_store(index: &SharedVolume, phys: &SharedVolume) -> Store {
    Store::open_volumes(Box::new(index.clone()), Box::new(phys.clone()), false).unwrap()
}

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_fresh_store_has_empty_catalog_record() {
    let store = Store::heap().unwrap();

    assert_eq!(store.recids().unwrap(), vec![CATALOG_RECID]);
    assert!(store.get(CATALOG_RECID).unwrap().is_empty());
}

#[test]
fn test_put_get_typed() {
    let store = Store::heap().unwrap();

    let a = store.put_value(&"alpha".to_string(), &STRING).unwrap();
    let b = store.put_value(&42i64, &LONG).unwrap();

    assert_ne!(a, b);
    assert_eq!(store.get_value(a, &STRING).unwrap(), "alpha");
    assert_eq!(store.get_value(b, &LONG).unwrap(), 42);
}

#[test]
fn test_update_keeps_handle_as_record_grows_and_shrinks() {
    let store = Store::heap().unwrap();
    let recid = store.put(b"small").unwrap();

    let big = vec![7u8; 5000];
    store.update(recid, &big).unwrap();
    assert_eq!(store.get(recid).unwrap().as_ref(), big.as_slice());

    store.update(recid, b"x").unwrap();
    assert_eq!(store.get(recid).unwrap().as_ref(), b"x");

    store.update(recid, b"").unwrap();
    assert!(store.get(recid).unwrap().is_empty());
    assert!(store.contains(recid).unwrap());
}

#[test]
fn test_delete_then_get_is_not_found() {
    let store = Store::heap().unwrap();
    let recid = store.put(b"gone soon").unwrap();

    store.delete(recid).unwrap();

    assert!(store.get(recid).unwrap_err().is_not_found());
    assert!(matches!(
        store.update(recid, b"again"),
        Err(AtlasError::RecordNotFound(r)) if r == recid
    ));
    assert!(store.delete(recid).unwrap_err().is_not_found());
    assert!(!store.contains(recid).unwrap());
}

#[test]
fn test_unknown_ids_are_not_found() {
    let store = Store::heap().unwrap();
    assert!(store.get(0).unwrap_err().is_not_found());
    assert!(store.get(999).unwrap_err().is_not_found());
}

#[test]
fn test_freed_ids_are_reused_lowest_first() {
    let store = Store::heap().unwrap();
    let ids: Vec<u64> = (0..5).map(|i| store.put(&[i]).unwrap()).collect();

    store.delete(ids[3]).unwrap();
    store.delete(ids[1]).unwrap();

    assert_eq!(store.put(b"a").unwrap(), ids[1]);
    assert_eq!(store.put(b"b").unwrap(), ids[3]);
    assert_eq!(store.put(b"c").unwrap(), ids[4] + 1);
}

#[test]
fn test_freed_space_is_reused() {
    let store = Store::heap().unwrap();
    let first = store.put(&[1u8; 1024]).unwrap();
    store.put(&[2u8; 16]).unwrap();
    let size_before = store.size();

    store.delete(first).unwrap();
    assert!(store.free_bytes() >= 1024);

    store.put(&[3u8; 1000]).unwrap();
    assert_eq!(store.size(), size_before);
}

#[test]
fn test_rollback_is_unsupported() {
    let store = Store::heap().unwrap();
    assert!(!store.can_rollback());
    assert!(matches!(store.rollback(), Err(AtlasError::Unsupported(_))));
}

// =============================================================================
// Preallocate / Restore
// =============================================================================

#[test]
fn test_preallocated_id_reads_empty_until_written() {
    let store = Store::heap().unwrap();
    let recid = store.preallocate().unwrap();

    assert!(store.contains(recid).unwrap());
    assert!(store.get(recid).unwrap().is_empty());

    store.update(recid, b"filled").unwrap();
    assert_eq!(store.get(recid).unwrap().as_ref(), b"filled");
}

#[test]
fn test_deleting_reservation_frees_id() {
    let store = Store::heap().unwrap();
    let recid = store.preallocate().unwrap();

    store.delete(recid).unwrap();

    assert!(!store.contains(recid).unwrap());
    assert_eq!(store.put(b"next").unwrap(), recid);
}

#[test]
fn test_restore_beyond_max_recid() {
    let store = Store::heap().unwrap();

    store.restore(10, b"ten").unwrap();

    assert_eq!(store.get(10).unwrap().as_ref(), b"ten");
    assert_eq!(store.max_recid(), 10);
    // Gaps below become free ids
    assert_eq!(store.put(b"two").unwrap(), 2);
}

#[test]
fn test_restore_overwrites_live_record() {
    let store = Store::heap().unwrap();
    let recid = store.put(b"old").unwrap();

    store.restore(recid, b"new").unwrap();

    assert_eq!(store.get(recid).unwrap().as_ref(), b"new");
    assert!(matches!(store.restore(0, b"x"), Err(AtlasError::InvalidArgument(_))));
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_file_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let (kept, removed);
    {
        let store = file_store(&dir);
        kept = store.put(b"durable").unwrap();
        removed = store.put(b"ephemeral").unwrap();
        store.delete(removed).unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    let store = file_store(&dir);
    assert_eq!(store.get(kept).unwrap().as_ref(), b"durable");
    assert!(store.get(removed).unwrap_err().is_not_found());
    assert_eq!(store.put(b"reuse").unwrap(), removed);
}

#[test]
fn test_bad_magic_is_corruption() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data.db");
    {
        let store = Store::open_file(&path, false).unwrap();
        store.close().unwrap();
    }
    let index = Store::index_path(&path);
    let mut bytes = std::fs::read(&index).unwrap();
    bytes[0] = b'X';
    std::fs::write(&index, bytes).unwrap();

    assert!(matches!(
        Store::open_file(&path, false),
        Err(AtlasError::Corruption(_))
    ));
}

#[test]
fn test_delete_files_after_close() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("temp.db");

    let store = Store::open_file(&path, true).unwrap();
    store.put(b"scratch").unwrap();
    store.close().unwrap();

    assert!(!path.exists());
    assert!(!Store::index_path(&path).exists());
}

#[test]
fn test_closed_store_rejects_calls() {
    let store = Store::heap().unwrap();
    store.close().unwrap();

    assert!(store.is_closed());
    assert!(matches!(store.put(b"x"), Err(AtlasError::Closed)));
    assert!(matches!(store.get(CATALOG_RECID), Err(AtlasError::Closed)));
    // Closing twice is fine
    store.close().unwrap();
}

// =============================================================================
// Compaction
// =============================================================================

#[test]
fn test_compact_shrinks_and_keeps_ids() {
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir);

    let ids: Vec<u64> = (0..50u8).map(|i| store.put(&vec![i; 200]).unwrap()).collect();
    for recid in ids.iter().step_by(2) {
        store.delete(*recid).unwrap();
    }
    let before = store.size();

    store.compact().unwrap();

    assert!(store.size() < before);
    assert_eq!(store.free_bytes(), 0);
    for (i, recid) in ids.iter().enumerate() {
        if i % 2 == 1 {
            assert_eq!(store.get(*recid).unwrap().as_ref(), vec![i as u8; 200].as_slice());
        }
    }

    // Compacted layout survives reopen
    store.close().unwrap();
    let store = file_store(&dir);
    assert_eq!(store.get(ids[1]).unwrap().as_ref(), vec![1u8; 200].as_slice());
}

#[test]
fn test_compact_with_failing_index_keeps_records() {
    let (index, phys) = (SharedVolume::default(), SharedVolume::default());
    let store = shared_store(&index, &phys);
    let a = store.put(&[b'a'; 16]).unwrap();
    let b = store.put(&[b'b'; 16]).unwrap();
    let c = store.put(&[b'c'; 16]).unwrap();
    store.delete(a).unwrap();
    store.commit().unwrap();

    index.fail_writes(true);
    assert!(store.compact().is_err());
    assert_eq!(store.get(b).unwrap().as_ref(), &[b'b'; 16]);
    assert_eq!(store.get(c).unwrap().as_ref(), &[b'c'; 16]);

    // What is on disk still describes valid records
    index.fail_writes(false);
    drop(store);
    let store = shared_store(&index, &phys);
    assert_eq!(store.get(b).unwrap().as_ref(), &[b'b'; 16]);
    assert_eq!(store.get(c).unwrap().as_ref(), &[b'c'; 16]);
    assert!(!store.contains(a).unwrap());
}

#[test]
fn test_compact_interrupted_between_moves_recovers() {
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir);

    let ids: Vec<u64> = (0..20u8).map(|i| store.put(&vec![i; 100]).unwrap()).collect();
    for recid in ids.iter().step_by(3) {
        store.delete(*recid).unwrap();
    }
    store.commit().unwrap();

    failpoint::enable("store.compact.between_moves");
    let result = store.compact();
    failpoint::disable("store.compact.between_moves");
    assert!(result.is_err());

    // Crash: files are reopened without a clean close
    drop(store);
    let store = file_store(&dir);
    let survivors: Vec<(usize, u64)> = ids
        .iter()
        .copied()
        .enumerate()
        .filter(|(i, _)| i % 3 != 0)
        .collect();
    for (i, recid) in &survivors {
        assert_eq!(store.get(*recid).unwrap().as_ref(), vec![*i as u8; 100].as_slice());
    }

    let before = store.size();
    store.compact().unwrap();
    assert!(store.size() < before);
    for (i, recid) in &survivors {
        assert_eq!(store.get(*recid).unwrap().as_ref(), vec![*i as u8; 100].as_slice());
    }
}

// =============================================================================
// Failed Writes
// =============================================================================

#[test]
fn test_failed_relocating_update_keeps_old_value() {
    let (index, phys) = (SharedVolume::default(), SharedVolume::default());
    let store = shared_store(&index, &phys);
    let recid = store.put(b"old").unwrap();
    let free_before = store.free_bytes();

    index.fail_writes(true);
    assert!(store.update(recid, &[b'n'; 64]).is_err());
    assert_eq!(store.get(recid).unwrap().as_ref(), b"old");
    assert_eq!(store.free_bytes(), free_before);

    index.fail_writes(false);
    drop(store);
    let store = shared_store(&index, &phys);
    assert_eq!(store.get(recid).unwrap().as_ref(), b"old");
}

#[test]
fn test_failed_in_place_update_puts_back_bytes() {
    let (index, phys) = (SharedVolume::default(), SharedVolume::default());
    let store = shared_store(&index, &phys);
    let recid = store.put(&[1u8; 32]).unwrap();

    // Shorter value fits the slot but changes the index entry
    index.fail_writes(true);
    assert!(store.update(recid, &[2u8; 20]).is_err());
    assert_eq!(store.get(recid).unwrap().as_ref(), &[1u8; 32]);

    index.fail_writes(false);
    drop(store);
    let store = shared_store(&index, &phys);
    assert_eq!(store.get(recid).unwrap().as_ref(), &[1u8; 32]);
}

#[test]
fn test_failed_put_releases_id_and_space() {
    let (index, phys) = (SharedVolume::default(), SharedVolume::default());
    let store = shared_store(&index, &phys);
    let first = store.put(&[1u8; 48]).unwrap();
    let max_before = store.max_recid();

    index.fail_writes(true);
    assert!(store.put(&[2u8; 48]).is_err());
    assert_eq!(store.max_recid(), max_before);
    assert_eq!(store.record_count(), 2);

    index.fail_writes(false);
    let second = store.put(&[3u8; 48]).unwrap();
    assert_eq!(second, first + 1);
    assert_eq!(store.free_bytes(), 0);
    assert_eq!(store.get(second).unwrap().as_ref(), &[3u8; 48]);
}

#[test]
fn test_failed_delete_and_restore_change_nothing() {
    let (index, phys) = (SharedVolume::default(), SharedVolume::default());
    let store = shared_store(&index, &phys);
    let recid = store.put(b"keep").unwrap();
    let max_before = store.max_recid();

    index.fail_writes(true);
    assert!(store.delete(recid).is_err());
    assert!(store.restore(max_before + 5, b"far").is_err());

    assert_eq!(store.get(recid).unwrap().as_ref(), b"keep");
    assert_eq!(store.max_recid(), max_before);
    assert!(!store.contains(max_before + 5).unwrap());

    // Ids skipped by the failed restore were not handed out as free
    index.fail_writes(false);
    assert_eq!(store.put(b"next").unwrap(), max_before + 1);
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_puts_get_distinct_ids() {
    let store = Arc::new(Store::heap().unwrap());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                (0..100u32)
                    .map(|i| {
                        let value = format!("{}-{}", t, i);
                        (store.put(value.as_bytes()).unwrap(), value)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }

    let mut ids: Vec<u64> = all.iter().map(|(r, _)| *r).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 400);
    for (recid, value) in all {
        assert_eq!(store.get(recid).unwrap().as_ref(), value.as_bytes());
    }
}
