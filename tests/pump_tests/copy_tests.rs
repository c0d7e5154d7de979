//! Tests for store-to-store copy
//!
//! These tests verify:
//! - `copy` republishes every collection across every pair of backings
//! - `copy` refuses name collisions before writing anything
//! - `copy_records` keeps record ids, catalog included

use std::path::Path;

use atlasdb::pump;
use atlasdb::store::{AppendStore, Store};
use atlasdb::{AtlasError, Config, Engine, Result, DB};
use tempfile::TempDir;

#[path = "../common/mod.rs"]
mod common;

#[derive(Debug, Clone, Copy)]
enum Kind {
    Heap,
    File,
    AppendOnly,
}

const KINDS: [Kind; 3] = [Kind::Heap, Kind::File, Kind::AppendOnly];

fn config(kind: Kind, dir: &Path, name: &str) -> Config {
    let builder = Config::builder();
    match kind {
        Kind::Heap => builder.heap(),
        Kind::File => builder.file(dir.join(format!("{}.db", name))),
        Kind::AppendOnly => builder.append_only(dir.join(name)),
    }
    .build()
}

fn populate(db: &DB) {
    let tree = db.get_tree_map::<i64, String>("tree").unwrap();
    let hash = db.get_hash_map::<String, String>("hash").unwrap();
    let set = db.get_tree_set::<i64>("set").unwrap();
    let queue = db.get_queue::<i64>("queue").unwrap();
    for i in 0..300i64 {
        tree.insert(&i, &i.to_string()).unwrap();
        hash.insert(&i.to_string(), &format!("h{}", i)).unwrap();
        set.insert(&(i * 2)).unwrap();
    }
    for i in 0..25 {
        queue.offer(&i).unwrap();
    }
    db.commit().unwrap();
}

fn verify(db: &DB) {
    let tree = db.get_tree_map::<i64, String>("tree").unwrap();
    let hash = db.get_hash_map::<String, String>("hash").unwrap();
    let set = db.get_tree_set::<i64>("set").unwrap();
    let queue = db.get_queue::<i64>("queue").unwrap();

    let entries: Vec<(i64, String)> = tree.iter().unwrap().collect::<Result<_>>().unwrap();
    assert_eq!(entries.len(), 300);
    assert!(entries.iter().all(|(k, v)| *v == k.to_string()));
    assert_eq!(hash.len().unwrap(), 300);
    assert_eq!(hash.get(&"17".to_string()).unwrap(), Some("h17".to_string()));
    assert_eq!(set.len().unwrap(), 300);
    assert!(set.contains(&598).unwrap());
    let queued: Vec<i64> = queue.iter().unwrap().collect::<Result<_>>().unwrap();
    assert_eq!(queued, (0..25).collect::<Vec<_>>());
}

// =============================================================================
// Collection Copy
// =============================================================================

#[test]
fn test_copy_between_all_backings() {
    common::init_tracing();
    for from in KINDS {
        for to in KINDS {
            let dir = TempDir::new().unwrap();
            let source = DB::open(config(from, dir.path(), "source")).unwrap();
            populate(&source);

            let target_config = config(to, dir.path(), "target");
            let target = DB::open(target_config.clone()).unwrap();
            assert_eq!(pump::copy(&source, &target).unwrap(), 4, "{:?} -> {:?}", from, to);
            verify(&target);

            // Source collections are untouched
            verify(&source);

            // Persistent targets keep the copy across reopen
            if !matches!(to, Kind::Heap) {
                drop(target);
                let target = DB::open(target_config).unwrap();
                verify(&target);
            }
        }
    }
}

#[test]
fn test_copy_preserves_node_size_and_serializers() {
    let source = DB::heap().unwrap();
    source.tree_map::<i64, i64>("wide").node_size(40).make().unwrap();
    let target = DB::heap().unwrap();

    pump::copy(&source, &target).unwrap();

    let from = source.catalog_entry("wide").unwrap().unwrap();
    let to = target.catalog_entry("wide").unwrap().unwrap();
    assert_eq!(to.node_size, 40);
    assert_eq!(to.key, from.key);
    assert_eq!(to.value, from.value);
    assert_eq!(to.kind, from.kind);
}

#[test]
fn test_copy_rejects_name_collision_before_writing() {
    let source = DB::heap().unwrap();
    populate(&source);
    let target = DB::heap().unwrap();
    let existing = target.get_queue::<String>("queue").unwrap();
    existing.offer(&"mine".to_string()).unwrap();
    target.commit().unwrap();
    let records_before = target.engine().recids().unwrap();

    let result = pump::copy(&source, &target);

    assert!(matches!(result, Err(AtlasError::Config(_))));
    assert_eq!(target.names().unwrap(), vec!["queue"]);
    assert_eq!(target.engine().recids().unwrap(), records_before);
    assert_eq!(existing.peek().unwrap(), Some("mine".to_string()));
}

#[test]
fn test_copy_of_empty_db() {
    let source = DB::heap().unwrap();
    let target = DB::heap().unwrap();
    assert_eq!(pump::copy(&source, &target).unwrap(), 0);
    assert!(target.names().unwrap().is_empty());
}

// =============================================================================
// Record Copy
// =============================================================================

#[test]
fn test_copy_records_keeps_ids() {
    let source = Store::heap().unwrap();
    let one = source.put(b"1").unwrap();
    let two = source.put(b"2").unwrap();
    let gone = source.put(b"gone").unwrap();
    source.delete(gone).unwrap();

    let dir = TempDir::new().unwrap();
    let target = AppendStore::open(&dir.path().join("copy"), 1 << 20, false).unwrap();

    assert_eq!(pump::copy_records(&source, &target).unwrap(), 3);

    assert_eq!(target.get(one).unwrap().as_ref(), b"1");
    assert_eq!(target.get(two).unwrap().as_ref(), b"2");
    assert!(!target.contains(gone).unwrap());
    assert_eq!(target.recids().unwrap(), source.recids().unwrap());
}

#[test]
fn test_copy_records_carries_catalog() {
    let dir = TempDir::new().unwrap();
    for to in [Kind::File, Kind::AppendOnly] {
        let source = DB::heap().unwrap();
        populate(&source);

        let target_config = config(to, dir.path(), &format!("records_{:?}", to));
        {
            let target = DB::open(target_config.clone()).unwrap();
            let copied =
                pump::copy_records(source.engine().as_ref(), target.engine().as_ref()).unwrap();
            assert_eq!(copied, source.engine().recids().unwrap().len());
        }

        // The catalog record came along, so the collections resolve on open
        let target = DB::open(target_config).unwrap();
        verify(&target);
    }
}
