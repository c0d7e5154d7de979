//! Tests for DB lifecycle and the catalog
//!
//! These tests verify:
//! - Collections persist by name across reopen for every backing
//! - Uncommitted work, including new collections, is lost on rollback/close
//! - Reopening with a different kind or serializer is rejected
//! - Dropping a collection frees its records

use std::path::Path;

use atlasdb::config::Backing;
use atlasdb::db::CollectionKind;
use atlasdb::{AtlasError, Config, Result, DB};
use tempfile::TempDir;

#[path = "../common/mod.rs"]
mod common;

use common::{heap_db, init_tracing, temp_file_store};

fn file_config(path: &Path) -> Config {
    Config::builder().file(path).build()
}

fn fill(db: &DB) {
    let tree = db.get_tree_map::<i64, String>("tree").unwrap();
    let hash = db.get_hash_map::<String, i64>("hash").unwrap();
    let set = db.get_tree_set::<i64>("set").unwrap();
    let queue = db.get_queue::<String>("queue").unwrap();
    for i in 0..200i64 {
        tree.insert(&i, &format!("t{}", i)).unwrap();
        hash.insert(&format!("h{}", i), &i).unwrap();
        set.insert(&(i * 7)).unwrap();
    }
    for i in 0..10 {
        queue.offer(&format!("job{}", i)).unwrap();
    }
}

fn check(db: &DB) {
    let tree = db.get_tree_map::<i64, String>("tree").unwrap();
    let hash = db.get_hash_map::<String, i64>("hash").unwrap();
    let set = db.get_tree_set::<i64>("set").unwrap();
    let queue = db.get_queue::<String>("queue").unwrap();

    assert_eq!(tree.len().unwrap(), 200);
    assert_eq!(tree.get(&123).unwrap(), Some("t123".to_string()));
    assert_eq!(hash.get(&"h42".to_string()).unwrap(), Some(42));
    assert!(set.contains(&(199 * 7)).unwrap());
    assert_eq!(queue.len().unwrap(), 10);
    assert_eq!(queue.peek().unwrap(), Some("job0".to_string()));
    assert_eq!(db.names().unwrap(), vec!["hash", "queue", "set", "tree"]);
}

// =============================================================================
// Catalog
// =============================================================================

#[test]
fn test_new_db_has_empty_catalog() {
    let db = heap_db();
    assert!(db.names().unwrap().is_empty());
    assert!(!db.exists("anything").unwrap());
    assert!(db.catalog_entry("anything").unwrap().is_none());
}

#[test]
fn test_catalog_records_kind_and_node_size() {
    let db = heap_db();
    db.tree_map::<i64, i64>("prices").node_size(16).make().unwrap();
    db.get_queue::<String>("jobs").unwrap();

    let prices = db.catalog_entry("prices").unwrap().unwrap();
    assert_eq!(prices.kind, CollectionKind::TreeMap);
    assert_eq!(prices.node_size, 16);

    let jobs = db.catalog_entry("jobs").unwrap().unwrap();
    assert_eq!(jobs.kind, CollectionKind::Queue);
    assert!(jobs.value.is_none());
}

#[test]
fn test_kind_mismatch_is_config_error() {
    let db = heap_db();
    db.get_tree_map::<i64, i64>("shape").unwrap();

    assert!(matches!(
        db.get_hash_map::<i64, i64>("shape"),
        Err(AtlasError::Config(_))
    ));
    assert!(matches!(
        db.get_tree_set::<i64>("shape"),
        Err(AtlasError::Config(_))
    ));
}

#[test]
fn test_serializer_mismatch_is_config_error() {
    let db = heap_db();
    db.get_tree_map::<i64, i64>("typed").unwrap();

    assert!(matches!(
        db.get_tree_map::<i64, String>("typed"),
        Err(AtlasError::Config(_))
    ));
    assert!(matches!(
        db.get_tree_map::<String, i64>("typed"),
        Err(AtlasError::Config(_))
    ));
}

#[test]
fn test_small_node_size_is_rejected() {
    let db = heap_db();
    assert!(matches!(
        db.tree_map::<i64, i64>("tiny").node_size(2).make(),
        Err(AtlasError::InvalidArgument(_))
    ));
    assert!(!db.exists("tiny").unwrap());
}

#[test]
fn test_drop_collection_frees_records() {
    let db = heap_db();
    db.commit().unwrap();
    let baseline = db.engine().recids().unwrap().len();

    fill(&db);
    assert!(db.engine().recids().unwrap().len() > baseline);

    for name in ["tree", "hash", "set", "queue"] {
        assert!(db.drop_collection(name).unwrap());
    }
    assert!(!db.drop_collection("tree").unwrap());

    assert!(db.names().unwrap().is_empty());
    assert_eq!(db.engine().recids().unwrap().len(), baseline);

    // The name can be reused with a different kind
    let reborn = db.get_hash_map::<i64, i64>("tree").unwrap();
    assert!(reborn.is_empty().unwrap());
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_file_db_persists_committed_collections() {
    let (_dir, path) = temp_file_store();
    {
        let db = DB::open(file_config(&path)).unwrap();
        fill(&db);
        db.commit().unwrap();
        db.close().unwrap();
    }

    let db = DB::open(file_config(&path)).unwrap();
    check(&db);
}

#[test]
fn test_append_only_db_persists_committed_collections() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = || {
        Config::builder()
            .append_only(dir.path().join("segments"))
            .segment_size(4096)
            .build()
    };
    {
        let db = DB::open(config()).unwrap();
        fill(&db);
        db.commit().unwrap();
        db.compact().unwrap();
    }

    let db = DB::open(config()).unwrap();
    check(&db);
}

#[test]
fn test_all_layers_enabled_round_trip() {
    let (_dir, path) = temp_file_store();
    let config = || {
        Config::builder()
            .file(&path)
            .async_write_enable()
            .async_queue_size(16)
            .compression_enable()
            .cache_size(64)
            .node_size(6)
            .build()
    };
    {
        let db = DB::open(config()).unwrap();
        fill(&db);
        db.commit().unwrap();
    }

    let db = DB::open(config()).unwrap();
    check(&db);
    assert_eq!(db.config().node_size, 6);
    assert_eq!(db.config().backing, Backing::File(path.clone()));
}

#[test]
fn test_without_transactions_commit_still_persists() {
    let (_dir, path) = temp_file_store();
    let config = || Config::builder().file(&path).transaction_disable().build();
    {
        let db = DB::open(config()).unwrap();
        fill(&db);
        db.commit().unwrap();
        assert!(matches!(db.rollback(), Err(AtlasError::Unsupported(_))));
    }

    let db = DB::open(config()).unwrap();
    check(&db);
}

#[test]
fn test_uncommitted_work_is_lost_on_close() {
    let (_dir, path) = temp_file_store();
    {
        let db = DB::open(file_config(&path)).unwrap();
        let map = db.get_tree_map::<i64, i64>("kept").unwrap();
        map.insert(&1, &1).unwrap();
        db.commit().unwrap();

        map.insert(&2, &2).unwrap();
        db.get_queue::<i64>("never").unwrap();
        db.close().unwrap();
    }

    let db = DB::open(file_config(&path)).unwrap();
    let map = db.get_tree_map::<i64, i64>("kept").unwrap();
    assert_eq!(map.len().unwrap(), 1);
    assert_eq!(map.get(&2).unwrap(), None);
    assert!(!db.exists("never").unwrap());
}

#[test]
fn test_delete_files_after_close() {
    let (dir, path) = temp_file_store();
    {
        let db = DB::open(Config::builder().file(&path).delete_files_after_close().build())
            .unwrap();
        fill(&db);
        db.commit().unwrap();
    }

    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty());
}

// =============================================================================
// Rollback and Lifecycle
// =============================================================================

#[test]
fn test_rollback_forgets_new_collections() {
    let db = heap_db();
    let kept = db.get_tree_map::<i64, i64>("kept").unwrap();
    kept.insert(&1, &10).unwrap();
    db.commit().unwrap();

    kept.insert(&2, &20).unwrap();
    let temp = db.get_hash_map::<i64, i64>("temp").unwrap();
    temp.insert(&1, &1).unwrap();

    db.rollback().unwrap();

    assert!(!db.exists("temp").unwrap());
    let kept = db.get_tree_map::<i64, i64>("kept").unwrap();
    let entries: Vec<(i64, i64)> = kept.iter().unwrap().collect::<Result<_>>().unwrap();
    assert_eq!(entries, vec![(1, 10)]);
}

#[test]
fn test_closed_db_rejects_calls() {
    let db = heap_db();
    db.close().unwrap();

    assert!(db.is_closed());
    assert!(matches!(db.names(), Err(AtlasError::Closed)));
    assert!(matches!(db.commit(), Err(AtlasError::Closed)));
    assert!(matches!(
        db.get_tree_map::<i64, i64>("late"),
        Err(AtlasError::Closed)
    ));
    db.close().unwrap();
}

#[test]
fn test_drop_closes_db() {
    let (_dir, path) = temp_file_store();
    {
        let db = DB::open(file_config(&path)).unwrap();
        db.get_tree_set::<String>("names")
            .unwrap()
            .insert(&"x".to_string())
            .unwrap();
        db.commit().unwrap();
    }

    // The store was released and can be opened again
    let db = DB::open(file_config(&path)).unwrap();
    assert!(db
        .get_tree_set::<String>("names")
        .unwrap()
        .contains(&"x".to_string())
        .unwrap());
}
