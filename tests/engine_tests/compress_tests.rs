//! Tests for the compression layer
//!
//! These tests verify:
//! - Records read back exactly as written
//! - Compressible records take far less room in the store
//! - Reservations still read as empty records

use std::sync::Arc;

use atlasdb::engine::CompressEngine;
use atlasdb::store::Store;
use atlasdb::Engine;
use rand::{Rng, SeedableRng};

fn compressed_heap() -> (Arc<Store>, CompressEngine) {
    let store = Arc::new(Store::heap().unwrap());
    (store.clone(), CompressEngine::new(store))
}

#[test]
fn test_roundtrip_through_layer() {
    let (_store, engine) = compressed_heap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let noise: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();

    let values: Vec<Vec<u8>> = vec![Vec::new(), b"short".to_vec(), vec![0u8; 10_000], noise];
    for value in values {
        let recid = engine.put(&value).unwrap();
        assert_eq!(engine.get(recid).unwrap().as_ref(), value.as_slice());
    }
}

#[test]
fn test_zeros_are_stored_small() {
    let (store, engine) = compressed_heap();
    let before = store.size();

    let recid = engine.put(&vec![0u8; 10_000]).unwrap();

    assert!(store.size() - before < 200);
    assert!(store.get(recid).unwrap().len() < 200);
}

#[test]
fn test_uncompressed_store_holds_full_size() {
    let store = Store::heap().unwrap();
    let before = store.size();

    store.put(&vec![0u8; 10_000]).unwrap();

    assert!(store.size() - before >= 10_000);
}

#[test]
fn test_update_and_restore_are_compressed() {
    let (store, engine) = compressed_heap();
    let recid = engine.put(b"seed").unwrap();

    engine.update(recid, &vec![1u8; 5000]).unwrap();
    assert_eq!(engine.get(recid).unwrap().as_ref(), vec![1u8; 5000].as_slice());
    assert!(store.get(recid).unwrap().len() < 5000);

    engine.restore(recid, &vec![2u8; 5000]).unwrap();
    assert_eq!(engine.get(recid).unwrap().as_ref(), vec![2u8; 5000].as_slice());
}

#[test]
fn test_preallocated_record_reads_empty() {
    let (_store, engine) = compressed_heap();
    let recid = engine.preallocate().unwrap();
    assert!(engine.get(recid).unwrap().is_empty());
}
