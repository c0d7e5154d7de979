//! Store-to-store copy
//!
//! Two levels:
//! - [`copy`] republishes every named collection of one DB into another.
//!   Record ids in the target are new; contents and names are preserved.
//! - [`copy_records`] copies every record of one engine into another under
//!   the same id, catalog included.
//!
//! Both work across any pair of backings. The source should not be mutated
//! while a copy is running.

use std::sync::Arc;

use tracing::{debug, info};

use crate::db::catalog::{CatalogEntry, CollectionKind};
use crate::db::{hash_map, queue, tree_map, DB};
use crate::engine::Engine;
use crate::error::{AtlasError, Result};
use crate::RecId;

use super::build::build_tree_raw;

/// Copy every collection of `source` into `target` and commit the target
///
/// Fails with `Config` before writing anything if a source collection name
/// already exists in the target. Returns the number of collections copied.
pub fn copy(source: &DB, target: &DB) -> Result<usize> {
    let catalog = source.catalog_snapshot()?;
    for name in catalog.keys() {
        if target.exists(name)? {
            return Err(AtlasError::Config(format!(
                "collection '{}' already exists in the target",
                name
            )));
        }
    }

    let from = source.engine();
    let to = target.engine();
    for (name, entry) in &catalog {
        let root = copy_collection(Arc::clone(&from), to.as_ref(), entry)?;
        target.register(
            name,
            CatalogEntry {
                root,
                ..entry.clone()
            },
        )?;
        debug!(name = %name, kind = ?entry.kind, "Collection copied");
    }

    target.commit()?;
    info!(collections = catalog.len(), "Copy complete");
    Ok(catalog.len())
}

/// Copy every live record of `source` into `target` under its own id
///
/// Existing target records with the same ids are overwritten. The target is
/// committed afterwards. Returns the number of records copied.
pub fn copy_records(source: &dyn Engine, target: &dyn Engine) -> Result<usize> {
    let recids = source.recids()?;
    for recid in &recids {
        target.restore(*recid, &source.get(*recid)?)?;
    }
    target.commit()?;
    info!(records = recids.len(), "Record copy complete");
    Ok(recids.len())
}

/// Rebuild one collection in `to`; returns its new root record
fn copy_collection(from: Arc<dyn Engine>, to: &dyn Engine, entry: &CatalogEntry) -> Result<RecId> {
    match entry.kind {
        CollectionKind::TreeMap | CollectionKind::TreeSet => build_tree_raw(
            to,
            tree_map::raw_entries(from, entry.root)?,
            entry.node_size,
        ),
        CollectionKind::HashMap => {
            let dir = hash_map::create(to)?;
            for item in hash_map::raw_entries(from, entry.root)? {
                let (key, value) = item?;
                hash_map::raw_insert(to, dir, key, value)?;
            }
            Ok(dir)
        }
        CollectionKind::Queue => {
            let header = queue::create(to)?;
            for value in queue::raw_values(from, entry.root)? {
                queue::raw_offer(to, header, &value?)?;
            }
            Ok(header)
        }
    }
}
