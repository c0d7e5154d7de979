//! Catalog: name → collection descriptor, stored in record 1
//!
//! The whole map is one bincode record. It is rewritten on every change and
//! goes through the same engine chain (and transaction) as the collections
//! it describes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::Result;
use crate::serializer::SerializerId;
use crate::{RecId, CATALOG_RECID};

/// Kind of a named collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionKind {
    HashMap,
    TreeMap,
    TreeSet,
    Queue,
}

/// Persisted description of one collection
///
/// For sets and queues `key` is the element serializer and `value` is
/// `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub kind: CollectionKind,
    /// Root-reference record (tree), directory (hash map) or header (queue)
    pub root: RecId,
    pub key: SerializerId,
    pub value: Option<SerializerId>,
    /// Fan-out; only meaningful for trees
    pub node_size: usize,
}

pub(crate) type Catalog = BTreeMap<String, CatalogEntry>;

/// Read the catalog; a never-written record is an empty catalog
pub(crate) fn load(engine: &dyn Engine) -> Result<Catalog> {
    let bytes = engine.get(CATALOG_RECID)?;
    if bytes.is_empty() {
        return Ok(Catalog::new());
    }
    Ok(bincode::deserialize(&bytes)?)
}

pub(crate) fn save(engine: &dyn Engine, catalog: &Catalog) -> Result<()> {
    let bytes = bincode::serialize(catalog)?;
    engine.update(CATALOG_RECID, &bytes)
}
