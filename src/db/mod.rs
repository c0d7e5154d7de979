//! DB Module
//!
//! Named collections on top of an engine chain.
//!
//! ## Responsibilities
//! - Assemble the engine chain described by `Config`
//! - Keep the catalog (record 1): name → kind, root record, serializers
//! - Create collections on first use, reopen them afterwards
//! - Hand out one shared handle per collection name
//!
//! ## Collection Creation
//! ```text
//!   builder.make()
//!        │
//!        ├── name in catalog? ── yes ──► check kind + serializers ──► handle
//!        │
//!        ▼ no
//!   write root (empty, or bulk-built from the pump source)
//!        │
//!        ▼
//!   write catalog entry          (same transaction as the root)
//! ```
//! Nothing is committed implicitly: a crash before `commit` loses both the
//! root and its catalog entry, never just one of them.

pub(crate) mod catalog;
pub(crate) mod hash_map;
pub(crate) mod node;
pub(crate) mod queue;
pub(crate) mod tree_map;
mod tree_set;

use std::any::Any;
use std::collections::HashMap as StdHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::{Backing, Config};
use crate::engine::{AsyncWriteEngine, CacheEngine, CompressEngine, Engine, TxEngine};
use crate::error::{AtlasError, Result};
use crate::pump;
use crate::serializer::{DefaultSerializer, Serializer, SerializerId, UNIT};
use crate::store::{AppendStore, Store};

use catalog::Catalog;

pub use catalog::{CatalogEntry, CollectionKind};
pub use hash_map::{HashIter, HashMap};
pub use queue::{Queue, QueueIter};
pub use tree_map::{TreeIter, TreeMap};
pub use tree_set::{SetIter, TreeSet};

type Handle = Arc<dyn Any + Send + Sync>;

/// Source of keys for bulk construction
type PumpSource<K> = Box<dyn Iterator<Item = Result<K>>>;

/// An open database: an engine chain plus its catalog
pub struct DB {
    engine: Arc<dyn Engine>,
    config: Config,
    catalog: Mutex<Catalog>,
    handles: Mutex<StdHashMap<String, Handle>>,
    closed: AtomicBool,
}

impl DB {
    /// Open (or create) a database as described by `config`
    ///
    /// The chain is built inner to outer: store, transactions, async writer,
    /// compression, cache. Compression must be enabled the same way on every
    /// open of a given store.
    pub fn open(config: Config) -> Result<Self> {
        let engine = Self::assemble(&config)?;
        let catalog = catalog::load(engine.as_ref())?;

        info!(
            backing = ?config.backing,
            collections = catalog.len(),
            transactions = config.transactions,
            async_write = config.async_write,
            "DB opened"
        );

        Ok(Self {
            engine,
            config,
            catalog: Mutex::new(catalog),
            handles: Mutex::new(StdHashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// In-memory database with default settings
    pub fn heap() -> Result<Self> {
        Self::open(Config::builder().heap().build())
    }

    fn assemble(config: &Config) -> Result<Arc<dyn Engine>> {
        let mut engine: Arc<dyn Engine> = match &config.backing {
            Backing::Heap => Arc::new(Store::heap()?),
            Backing::File(path) => {
                Arc::new(Store::open_file(path, config.delete_files_after_close)?)
            }
            Backing::AppendOnly(dir) => Arc::new(AppendStore::open(
                dir,
                config.segment_size,
                config.delete_files_after_close,
            )?),
        };

        if config.transactions {
            engine = Arc::new(TxEngine::open(
                engine,
                config.wal_path().as_deref(),
                config.wal_sync_strategy,
                config.delete_files_after_close,
            )?);
        }
        if config.async_write {
            engine = Arc::new(AsyncWriteEngine::new(
                engine,
                config.async_queue_size,
                Duration::from_millis(config.async_flush_interval_ms),
                Duration::from_millis(config.close_timeout_ms),
            )?);
        }
        if config.compression {
            engine = Arc::new(CompressEngine::new(engine));
        }
        if let Some(capacity) = config.cache_size {
            engine = Arc::new(CacheEngine::new(engine, capacity));
        }
        Ok(engine)
    }

    // =========================================================================
    // Collection Access
    // =========================================================================

    /// Open or create a hash map with default serializers
    pub fn get_hash_map<K, V>(&self, name: &str) -> Result<HashMap<K, V>>
    where
        K: DefaultSerializer,
        V: DefaultSerializer,
    {
        self.hash_map(name).make()
    }

    /// Open or create a tree map with default serializers
    pub fn get_tree_map<K, V>(&self, name: &str) -> Result<TreeMap<K, V>>
    where
        K: DefaultSerializer + Ord,
        V: DefaultSerializer,
    {
        self.tree_map(name).make()
    }

    /// Open or create a tree set with the default serializer
    pub fn get_tree_set<K>(&self, name: &str) -> Result<TreeSet<K>>
    where
        K: DefaultSerializer + Ord,
    {
        self.tree_set(name).make()
    }

    /// Open or create a queue with the default serializer
    pub fn get_queue<V>(&self, name: &str) -> Result<Queue<V>>
    where
        V: DefaultSerializer,
    {
        self.queue(name).make()
    }

    pub fn hash_map<K, V>(&self, name: &str) -> HashMapBuilder<'_, K, V>
    where
        K: DefaultSerializer,
        V: DefaultSerializer,
    {
        HashMapBuilder {
            db: self,
            name: name.to_string(),
            keys: K::default_serializer(),
            values: V::default_serializer(),
        }
    }

    pub fn tree_map<K, V>(&self, name: &str) -> TreeMapBuilder<'_, K, V>
    where
        K: DefaultSerializer + Ord,
        V: DefaultSerializer,
    {
        TreeMapBuilder {
            db: self,
            name: name.to_string(),
            node_size: self.config.node_size,
            keys: K::default_serializer(),
            values: V::default_serializer(),
            pump_source: None,
            pump_values: None,
        }
    }

    pub fn tree_set<K>(&self, name: &str) -> TreeSetBuilder<'_, K>
    where
        K: DefaultSerializer + Ord,
    {
        TreeSetBuilder {
            db: self,
            name: name.to_string(),
            node_size: self.config.node_size,
            serializer: K::default_serializer(),
            pump_source: None,
        }
    }

    pub fn queue<V>(&self, name: &str) -> QueueBuilder<'_, V>
    where
        V: DefaultSerializer,
    {
        QueueBuilder {
            db: self,
            name: name.to_string(),
            serializer: V::default_serializer(),
        }
    }

    /// Hash map builder with explicit serializers, for types without a
    /// default one
    pub fn hash_map_with<K, V>(
        &self,
        name: &str,
        keys: Arc<dyn Serializer<K>>,
        values: Arc<dyn Serializer<V>>,
    ) -> HashMapBuilder<'_, K, V> {
        HashMapBuilder {
            db: self,
            name: name.to_string(),
            keys,
            values,
        }
    }

    pub fn tree_map_with<K, V>(
        &self,
        name: &str,
        keys: Arc<dyn Serializer<K>>,
        values: Arc<dyn Serializer<V>>,
    ) -> TreeMapBuilder<'_, K, V>
    where
        K: Ord,
    {
        TreeMapBuilder {
            db: self,
            name: name.to_string(),
            node_size: self.config.node_size,
            keys,
            values,
            pump_source: None,
            pump_values: None,
        }
    }

    pub fn tree_set_with<K: Ord>(
        &self,
        name: &str,
        serializer: Arc<dyn Serializer<K>>,
    ) -> TreeSetBuilder<'_, K> {
        TreeSetBuilder {
            db: self,
            name: name.to_string(),
            node_size: self.config.node_size,
            serializer,
            pump_source: None,
        }
    }

    pub fn queue_with<V>(
        &self,
        name: &str,
        serializer: Arc<dyn Serializer<V>>,
    ) -> QueueBuilder<'_, V> {
        QueueBuilder {
            db: self,
            name: name.to_string(),
            serializer,
        }
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    pub fn exists(&self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.catalog.lock().contains_key(name))
    }

    /// Collection names in ascending order
    pub fn names(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self.catalog.lock().keys().cloned().collect())
    }

    pub fn catalog_entry(&self, name: &str) -> Result<Option<CatalogEntry>> {
        self.ensure_open()?;
        Ok(self.catalog.lock().get(name).cloned())
    }

    /// Remove a collection and free all of its records
    ///
    /// Returns false if there was no such collection. Handles still held for
    /// it fail on their next access.
    pub fn drop_collection(&self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        let mut catalog = self.catalog.lock();
        let Some(entry) = catalog.get(name).cloned() else {
            return Ok(false);
        };

        let engine = self.engine.as_ref();
        match entry.kind {
            CollectionKind::TreeMap | CollectionKind::TreeSet => tree_map::free(engine, entry.root)?,
            CollectionKind::HashMap => hash_map::free(engine, entry.root)?,
            CollectionKind::Queue => queue::free(engine, entry.root)?,
        }

        catalog.remove(name);
        catalog::save(engine, &catalog)?;
        self.handles.lock().remove(name);
        debug!(name, kind = ?entry.kind, "Collection dropped");
        Ok(true)
    }

    pub(crate) fn catalog_snapshot(&self) -> Result<Catalog> {
        self.ensure_open()?;
        Ok(self.catalog.lock().clone())
    }

    /// Add an entry for a collection whose records are already written
    pub(crate) fn register(&self, name: &str, entry: CatalogEntry) -> Result<()> {
        self.ensure_open()?;
        let mut catalog = self.catalog.lock();
        if catalog.contains_key(name) {
            return Err(AtlasError::Config(format!(
                "collection '{}' already exists",
                name
            )));
        }
        catalog.insert(name.to_string(), entry);
        if let Err(e) = catalog::save(self.engine.as_ref(), &catalog) {
            catalog.remove(name);
            return Err(e);
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Make every change so far durable
    pub fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        self.engine.commit()
    }

    /// Discard every change since the last commit
    ///
    /// Collections created since then disappear from the catalog; handles
    /// obtained afterwards are fresh.
    pub fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        let mut catalog = self.catalog.lock();
        self.engine.rollback()?;
        *catalog = catalog::load(self.engine.as_ref())?;
        self.handles.lock().clear();
        Ok(())
    }

    /// Reclaim space in the store; record ids are unchanged
    pub fn compact(&self) -> Result<()> {
        self.ensure_open()?;
        self.engine.compact()
    }

    /// Close the engine chain; uncommitted changes are discarded
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.handles.lock().clear();
        self.engine.close()?;
        info!("DB closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Outermost engine of the chain, for record-level access
    pub fn engine(&self) -> Arc<dyn Engine> {
        Arc::clone(&self.engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(AtlasError::Closed);
        }
        Ok(())
    }

    /// Shared handle for `name`, opened with `open` on first request
    fn handle<T>(&self, name: &str, open: impl FnOnce() -> T) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut handles = self.handles.lock();
        if let Some(existing) = handles.get(name) {
            return existing.downcast_ref::<T>().cloned().ok_or_else(|| {
                AtlasError::Config(format!(
                    "collection '{}' is already open with different types",
                    name
                ))
            });
        }
        let handle = open();
        handles.insert(name.to_string(), Arc::new(handle.clone()));
        Ok(handle)
    }

    /// Look up `name` and verify it matches the requested shape
    fn existing(
        catalog: &Catalog,
        name: &str,
        kind: CollectionKind,
        key: SerializerId,
        value: Option<SerializerId>,
    ) -> Result<Option<CatalogEntry>> {
        let Some(entry) = catalog.get(name) else {
            return Ok(None);
        };
        if entry.kind != kind {
            return Err(AtlasError::Config(format!(
                "collection '{}' is a {:?}, not a {:?}",
                name, entry.kind, kind
            )));
        }
        if entry.key != key || entry.value != value {
            return Err(AtlasError::Config(format!(
                "collection '{}' was created with serializers {:?}/{:?}, opened with {:?}/{:?}",
                name, entry.key, entry.value, key, value
            )));
        }
        Ok(Some(entry.clone()))
    }

    /// Write the catalog entry for a freshly created root
    fn publish(&self, catalog: &mut Catalog, name: &str, entry: CatalogEntry) -> Result<()> {
        let kind = entry.kind;
        catalog.insert(name.to_string(), entry);
        if let Err(e) = catalog::save(self.engine.as_ref(), catalog) {
            catalog.remove(name);
            return Err(e);
        }
        debug!(name, ?kind, "Collection created");
        Ok(())
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Error closing DB on drop");
        }
    }
}

// =============================================================================
// Builders
// =============================================================================

pub struct TreeMapBuilder<'db, K, V> {
    db: &'db DB,
    name: String,
    node_size: usize,
    keys: Arc<dyn Serializer<K>>,
    values: Arc<dyn Serializer<V>>,
    pump_source: Option<PumpSource<K>>,
    pump_values: Option<Box<dyn Fn(&K) -> V>>,
}

impl<'db, K, V> TreeMapBuilder<'db, K, V>
where
    K: Ord + 'static,
    V: 'static,
{
    /// Maximum keys per node (at least 3)
    pub fn node_size(mut self, node_size: usize) -> Self {
        self.node_size = node_size;
        self
    }

    pub fn key_serializer(mut self, serializer: Arc<dyn Serializer<K>>) -> Self {
        self.keys = serializer;
        self
    }

    pub fn value_serializer(mut self, serializer: Arc<dyn Serializer<V>>) -> Self {
        self.values = serializer;
        self
    }

    /// Build the new map from strictly ascending keys instead of inserting
    pub fn pump_source<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        I::IntoIter: 'static,
    {
        self.pump_source = Some(Box::new(keys.into_iter().map(Ok)));
        self
    }

    /// Like `pump_source`, for fallible input such as `pump::sort` output
    pub fn pump_sorted<I>(mut self, keys: I) -> Self
    where
        I: Iterator<Item = Result<K>> + 'static,
    {
        self.pump_source = Some(Box::new(keys));
        self
    }

    /// Value for each pumped key
    pub fn pump_values(mut self, values: impl Fn(&K) -> V + 'static) -> Self {
        self.pump_values = Some(Box::new(values));
        self
    }

    pub fn make(self) -> Result<TreeMap<K, V>> {
        let db = self.db;
        db.ensure_open()?;
        pump::check_node_size(self.node_size)?;
        if self.pump_source.is_some() && self.pump_values.is_none() {
            return Err(AtlasError::InvalidArgument(
                "a map pump source needs pump_values".to_string(),
            ));
        }

        let mut catalog = db.catalog.lock();
        let found = DB::existing(
            &catalog,
            &self.name,
            CollectionKind::TreeMap,
            self.keys.id(),
            Some(self.values.id()),
        )?;

        let entry = match found {
            Some(entry) => {
                if self.pump_source.is_some() {
                    return Err(AtlasError::Config(format!(
                        "collection '{}' already exists; a pump source only applies at creation",
                        self.name
                    )));
                }
                entry
            }
            None => {
                let root = match (self.pump_source, self.pump_values) {
                    (Some(source), Some(values_of)) => pump::build_tree(
                        db.engine.as_ref(),
                        source.map(|key| key.map(|k| {
                            let v = values_of(&k);
                            (k, v)
                        })),
                        self.node_size,
                        self.keys.as_ref(),
                        self.values.as_ref(),
                    )?,
                    _ => tree_map::create(db.engine.as_ref())?,
                };
                let entry = CatalogEntry {
                    kind: CollectionKind::TreeMap,
                    root,
                    key: self.keys.id(),
                    value: Some(self.values.id()),
                    node_size: self.node_size,
                };
                db.publish(&mut catalog, &self.name, entry.clone())?;
                entry
            }
        };

        let (keys, values) = (self.keys, self.values);
        db.handle(&self.name, || {
            TreeMap::open(Arc::clone(&db.engine), entry.root, entry.node_size, keys, values)
        })
    }
}

pub struct TreeSetBuilder<'db, K> {
    db: &'db DB,
    name: String,
    node_size: usize,
    serializer: Arc<dyn Serializer<K>>,
    pump_source: Option<PumpSource<K>>,
}

impl<'db, K> TreeSetBuilder<'db, K>
where
    K: Ord + 'static,
{
    /// Maximum keys per node (at least 3)
    pub fn node_size(mut self, node_size: usize) -> Self {
        self.node_size = node_size;
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer<K>>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Build the new set from strictly ascending keys instead of inserting
    pub fn pump_source<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        I::IntoIter: 'static,
    {
        self.pump_source = Some(Box::new(keys.into_iter().map(Ok)));
        self
    }

    /// Like `pump_source`, for fallible input such as `pump::sort` output
    pub fn pump_sorted<I>(mut self, keys: I) -> Self
    where
        I: Iterator<Item = Result<K>> + 'static,
    {
        self.pump_source = Some(Box::new(keys));
        self
    }

    pub fn make(self) -> Result<TreeSet<K>> {
        let db = self.db;
        db.ensure_open()?;
        pump::check_node_size(self.node_size)?;

        let mut catalog = db.catalog.lock();
        let found = DB::existing(
            &catalog,
            &self.name,
            CollectionKind::TreeSet,
            self.serializer.id(),
            None,
        )?;

        let entry = match found {
            Some(entry) => {
                if self.pump_source.is_some() {
                    return Err(AtlasError::Config(format!(
                        "collection '{}' already exists; a pump source only applies at creation",
                        self.name
                    )));
                }
                entry
            }
            None => {
                let root = match self.pump_source {
                    Some(source) => pump::build_tree(
                        db.engine.as_ref(),
                        source.map(|key| key.map(|k| (k, ()))),
                        self.node_size,
                        self.serializer.as_ref(),
                        &UNIT,
                    )?,
                    None => tree_map::create(db.engine.as_ref())?,
                };
                let entry = CatalogEntry {
                    kind: CollectionKind::TreeSet,
                    root,
                    key: self.serializer.id(),
                    value: None,
                    node_size: self.node_size,
                };
                db.publish(&mut catalog, &self.name, entry.clone())?;
                entry
            }
        };

        let serializer = self.serializer;
        db.handle(&self.name, || {
            TreeSet::from_map(TreeMap::open(
                Arc::clone(&db.engine),
                entry.root,
                entry.node_size,
                serializer,
                Arc::new(UNIT),
            ))
        })
    }
}

pub struct HashMapBuilder<'db, K, V> {
    db: &'db DB,
    name: String,
    keys: Arc<dyn Serializer<K>>,
    values: Arc<dyn Serializer<V>>,
}

impl<'db, K: 'static, V: 'static> HashMapBuilder<'db, K, V> {
    pub fn key_serializer(mut self, serializer: Arc<dyn Serializer<K>>) -> Self {
        self.keys = serializer;
        self
    }

    pub fn value_serializer(mut self, serializer: Arc<dyn Serializer<V>>) -> Self {
        self.values = serializer;
        self
    }

    pub fn make(self) -> Result<HashMap<K, V>> {
        let db = self.db;
        db.ensure_open()?;

        let mut catalog = db.catalog.lock();
        let found = DB::existing(
            &catalog,
            &self.name,
            CollectionKind::HashMap,
            self.keys.id(),
            Some(self.values.id()),
        )?;
        let root = match found {
            Some(entry) => entry.root,
            None => {
                let root = hash_map::create(db.engine.as_ref())?;
                let entry = CatalogEntry {
                    kind: CollectionKind::HashMap,
                    root,
                    key: self.keys.id(),
                    value: Some(self.values.id()),
                    node_size: 0,
                };
                db.publish(&mut catalog, &self.name, entry)?;
                root
            }
        };

        let (keys, values) = (self.keys, self.values);
        db.handle(&self.name, || {
            HashMap::open(Arc::clone(&db.engine), root, keys, values)
        })
    }
}

pub struct QueueBuilder<'db, V> {
    db: &'db DB,
    name: String,
    serializer: Arc<dyn Serializer<V>>,
}

impl<'db, V: 'static> QueueBuilder<'db, V> {
    pub fn serializer(mut self, serializer: Arc<dyn Serializer<V>>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn make(self) -> Result<Queue<V>> {
        let db = self.db;
        db.ensure_open()?;

        let mut catalog = db.catalog.lock();
        let found = DB::existing(
            &catalog,
            &self.name,
            CollectionKind::Queue,
            self.serializer.id(),
            None,
        )?;
        let root = match found {
            Some(entry) => entry.root,
            None => {
                let root = queue::create(db.engine.as_ref())?;
                let entry = CatalogEntry {
                    kind: CollectionKind::Queue,
                    root,
                    key: self.serializer.id(),
                    value: None,
                    node_size: 0,
                };
                db.publish(&mut catalog, &self.name, entry)?;
                root
            }
        };

        let serializer = self.serializer;
        db.handle(&self.name, || {
            Queue::open(Arc::clone(&db.engine), root, serializer)
        })
    }
}

