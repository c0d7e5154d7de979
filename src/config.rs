//! Configuration for AtlasDB
//!
//! Centralized configuration with sensible defaults. The builder decides which
//! engine layers `DB::open` stacks on top of the store.

use std::path::PathBuf;

/// Main configuration for an AtlasDB instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Backing medium for records. Fixed for the lifetime of the instance.
    pub backing: Backing,

    /// Remove backing files (and the WAL) when the DB is closed
    pub delete_files_after_close: bool,

    /// Segment size for append-only stores before rolling to a new file
    pub segment_size: u64,

    // -------------------------------------------------------------------------
    // Durability Configuration
    // -------------------------------------------------------------------------
    /// Install the transaction layer (WAL, commit/rollback, crash atomicity)
    pub transactions: bool,

    /// Sync strategy: how often to fsync WAL between commits
    pub wal_sync_strategy: WalSyncStrategy,

    /// Hand mutations to a background writer thread
    pub async_write: bool,

    /// Capacity of the async write queue; producers block when it is full
    pub async_queue_size: usize,

    /// Idle interval after which the async writer checkpoints a
    /// non-transactional store (milliseconds)
    pub async_flush_interval_ms: u64,

    /// Bounded wait for the async writer to drain on close (milliseconds)
    pub close_timeout_ms: u64,

    // -------------------------------------------------------------------------
    // Cache / Compression Configuration
    // -------------------------------------------------------------------------
    /// Number of records held by the cache layer; `None` disables it
    pub cache_size: Option<usize>,

    /// Install the compression layer
    pub compression: bool,

    // -------------------------------------------------------------------------
    // Collection Configuration
    // -------------------------------------------------------------------------
    /// Default fan-out for tree collections
    pub node_size: usize,
}

/// Backing medium for the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// In-process memory, gone when the DB is dropped
    Heap,

    /// Single random-access file, updated in place.
    /// Layout:
    ///   {path}       (record data)
    ///   {path}.idx   (record index)
    ///   {path}.wal   (write-ahead log)
    File(PathBuf),

    /// Directory of write-once segments, reclaimed by compaction.
    /// Layout:
    ///   {dir}/segment_000001.log ...
    ///   {dir}/wal.log
    AppendOnly(PathBuf),
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy)]
pub enum WalSyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N unsynced entries; commit markers always sync
    EveryNEntries { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backing: Backing::Heap,
            delete_files_after_close: false,
            segment_size: 16 * 1024 * 1024, // 16 MB
            transactions: true,
            wal_sync_strategy: WalSyncStrategy::EveryNEntries { count: 1024 },
            async_write: false,
            async_queue_size: 1024,
            async_flush_interval_ms: 1000,
            close_timeout_ms: 5000,
            cache_size: Some(2048),
            compression: false,
            node_size: 32,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// WAL location for this backing, if it has one on disk
    pub fn wal_path(&self) -> Option<PathBuf> {
        match &self.backing {
            Backing::Heap => None,
            Backing::File(path) => {
                let mut name = path.as_os_str().to_owned();
                name.push(".wal");
                Some(PathBuf::from(name))
            }
            Backing::AppendOnly(dir) => Some(dir.join("wal.log")),
        }
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Keep records in memory only
    pub fn heap(mut self) -> Self {
        self.config.backing = Backing::Heap;
        self
    }

    /// Store records in a single file updated in place
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.backing = Backing::File(path.into());
        self
    }

    /// Store records in append-only segments under a directory
    pub fn append_only(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.backing = Backing::AppendOnly(dir.into());
        self
    }

    /// Set the backing medium directly
    pub fn backing(mut self, backing: Backing) -> Self {
        self.config.backing = backing;
        self
    }

    /// Enable the background writer
    pub fn async_write_enable(mut self) -> Self {
        self.config.async_write = true;
        self
    }

    /// Set the async queue capacity
    pub fn async_queue_size(mut self, size: usize) -> Self {
        self.config.async_queue_size = size;
        self
    }

    /// Set the idle checkpoint interval of the async writer (in milliseconds)
    pub fn async_flush_interval_ms(mut self, ms: u64) -> Self {
        self.config.async_flush_interval_ms = ms;
        self
    }

    /// Set how long close waits for the async writer (in milliseconds)
    pub fn close_timeout_ms(mut self, ms: u64) -> Self {
        self.config.close_timeout_ms = ms;
        self
    }

    /// Remove the cache layer
    pub fn cache_disable(mut self) -> Self {
        self.config.cache_size = None;
        self
    }

    /// Set the number of cached records
    pub fn cache_size(mut self, size: usize) -> Self {
        self.config.cache_size = Some(size);
        self
    }

    /// Compress records before they reach the store
    pub fn compression_enable(mut self) -> Self {
        self.config.compression = true;
        self
    }

    /// Skip the WAL/transaction layer
    pub fn transaction_disable(mut self) -> Self {
        self.config.transactions = false;
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    /// Remove backing files on close
    pub fn delete_files_after_close(mut self) -> Self {
        self.config.delete_files_after_close = true;
        self
    }

    /// Set the default tree fan-out
    pub fn node_size(mut self, size: usize) -> Self {
        self.config.node_size = size;
        self
    }

    /// Set the append-only segment size (in bytes)
    pub fn segment_size(mut self, size: u64) -> Self {
        self.config.segment_size = size;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
