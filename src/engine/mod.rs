//! Engine Module
//!
//! The record contract shared by the stores and every layer stacked on them.
//!
//! ## Layers (outer → inner, as assembled by `DB::open`)
//! ```text
//!   CacheEngine       raw-bytes LRU, lock-striped
//!        │
//!   CompressEngine    LZ4 per record
//!        │
//!   AsyncWriteEngine  bounded queue + background writer
//!        │
//!   TxEngine          buffered transaction + WAL
//!        │
//!   Store | AppendStore
//! ```
//!
//! Each layer holds its neighbour as `Arc<dyn Engine>` and never sees a
//! concrete type below it; which layers exist is decided by `Config`.

mod async_write;
mod cache;
mod compress;
mod tx;

use bytes::Bytes;

use crate::error::Result;
use crate::serializer::{from_bytes, to_bytes, Serializer};
use crate::RecId;

pub use async_write::AsyncWriteEngine;
pub use cache::CacheEngine;
pub use compress::CompressEngine;
pub use tx::{TxEngine, TxState};

/// Record-level storage contract
///
/// Record ids are stable handles: `update` never changes them, and an id is
/// only handed out again after `delete`.
pub trait Engine: Send + Sync {
    /// Reserve a record id. The record reads as empty until its first
    /// `update`, and the reservation is not durable until then.
    fn preallocate(&self) -> Result<RecId>;

    /// Store a new record and return its id
    fn put(&self, data: &[u8]) -> Result<RecId>;

    /// Read a record; `RecordNotFound` for unknown or deleted ids
    fn get(&self, recid: RecId) -> Result<Bytes>;

    /// Replace a record's bytes
    fn update(&self, recid: RecId, data: &[u8]) -> Result<()>;

    /// Free a record (or a reservation)
    fn delete(&self, recid: RecId) -> Result<()>;

    /// Write `data` under `recid` whether or not the id is currently in use.
    /// Used by log replay and by id-preserving copies.
    fn restore(&self, recid: RecId, data: &[u8]) -> Result<()>;

    /// Whether `recid` is live or reserved
    fn contains(&self, recid: RecId) -> Result<bool>;

    /// Ids of all live records, ascending
    fn recids(&self) -> Result<Vec<RecId>>;

    /// Make every mutation so far durable
    fn commit(&self) -> Result<()>;

    /// Discard mutations since the last commit
    fn rollback(&self) -> Result<()>;

    /// Rewrite live records to reclaim space; ids are unchanged
    fn compact(&self) -> Result<()>;

    /// Flush and release the medium; later calls fail with `Closed`
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Whether `rollback` is supported by this chain
    fn can_rollback(&self) -> bool;
}

/// Typed access on top of any engine
pub trait EngineExt: Engine {
    fn put_value<T, S: Serializer<T> + ?Sized>(&self, value: &T, serializer: &S) -> Result<RecId> {
        let bytes = to_bytes(serializer, value)?;
        self.put(&bytes)
    }

    fn get_value<T, S: Serializer<T> + ?Sized>(&self, recid: RecId, serializer: &S) -> Result<T> {
        let bytes = self.get(recid)?;
        from_bytes(serializer, &bytes)
    }

    fn update_value<T, S: Serializer<T> + ?Sized>(
        &self,
        recid: RecId,
        value: &T,
        serializer: &S,
    ) -> Result<()> {
        let bytes = to_bytes(serializer, value)?;
        self.update(recid, &bytes)
    }
}

impl<E: Engine + ?Sized> EngineExt for E {}
