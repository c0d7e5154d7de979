//! Compression layer
//!
//! Every record is packed into a tagged block on the way down and unpacked
//! on the way up:
//! ```text
//! ┌─────────┬──────────────────────────────────────────────┐
//! │ Tag (1) │ 0: bytes as given                            │
//! │         │ 1: UncompressedLen u32 LE (4) | LZ4 block    │
//! └─────────┴──────────────────────────────────────────────┘
//! ```
//! An empty block (a reservation never written) reads as an empty record.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::serializer::{pack_block, unpack_block};
use crate::RecId;

use super::Engine;

/// LZ4 per-record compression
pub struct CompressEngine {
    inner: Arc<dyn Engine>,
}

impl CompressEngine {
    pub fn new(inner: Arc<dyn Engine>) -> Self {
        Self { inner }
    }
}

impl Engine for CompressEngine {
    fn preallocate(&self) -> Result<RecId> {
        self.inner.preallocate()
    }

    fn put(&self, data: &[u8]) -> Result<RecId> {
        self.inner.put(&pack_block(data))
    }

    fn get(&self, recid: RecId) -> Result<Bytes> {
        let block = self.inner.get(recid)?;
        Ok(Bytes::from(unpack_block(&block)?))
    }

    fn update(&self, recid: RecId, data: &[u8]) -> Result<()> {
        self.inner.update(recid, &pack_block(data))
    }

    fn delete(&self, recid: RecId) -> Result<()> {
        self.inner.delete(recid)
    }

    fn restore(&self, recid: RecId, data: &[u8]) -> Result<()> {
        self.inner.restore(recid, &pack_block(data))
    }

    fn contains(&self, recid: RecId) -> Result<bool> {
        self.inner.contains(recid)
    }

    fn recids(&self) -> Result<Vec<RecId>> {
        self.inner.recids()
    }

    fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    fn rollback(&self) -> Result<()> {
        self.inner.rollback()
    }

    fn compact(&self) -> Result<()> {
        self.inner.compact()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn can_rollback(&self) -> bool {
        self.inner.can_rollback()
    }
}
