//! Cache layer
//!
//! Bounded LRU of raw record bytes, split into lock-striped segments so
//! readers of different records rarely contend.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::{AtlasError, Result};
use crate::RecId;

use super::Engine;

const SEGMENTS: usize = 16;

/// One LRU stripe: recency is a monotonically increasing stamp
struct Segment {
    entries: HashMap<RecId, (u64, Bytes)>,
    /// stamp → recid, oldest first
    order: BTreeMap<u64, RecId>,
    next_stamp: u64,
    capacity: usize,
}

impl Segment {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_stamp: 0,
            capacity,
        }
    }

    fn get(&mut self, recid: RecId) -> Option<Bytes> {
        let stamp = self.next_stamp;
        let (old, data) = self.entries.get_mut(&recid)?;
        self.order.remove(old);
        *old = stamp;
        self.order.insert(stamp, recid);
        self.next_stamp += 1;
        Some(data.clone())
    }

    fn insert(&mut self, recid: RecId, data: Bytes) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        if let Some((old, _)) = self.entries.insert(recid, (stamp, data)) {
            self.order.remove(&old);
        }
        self.order.insert(stamp, recid);

        while self.entries.len() > self.capacity {
            match self.order.pop_first() {
                Some((_, victim)) => {
                    self.entries.remove(&victim);
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, recid: RecId) {
        if let Some((stamp, _)) = self.entries.remove(&recid) {
            self.order.remove(&stamp);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Read cache over raw record bytes
///
/// ## Concurrency
/// A record's segment lock is held across the inner call on a miss and on
/// every mutation of that record, so a cached entry never goes stale.
pub struct CacheEngine {
    inner: Arc<dyn Engine>,
    segments: Vec<Mutex<Segment>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheEngine {
    /// Cache up to `capacity` records (spread over the segments)
    pub fn new(inner: Arc<dyn Engine>, capacity: usize) -> Self {
        let per_segment = capacity.div_ceil(SEGMENTS).max(1);
        let segments = (0..SEGMENTS)
            .map(|_| Mutex::new(Segment::new(per_segment)))
            .collect();

        Self {
            inner,
            segments,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn segment(&self, recid: RecId) -> MutexGuard<'_, Segment> {
        self.segments[(recid as usize) % SEGMENTS].lock()
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(AtlasError::Closed);
        }
        Ok(())
    }

    fn clear_all(&self) {
        for segment in &self.segments {
            segment.lock().clear();
        }
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Number of records currently cached
    pub fn cached_count(&self) -> usize {
        self.segments.iter().map(|s| s.lock().entries.len()).sum()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Engine for CacheEngine {
    fn preallocate(&self) -> Result<RecId> {
        self.inner.preallocate()
    }

    fn put(&self, data: &[u8]) -> Result<RecId> {
        let recid = self.inner.put(data)?;
        self.segment(recid)
            .insert(recid, Bytes::copy_from_slice(data));
        Ok(recid)
    }

    fn get(&self, recid: RecId) -> Result<Bytes> {
        self.check_open()?;
        let mut segment = self.segment(recid);
        if let Some(data) = segment.get(recid) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(data);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let data = self.inner.get(recid)?;
        segment.insert(recid, data.clone());
        Ok(data)
    }

    fn update(&self, recid: RecId, data: &[u8]) -> Result<()> {
        let mut segment = self.segment(recid);
        match self.inner.update(recid, data) {
            Ok(()) => {
                segment.insert(recid, Bytes::copy_from_slice(data));
                Ok(())
            }
            Err(e) => {
                segment.remove(recid);
                Err(e)
            }
        }
    }

    fn delete(&self, recid: RecId) -> Result<()> {
        let mut segment = self.segment(recid);
        segment.remove(recid);
        self.inner.delete(recid)
    }

    fn restore(&self, recid: RecId, data: &[u8]) -> Result<()> {
        let mut segment = self.segment(recid);
        segment.remove(recid);
        self.inner.restore(recid, data)
    }

    fn contains(&self, recid: RecId) -> Result<bool> {
        self.check_open()?;
        if self.segment(recid).entries.contains_key(&recid) {
            return Ok(true);
        }
        self.inner.contains(recid)
    }

    fn recids(&self) -> Result<Vec<RecId>> {
        self.inner.recids()
    }

    fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    /// Rolled-back records may be cached with their discarded bytes, so the
    /// whole cache goes. All segment locks are held across the rollback.
    fn rollback(&self) -> Result<()> {
        let mut guards: Vec<MutexGuard<'_, Segment>> =
            self.segments.iter().map(|s| s.lock()).collect();
        let result = self.inner.rollback();
        for guard in guards.iter_mut() {
            guard.clear();
        }
        debug!("Cache cleared on rollback");
        result
    }

    fn compact(&self) -> Result<()> {
        self.inner.compact()
    }

    fn close(&self) -> Result<()> {
        self.clear_all();
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn can_rollback(&self) -> bool {
        self.inner.can_rollback()
    }
}
