//! Hash map over a directory of bucket records
//!
//! ## Layout
//! ```text
//! Directory record:  Size varint | N varint | N bucket recids (0 = empty)
//! Bucket record:     M varint | M × (key blob, value blob)
//! ```
//! A key lives in bucket `crc32(serialized key) % N`. Keys compare by their
//! serialized bytes, so a key type's serializer must be deterministic. The
//! directory doubles (and every entry is rehashed) once the average bucket
//! holds more than `LOAD_FACTOR` entries.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::buffer::{DataInput, DataOutput};
use crate::engine::Engine;
use crate::error::{AtlasError, Result};
use crate::serializer::{from_bytes, to_bytes, Serializer};
use crate::RecId;

use super::node::RawEntry;

const INITIAL_BUCKETS: usize = 16;
const LOAD_FACTOR: u64 = 4;

struct Directory {
    size: u64,
    buckets: Vec<RecId>,
}

impl Directory {
    fn encode(&self) -> Vec<u8> {
        let mut out = DataOutput::new();
        out.pack_u64(self.size);
        out.pack_u64(self.buckets.len() as u64);
        for recid in &self.buckets {
            out.pack_u64(*recid);
        }
        out.into_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut input = DataInput::new(bytes);
        let size = input.unpack_u64()?;
        let n = input.unpack_u64()? as usize;
        if n == 0 || n > input.remaining() {
            return Err(AtlasError::Corruption(format!(
                "hash directory claims {} buckets in {} bytes",
                n,
                bytes.len()
            )));
        }
        let mut buckets = Vec::with_capacity(n);
        for _ in 0..n {
            buckets.push(input.unpack_u64()?);
        }
        Ok(Self { size, buckets })
    }

    fn load(engine: &dyn Engine, recid: RecId) -> Result<Self> {
        Self::decode(&engine.get(recid)?)
    }

    fn slot(&self, key: &[u8]) -> usize {
        crc32fast::hash(key) as usize % self.buckets.len()
    }
}

fn encode_bucket(entries: &[RawEntry]) -> Vec<u8> {
    let mut out = DataOutput::new();
    out.pack_u64(entries.len() as u64);
    for (key, value) in entries {
        out.write_blob(key);
        out.write_blob(value);
    }
    out.into_vec()
}

fn decode_bucket(bytes: &[u8]) -> Result<Vec<RawEntry>> {
    let mut input = DataInput::new(bytes);
    let n = input.unpack_u64()? as usize;
    if n > input.remaining() {
        return Err(AtlasError::Corruption(format!(
            "hash bucket claims {} entries in {} bytes",
            n,
            bytes.len()
        )));
    }
    let mut entries = Vec::with_capacity(n);
    for _ in 0..n {
        let key = input.read_blob()?.to_vec();
        let value = input.read_blob()?.to_vec();
        entries.push((key, value));
    }
    Ok(entries)
}

fn load_bucket(engine: &dyn Engine, recid: RecId) -> Result<Vec<RawEntry>> {
    if recid == 0 {
        return Ok(Vec::new());
    }
    decode_bucket(&engine.get(recid)?)
}

// =============================================================================
// Byte-level operations (shared with pump copy)
// =============================================================================

/// Write an empty directory and return its record id
pub(crate) fn create(engine: &dyn Engine) -> Result<RecId> {
    let dir = Directory {
        size: 0,
        buckets: vec![0; INITIAL_BUCKETS],
    };
    engine.put(&dir.encode())
}

pub(crate) fn raw_insert(
    engine: &dyn Engine,
    dir_recid: RecId,
    key: Vec<u8>,
    value: Vec<u8>,
) -> Result<Option<Vec<u8>>> {
    let mut dir = Directory::load(engine, dir_recid)?;
    let slot = dir.slot(&key);
    let bucket_recid = dir.buckets[slot];

    if bucket_recid == 0 {
        dir.buckets[slot] = engine.put(&encode_bucket(&[(key, value)]))?;
    } else {
        let mut entries = load_bucket(engine, bucket_recid)?;
        if let Some(entry) = entries.iter_mut().find(|(k, _)| *k == key) {
            let old = std::mem::replace(&mut entry.1, value);
            engine.update(bucket_recid, &encode_bucket(&entries))?;
            return Ok(Some(old));
        }
        entries.push((key, value));
        engine.update(bucket_recid, &encode_bucket(&entries))?;
    }

    dir.size += 1;
    if dir.size > LOAD_FACTOR * dir.buckets.len() as u64 {
        grow(engine, &mut dir)?;
    }
    engine.update(dir_recid, &dir.encode())?;
    Ok(None)
}

pub(crate) fn raw_get(engine: &dyn Engine, dir_recid: RecId, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let dir = Directory::load(engine, dir_recid)?;
    let entries = load_bucket(engine, dir.buckets[dir.slot(key)])?;
    Ok(entries
        .into_iter()
        .find(|(k, _)| k.as_slice() == key)
        .map(|(_, v)| v))
}

pub(crate) fn raw_remove(
    engine: &dyn Engine,
    dir_recid: RecId,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let mut dir = Directory::load(engine, dir_recid)?;
    let slot = dir.slot(key);
    let bucket_recid = dir.buckets[slot];
    let mut entries = load_bucket(engine, bucket_recid)?;

    let Some(pos) = entries.iter().position(|(k, _)| k.as_slice() == key) else {
        return Ok(None);
    };
    let (_, old) = entries.swap_remove(pos);

    if entries.is_empty() {
        engine.delete(bucket_recid)?;
        dir.buckets[slot] = 0;
    } else {
        engine.update(bucket_recid, &encode_bucket(&entries))?;
    }
    dir.size = dir.size.saturating_sub(1);
    engine.update(dir_recid, &dir.encode())?;
    Ok(Some(old))
}

pub(crate) fn raw_len(engine: &dyn Engine, dir_recid: RecId) -> Result<u64> {
    Ok(Directory::load(engine, dir_recid)?.size)
}

/// Lazy walk over every raw entry, bucket by bucket
pub(crate) fn raw_entries(engine: Arc<dyn Engine>, dir_recid: RecId) -> Result<HashEntries> {
    let dir = Directory::load(engine.as_ref(), dir_recid)?;
    Ok(HashEntries {
        engine,
        buckets: dir.buckets.into_iter().filter(|r| *r != 0).collect(),
        buffer: VecDeque::new(),
        failed: false,
    })
}

/// Free the directory and every bucket
pub(crate) fn free(engine: &dyn Engine, dir_recid: RecId) -> Result<()> {
    let dir = Directory::load(engine, dir_recid)?;
    for recid in dir.buckets.into_iter().filter(|r| *r != 0) {
        engine.delete(recid)?;
    }
    engine.delete(dir_recid)
}

/// Double the bucket count and redistribute every entry
fn grow(engine: &dyn Engine, dir: &mut Directory) -> Result<()> {
    let new_len = dir.buckets.len() * 2;
    let mut regrouped: Vec<Vec<RawEntry>> = vec![Vec::new(); new_len];

    for recid in dir.buckets.iter().copied().filter(|r| *r != 0) {
        for (key, value) in load_bucket(engine, recid)? {
            let slot = crc32fast::hash(&key) as usize % new_len;
            regrouped[slot].push((key, value));
        }
        engine.delete(recid)?;
    }

    let mut buckets = Vec::with_capacity(new_len);
    for entries in regrouped {
        if entries.is_empty() {
            buckets.push(0);
        } else {
            buckets.push(engine.put(&encode_bucket(&entries))?);
        }
    }

    debug!(buckets = new_len, size = dir.size, "Hash directory grown");
    dir.buckets = buckets;
    Ok(())
}

pub(crate) struct HashEntries {
    engine: Arc<dyn Engine>,
    buckets: VecDeque<RecId>,
    buffer: VecDeque<RawEntry>,
    failed: bool,
}

impl Iterator for HashEntries {
    type Item = Result<RawEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Some(Ok(entry));
            }
            let recid = self.buckets.pop_front()?;
            match load_bucket(self.engine.as_ref(), recid) {
                Ok(entries) => self.buffer.extend(entries),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

// =============================================================================
// Typed handle
// =============================================================================

struct HashInner<K, V> {
    engine: Arc<dyn Engine>,
    dir: RecId,
    keys: Arc<dyn Serializer<K>>,
    values: Arc<dyn Serializer<V>>,
    lock: RwLock<()>,
}

/// Persistent hash map; iteration order is unspecified
pub struct HashMap<K, V> {
    inner: Arc<HashInner<K, V>>,
}

impl<K, V> Clone for HashMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: 'static, V: 'static> HashMap<K, V> {
    pub(crate) fn open(
        engine: Arc<dyn Engine>,
        dir: RecId,
        keys: Arc<dyn Serializer<K>>,
        values: Arc<dyn Serializer<V>>,
    ) -> Self {
        Self {
            inner: Arc::new(HashInner {
                engine,
                dir,
                keys,
                values,
                lock: RwLock::new(()),
            }),
        }
    }

    /// Insert or replace; returns the previous value
    pub fn insert(&self, key: &K, value: &V) -> Result<Option<V>> {
        let inner = &self.inner;
        let key_bytes = to_bytes(inner.keys.as_ref(), key)?;
        let value_bytes = to_bytes(inner.values.as_ref(), value)?;
        let _guard = inner.lock.write();
        raw_insert(inner.engine.as_ref(), inner.dir, key_bytes, value_bytes)?
            .map(|old| from_bytes(inner.values.as_ref(), &old))
            .transpose()
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let inner = &self.inner;
        let key_bytes = to_bytes(inner.keys.as_ref(), key)?;
        let _guard = inner.lock.read();
        raw_get(inner.engine.as_ref(), inner.dir, &key_bytes)?
            .map(|v| from_bytes(inner.values.as_ref(), &v))
            .transpose()
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let inner = &self.inner;
        let key_bytes = to_bytes(inner.keys.as_ref(), key)?;
        let _guard = inner.lock.read();
        Ok(raw_get(inner.engine.as_ref(), inner.dir, &key_bytes)?.is_some())
    }

    /// Remove `key`; returns its value if it was present
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let inner = &self.inner;
        let key_bytes = to_bytes(inner.keys.as_ref(), key)?;
        let _guard = inner.lock.write();
        raw_remove(inner.engine.as_ref(), inner.dir, &key_bytes)?
            .map(|old| from_bytes(inner.values.as_ref(), &old))
            .transpose()
    }

    pub fn len(&self) -> Result<u64> {
        let _guard = self.inner.lock.read();
        raw_len(self.inner.engine.as_ref(), self.inner.dir)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every entry, bucket by bucket
    pub fn iter(&self) -> Result<HashIter<K, V>> {
        let _guard = self.inner.lock.read();
        Ok(HashIter {
            entries: raw_entries(Arc::clone(&self.inner.engine), self.inner.dir)?,
            keys: Arc::clone(&self.inner.keys),
            values: Arc::clone(&self.inner.values),
        })
    }

    /// Directory record referenced by the catalog
    pub fn dir_recid(&self) -> RecId {
        self.inner.dir
    }
}

pub struct HashIter<K, V> {
    entries: HashEntries,
    keys: Arc<dyn Serializer<K>>,
    values: Arc<dyn Serializer<V>>,
}

impl<K, V> Iterator for HashIter<K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = self.entries.next()?;
        Some(raw.and_then(|(k, v)| {
            Ok((
                from_bytes(self.keys.as_ref(), &k)?,
                from_bytes(self.values.as_ref(), &v)?,
            ))
        }))
    }
}
