//! FIFO queue as a singly linked list of records
//!
//! ```text
//! Header record: Head varint | Tail varint | Size varint   (0 = none)
//! Node record:   Next varint | Value blob
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{DataInput, DataOutput};
use crate::engine::Engine;
use crate::error::Result;
use crate::serializer::{from_bytes, to_bytes, Serializer};
use crate::RecId;

#[derive(Debug, Clone, Copy)]
struct Header {
    head: RecId,
    tail: RecId,
    size: u64,
}

impl Header {
    fn encode(&self) -> Vec<u8> {
        let mut out = DataOutput::new();
        out.pack_u64(self.head);
        out.pack_u64(self.tail);
        out.pack_u64(self.size);
        out.into_vec()
    }

    fn load(engine: &dyn Engine, recid: RecId) -> Result<Self> {
        let bytes = engine.get(recid)?;
        let mut input = DataInput::new(&bytes);
        Ok(Self {
            head: input.unpack_u64()?,
            tail: input.unpack_u64()?,
            size: input.unpack_u64()?,
        })
    }
}

fn encode_node(next: RecId, value: &[u8]) -> Vec<u8> {
    let mut out = DataOutput::with_capacity(value.len() + 12);
    out.pack_u64(next);
    out.write_blob(value);
    out.into_vec()
}

fn load_node(engine: &dyn Engine, recid: RecId) -> Result<(RecId, Vec<u8>)> {
    let bytes = engine.get(recid)?;
    let mut input = DataInput::new(&bytes);
    let next = input.unpack_u64()?;
    let value = input.read_blob()?.to_vec();
    Ok((next, value))
}

// =============================================================================
// Byte-level operations (shared with pump copy)
// =============================================================================

/// Write an empty header and return its record id
pub(crate) fn create(engine: &dyn Engine) -> Result<RecId> {
    engine.put(
        &Header {
            head: 0,
            tail: 0,
            size: 0,
        }
        .encode(),
    )
}

pub(crate) fn raw_offer(engine: &dyn Engine, header_recid: RecId, value: &[u8]) -> Result<()> {
    let mut header = Header::load(engine, header_recid)?;
    let node = engine.put(&encode_node(0, value))?;

    if header.tail == 0 {
        header.head = node;
    } else {
        let (_, tail_value) = load_node(engine, header.tail)?;
        engine.update(header.tail, &encode_node(node, &tail_value))?;
    }
    header.tail = node;
    header.size += 1;
    engine.update(header_recid, &header.encode())
}

pub(crate) fn raw_poll(engine: &dyn Engine, header_recid: RecId) -> Result<Option<Vec<u8>>> {
    let mut header = Header::load(engine, header_recid)?;
    if header.head == 0 {
        return Ok(None);
    }
    let (next, value) = load_node(engine, header.head)?;
    engine.delete(header.head)?;

    header.head = next;
    if next == 0 {
        header.tail = 0;
    }
    header.size = header.size.saturating_sub(1);
    engine.update(header_recid, &header.encode())?;
    Ok(Some(value))
}

pub(crate) fn raw_peek(engine: &dyn Engine, header_recid: RecId) -> Result<Option<Vec<u8>>> {
    let header = Header::load(engine, header_recid)?;
    if header.head == 0 {
        return Ok(None);
    }
    Ok(Some(load_node(engine, header.head)?.1))
}

/// Lazy walk from head to tail
pub(crate) fn raw_values(engine: Arc<dyn Engine>, header_recid: RecId) -> Result<QueueValues> {
    let header = Header::load(engine.as_ref(), header_recid)?;
    Ok(QueueValues {
        engine,
        next: header.head,
    })
}

/// Free the header and every node
pub(crate) fn free(engine: &dyn Engine, header_recid: RecId) -> Result<()> {
    let header = Header::load(engine, header_recid)?;
    let mut current = header.head;
    while current != 0 {
        let (next, _) = load_node(engine, current)?;
        engine.delete(current)?;
        current = next;
    }
    engine.delete(header_recid)
}

pub(crate) struct QueueValues {
    engine: Arc<dyn Engine>,
    next: RecId,
}

impl Iterator for QueueValues {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == 0 {
            return None;
        }
        match load_node(self.engine.as_ref(), self.next) {
            Ok((next, value)) => {
                self.next = next;
                Some(Ok(value))
            }
            Err(e) => {
                self.next = 0;
                Some(Err(e))
            }
        }
    }
}

// =============================================================================
// Typed handle
// =============================================================================

struct QueueInner<V> {
    engine: Arc<dyn Engine>,
    header: RecId,
    values: Arc<dyn Serializer<V>>,
    lock: Mutex<()>,
}

/// Persistent FIFO queue
pub struct Queue<V> {
    inner: Arc<QueueInner<V>>,
}

impl<V> Clone for Queue<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: 'static> Queue<V> {
    pub(crate) fn open(engine: Arc<dyn Engine>, header: RecId, values: Arc<dyn Serializer<V>>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                engine,
                header,
                values,
                lock: Mutex::new(()),
            }),
        }
    }

    /// Append to the tail
    pub fn offer(&self, value: &V) -> Result<()> {
        let bytes = to_bytes(self.inner.values.as_ref(), value)?;
        let _guard = self.inner.lock.lock();
        raw_offer(self.inner.engine.as_ref(), self.inner.header, &bytes)
    }

    /// Remove and return the head
    pub fn poll(&self) -> Result<Option<V>> {
        let _guard = self.inner.lock.lock();
        raw_poll(self.inner.engine.as_ref(), self.inner.header)?
            .map(|v| from_bytes(self.inner.values.as_ref(), &v))
            .transpose()
    }

    /// Return the head without removing it
    pub fn peek(&self) -> Result<Option<V>> {
        let _guard = self.inner.lock.lock();
        raw_peek(self.inner.engine.as_ref(), self.inner.header)?
            .map(|v| from_bytes(self.inner.values.as_ref(), &v))
            .transpose()
    }

    pub fn len(&self) -> Result<u64> {
        let _guard = self.inner.lock.lock();
        Ok(Header::load(self.inner.engine.as_ref(), self.inner.header)?.size)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Values from head to tail
    pub fn iter(&self) -> Result<QueueIter<V>> {
        let _guard = self.inner.lock.lock();
        Ok(QueueIter {
            values: raw_values(Arc::clone(&self.inner.engine), self.inner.header)?,
            serializer: Arc::clone(&self.inner.values),
        })
    }
}

pub struct QueueIter<V> {
    values: QueueValues,
    serializer: Arc<dyn Serializer<V>>,
}

impl<V> Iterator for QueueIter<V> {
    type Item = Result<V>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = self.values.next()?;
        Some(raw.and_then(|bytes| from_bytes(self.serializer.as_ref(), &bytes)))
    }
}
