//! B+tree node and root-reference codecs
//!
//! Keys and values are kept as serialized blobs so the same nodes can be
//! walked without knowing the collection's Rust types (copy, drop).
//!
//! ## Node Record
//! ```text
//! ┌───────────┬───────────┬──────────────────────┐
//! │ Flags (1) │ N varint  │ N key blobs          │
//! ├───────────┴───────────┴──────────────────────┤
//! │ Leaf:  N value blobs | Next leaf varint (0 = none)
//! │ Inner: N+1 child recids (varint)              │
//! └───────────────────────────────────────────────┘
//! ```
//! In an inner node, `keys[i]` is the smallest key reachable through
//! `children[i + 1]`.
//!
//! ## Root Reference Record
//! `Root varint | Size varint`. The collection's catalog entry points here,
//! so the root can move (root split, bulk load) without touching the catalog.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::buffer::{DataInput, DataOutput};
use crate::engine::Engine;
use crate::error::{AtlasError, Result};
use crate::RecId;

const FLAG_LEAF: u8 = 1;

/// Raw (serialized) key/value pair
pub(crate) type RawEntry = (Vec<u8>, Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Leaf {
        keys: Vec<Vec<u8>>,
        values: Vec<Vec<u8>>,
        next: RecId,
    },
    Inner {
        keys: Vec<Vec<u8>>,
        children: Vec<RecId>,
    },
}

impl Node {
    pub(crate) fn empty_leaf() -> Self {
        Node::Leaf {
            keys: Vec::new(),
            values: Vec::new(),
            next: 0,
        }
    }

    pub(crate) fn keys(&self) -> &[Vec<u8>] {
        match self {
            Node::Leaf { keys, .. } | Node::Inner { keys, .. } => keys,
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = DataOutput::new();
        match self {
            Node::Leaf { keys, values, next } => {
                out.write_u8(FLAG_LEAF);
                out.pack_u64(keys.len() as u64);
                for key in keys {
                    out.write_blob(key);
                }
                for value in values {
                    out.write_blob(value);
                }
                out.pack_u64(*next);
            }
            Node::Inner { keys, children } => {
                out.write_u8(0);
                out.pack_u64(keys.len() as u64);
                for key in keys {
                    out.write_blob(key);
                }
                for child in children {
                    out.pack_u64(*child);
                }
            }
        }
        out.into_vec()
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        let mut input = DataInput::new(bytes);
        let flags = input.read_u8()?;
        let n = input.unpack_u64()? as usize;
        if n > input.remaining() {
            return Err(AtlasError::Corruption(format!(
                "tree node claims {} keys in {} bytes",
                n,
                bytes.len()
            )));
        }

        let mut keys = Vec::with_capacity(n);
        for _ in 0..n {
            keys.push(input.read_blob()?.to_vec());
        }

        let node = if flags & FLAG_LEAF != 0 {
            let mut values = Vec::with_capacity(n);
            for _ in 0..n {
                values.push(input.read_blob()?.to_vec());
            }
            let next = input.unpack_u64()?;
            Node::Leaf { keys, values, next }
        } else {
            let mut children = Vec::with_capacity(n + 1);
            for _ in 0..=n {
                children.push(input.unpack_u64()?);
            }
            Node::Inner { keys, children }
        };

        if input.remaining() != 0 {
            return Err(AtlasError::Corruption(format!(
                "{} trailing bytes after tree node",
                input.remaining()
            )));
        }
        Ok(node)
    }

    pub(crate) fn load(engine: &dyn Engine, recid: RecId) -> Result<Self> {
        Self::decode(&engine.get(recid)?)
    }
}

/// Where a tree's root lives and how many entries it holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RootRef {
    pub root: RecId,
    pub size: u64,
}

impl RootRef {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = DataOutput::with_capacity(20);
        out.pack_u64(self.root);
        out.pack_u64(self.size);
        out.into_vec()
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        let mut input = DataInput::new(bytes);
        let root = input.unpack_u64()?;
        let size = input.unpack_u64()?;
        Ok(Self { root, size })
    }

    pub(crate) fn load(engine: &dyn Engine, recid: RecId) -> Result<Self> {
        Self::decode(&engine.get(recid)?)
    }
}

/// Id of the leftmost leaf under `root`
pub(crate) fn leftmost_leaf(engine: &dyn Engine, root: RecId) -> Result<RecId> {
    let mut current = root;
    loop {
        match Node::load(engine, current)? {
            Node::Leaf { .. } => return Ok(current),
            Node::Inner { children, .. } => {
                current = *children.first().ok_or_else(|| {
                    AtlasError::Corruption(format!("inner node {} has no children", current))
                })?;
            }
        }
    }
}

/// Every node id of the tree under `root`, root first
pub(crate) fn node_ids(engine: &dyn Engine, root: RecId) -> Result<Vec<RecId>> {
    let mut ids = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(recid) = queue.pop_front() {
        ids.push(recid);
        if let Node::Inner { children, .. } = Node::load(engine, recid)? {
            queue.extend(children);
        }
    }
    Ok(ids)
}

/// Lazy walk over raw entries along the leaf chain
pub(crate) struct LeafEntries {
    engine: Arc<dyn Engine>,
    buffer: VecDeque<RawEntry>,
    next_leaf: RecId,
    failed: bool,
}

impl LeafEntries {
    /// Start at `leaf`, skipping entries before position `skip` in it
    pub(crate) fn starting_at(engine: Arc<dyn Engine>, leaf: RecId, skip: usize) -> Result<Self> {
        let mut entries = Self {
            engine,
            buffer: VecDeque::new(),
            next_leaf: leaf,
            failed: false,
        };
        entries.load_next()?;
        for _ in 0..skip {
            entries.buffer.pop_front();
        }
        Ok(entries)
    }

    /// Every entry of the tree under `root`
    pub(crate) fn from_root(engine: Arc<dyn Engine>, root: RecId) -> Result<Self> {
        let leaf = leftmost_leaf(engine.as_ref(), root)?;
        Self::starting_at(engine, leaf, 0)
    }

    fn load_next(&mut self) -> Result<()> {
        let recid = self.next_leaf;
        match Node::load(self.engine.as_ref(), recid)? {
            Node::Leaf { keys, values, next } => {
                self.buffer.extend(keys.into_iter().zip(values));
                self.next_leaf = next;
                Ok(())
            }
            Node::Inner { .. } => Err(AtlasError::Corruption(format!(
                "leaf chain reaches inner node {}",
                recid
            ))),
        }
    }
}

impl Iterator for LeafEntries {
    type Item = Result<RawEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Some(Ok(entry));
            }
            if self.next_leaf == 0 {
                return None;
            }
            if let Err(e) = self.load_next() {
                self.failed = true;
                return Some(Err(e));
            }
        }
    }
}
