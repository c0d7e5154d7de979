//! Bottom-up B+tree construction from sorted input
//!
//! ## Process
//! ```text
//! sorted entries ──► leaves (node_size each, chained through `next`)
//!                        │ first key + id of every leaf
//!                        ▼
//!                    inner level ──► inner level ──► ... ──► root
//!                        │
//!                        ▼
//!                    root reference { root, size }
//! ```
//! Each node is written exactly once. A leaf's successor id is reserved with
//! `preallocate` as soon as the leaf is full, so the chain is complete
//! without rewriting any leaf.

use tracing::{debug, warn};

use crate::db::node::{Node, RawEntry, RootRef};
use crate::engine::Engine;
use crate::error::{AtlasError, Result};
use crate::serializer::{to_bytes, Serializer};
use crate::RecId;

/// Smallest fan-out that still lets a node split into two non-empty halves
pub(crate) const MIN_NODE_SIZE: usize = 3;

pub(crate) fn check_node_size(node_size: usize) -> Result<()> {
    if node_size < MIN_NODE_SIZE {
        return Err(AtlasError::InvalidArgument(format!(
            "node size must be at least {}, got {}",
            MIN_NODE_SIZE, node_size
        )));
    }
    Ok(())
}

/// Build a tree from entries sorted strictly ascending by key
///
/// Returns the record id of the new tree's root reference. An entry whose
/// key is not greater than its predecessor's fails the build with
/// `OrderingViolation`; so does an error item from `source`. On any failure
/// every record written so far is freed.
pub fn build_tree<K, V, I>(
    engine: &dyn Engine,
    source: I,
    node_size: usize,
    keys: &dyn Serializer<K>,
    values: &dyn Serializer<V>,
) -> Result<RecId>
where
    K: Ord,
    I: IntoIterator<Item = Result<(K, V)>>,
{
    let mut previous: Option<K> = None;
    let mut position = 0u64;

    let entries = source.into_iter().map(|item| {
        let (key, value) = item?;
        if let Some(prev) = &previous {
            match key.cmp(prev) {
                std::cmp::Ordering::Greater => {}
                std::cmp::Ordering::Equal => {
                    return Err(AtlasError::OrderingViolation(format!(
                        "duplicate key at position {}",
                        position
                    )));
                }
                std::cmp::Ordering::Less => {
                    return Err(AtlasError::OrderingViolation(format!(
                        "key at position {} sorts before its predecessor",
                        position
                    )));
                }
            }
        }
        position += 1;
        let entry = (to_bytes(keys, &key)?, to_bytes(values, &value)?);
        previous = Some(key);
        Ok(entry)
    });

    build_tree_raw(engine, entries, node_size)
}

/// Build a tree from serialized entries already in key order
pub(crate) fn build_tree_raw<I>(engine: &dyn Engine, entries: I, node_size: usize) -> Result<RecId>
where
    I: IntoIterator<Item = Result<RawEntry>>,
{
    check_node_size(node_size)?;

    let mut builder = TreeBuilder::new(engine, node_size);
    match builder.run(entries) {
        Ok(root_ref) => {
            debug!(
                entries = builder.count,
                nodes = builder.written.len(),
                node_size,
                "Tree built"
            );
            Ok(root_ref)
        }
        Err(e) => {
            builder.discard();
            Err(e)
        }
    }
}

struct TreeBuilder<'a> {
    engine: &'a dyn Engine,
    node_size: usize,
    /// Every id reserved or written so far
    written: Vec<RecId>,
    /// First key and id of each finished node on the level being built
    level: Vec<(Vec<u8>, RecId)>,
    keys: Vec<Vec<u8>>,
    values: Vec<Vec<u8>>,
    /// Reserved id of the leaf being filled
    current: RecId,
    count: u64,
}

impl<'a> TreeBuilder<'a> {
    fn new(engine: &'a dyn Engine, node_size: usize) -> Self {
        Self {
            engine,
            node_size,
            written: Vec::new(),
            level: Vec::new(),
            keys: Vec::with_capacity(node_size),
            values: Vec::with_capacity(node_size),
            current: 0,
            count: 0,
        }
    }

    fn run<I>(&mut self, entries: I) -> Result<RecId>
    where
        I: IntoIterator<Item = Result<RawEntry>>,
    {
        self.current = self.reserve()?;
        for entry in entries {
            let (key, value) = entry?;
            if self.keys.len() == self.node_size {
                let next = self.reserve()?;
                self.flush_leaf(next)?;
                self.current = next;
            }
            self.keys.push(key);
            self.values.push(value);
            self.count += 1;
        }
        self.flush_leaf(0)?;

        let root = self.build_inner_levels()?;
        let root_ref = self.engine.put(
            &RootRef {
                root,
                size: self.count,
            }
            .encode(),
        )?;
        self.written.push(root_ref);
        Ok(root_ref)
    }

    fn reserve(&mut self) -> Result<RecId> {
        let recid = self.engine.preallocate()?;
        self.written.push(recid);
        Ok(recid)
    }

    fn flush_leaf(&mut self, next: RecId) -> Result<()> {
        let keys = std::mem::take(&mut self.keys);
        let values = std::mem::take(&mut self.values);
        let first = keys.first().cloned().unwrap_or_default();
        self.engine
            .update(self.current, &Node::Leaf { keys, values, next }.encode())?;
        self.level.push((first, self.current));
        Ok(())
    }

    /// Group each level under new inner nodes until one node remains
    fn build_inner_levels(&mut self) -> Result<RecId> {
        let mut level = std::mem::take(&mut self.level);

        while level.len() > 1 {
            let mut groups: Vec<Vec<(Vec<u8>, RecId)>> = Vec::new();
            let mut nodes = level.into_iter().peekable();
            while nodes.peek().is_some() {
                groups.push(nodes.by_ref().take(self.node_size).collect());
            }
            // A lone trailing child joins its neighbour (node_size + 1 children fit)
            if groups.len() > 1 && groups.last().is_some_and(|g| g.len() == 1) {
                if let Some(tail) = groups.pop() {
                    if let Some(prev) = groups.last_mut() {
                        prev.extend(tail);
                    }
                }
            }

            let mut next_level = Vec::with_capacity(groups.len());
            for group in groups {
                let mut group = group.into_iter();
                let Some((first_key, first_child)) = group.next() else {
                    continue;
                };
                let mut keys = Vec::with_capacity(self.node_size);
                let mut children = vec![first_child];
                for (key, child) in group {
                    keys.push(key);
                    children.push(child);
                }
                let recid = self.engine.put(&Node::Inner { keys, children }.encode())?;
                self.written.push(recid);
                next_level.push((first_key, recid));
            }
            level = next_level;
        }

        level
            .pop()
            .map(|(_, recid)| recid)
            .ok_or_else(|| AtlasError::Corruption("tree build produced no root".to_string()))
    }

    /// Free everything written by a failed build
    fn discard(&mut self) {
        let mut failed = 0usize;
        for recid in self.written.drain(..).rev() {
            if self.engine.delete(recid).is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(failed, "Could not free every record of an aborted tree build");
        }
    }
}
