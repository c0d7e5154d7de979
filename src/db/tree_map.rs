//! Sorted map over a B+tree of engine records
//!
//! Nodes split when they exceed the collection's node size. Removal leaves
//! nodes as they are (no merging), so leaves may become empty; readers skip
//! them along the leaf chain.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::Engine;
use crate::error::{AtlasError, Result};
use crate::serializer::{from_bytes, to_bytes, Serializer};
use crate::RecId;

use super::node::{self, LeafEntries, Node, RootRef};

/// (old value bytes, split to push up: separator and new right sibling)
type InsertOutcome = (Option<Vec<u8>>, Option<(Vec<u8>, RecId)>);

struct TreeInner<K, V> {
    engine: Arc<dyn Engine>,
    root_ref: RecId,
    node_size: usize,
    keys: Arc<dyn Serializer<K>>,
    values: Arc<dyn Serializer<V>>,
    /// Shared by every handle of this collection
    lock: RwLock<()>,
}

/// Persistent sorted map
///
/// Handles are cheap clones sharing one lock: lookups take it shared,
/// mutations exclusively. Iterators load one leaf at a time without holding
/// the lock, so they see concurrent changes leaf by leaf.
pub struct TreeMap<K, V> {
    inner: Arc<TreeInner<K, V>>,
}

impl<K, V> Clone for TreeMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> TreeMap<K, V>
where
    K: Ord + 'static,
    V: 'static,
{
    pub(crate) fn open(
        engine: Arc<dyn Engine>,
        root_ref: RecId,
        node_size: usize,
        keys: Arc<dyn Serializer<K>>,
        values: Arc<dyn Serializer<V>>,
    ) -> Self {
        Self {
            inner: Arc::new(TreeInner {
                engine,
                root_ref,
                node_size,
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
        let mut root_ref = self.root_ref()?;
        let (old, split) = self.insert_into(root_ref.root, key, key_bytes, value_bytes)?;

        if let Some((separator, right)) = split {
            let new_root = Node::Inner {
                keys: vec![separator],
                children: vec![root_ref.root, right],
            };
            root_ref.root = inner.engine.put(&new_root.encode())?;
        }
        if old.is_none() {
            root_ref.size += 1;
        }
        inner.engine.update(inner.root_ref, &root_ref.encode())?;

        old.map(|bytes| from_bytes(inner.values.as_ref(), &bytes))
            .transpose()
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let _guard = self.inner.lock.read();
        let root_ref = self.root_ref()?;
        let (_, node) = self.find_leaf(root_ref.root, key)?;
        match node {
            Node::Leaf { keys, values, .. } => match self.search(&keys, key)? {
                Ok(i) => Ok(Some(from_bytes(self.inner.values.as_ref(), &values[i])?)),
                Err(_) => Ok(None),
            },
            Node::Inner { .. } => Err(AtlasError::Corruption(
                "tree descent ended on an inner node".to_string(),
            )),
        }
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let _guard = self.inner.lock.read();
        let root_ref = self.root_ref()?;
        let (_, node) = self.find_leaf(root_ref.root, key)?;
        Ok(self.search(node.keys(), key)?.is_ok())
    }

    /// Remove `key`; returns its value if it was present
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let inner = &self.inner;
        let _guard = inner.lock.write();
        let mut root_ref = self.root_ref()?;
        let (leaf_id, node) = self.find_leaf(root_ref.root, key)?;

        let Node::Leaf {
            mut keys,
            mut values,
            next,
        } = node
        else {
            return Err(AtlasError::Corruption(
                "tree descent ended on an inner node".to_string(),
            ));
        };
        let i = match self.search(&keys, key)? {
            Ok(i) => i,
            Err(_) => return Ok(None),
        };

        keys.remove(i);
        let old = values.remove(i);
        inner
            .engine
            .update(leaf_id, &Node::Leaf { keys, values, next }.encode())?;
        root_ref.size = root_ref.size.saturating_sub(1);
        inner.engine.update(inner.root_ref, &root_ref.encode())?;

        Ok(Some(from_bytes(inner.values.as_ref(), &old)?))
    }

    pub fn len(&self) -> Result<u64> {
        let _guard = self.inner.lock.read();
        Ok(self.root_ref()?.size)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn first_key(&self) -> Result<Option<K>> {
        match self.iter()?.next() {
            Some(entry) => Ok(Some(entry?.0)),
            None => Ok(None),
        }
    }

    pub fn last_key(&self) -> Result<Option<K>> {
        let _guard = self.inner.lock.read();
        let root_ref = self.root_ref()?;
        match self.last_raw_key(root_ref.root)? {
            Some(bytes) => Ok(Some(from_bytes(self.inner.keys.as_ref(), &bytes)?)),
            None => Ok(None),
        }
    }

    /// All entries in ascending key order
    pub fn iter(&self) -> Result<TreeIter<K, V>> {
        let _guard = self.inner.lock.read();
        let root_ref = self.root_ref()?;
        let entries = LeafEntries::from_root(Arc::clone(&self.inner.engine), root_ref.root)?;
        Ok(self.wrap(entries))
    }

    /// Entries with keys `>= from`, ascending
    pub fn range_from(&self, from: &K) -> Result<TreeIter<K, V>> {
        let _guard = self.inner.lock.read();
        let root_ref = self.root_ref()?;
        let (leaf_id, node) = self.find_leaf(root_ref.root, from)?;
        let start = match self.search(node.keys(), from)? {
            Ok(i) | Err(i) => i,
        };
        let entries = LeafEntries::starting_at(Arc::clone(&self.inner.engine), leaf_id, start)?;
        Ok(self.wrap(entries))
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Root-reference record referenced by the catalog
    pub fn root_ref_recid(&self) -> RecId {
        self.inner.root_ref
    }

    pub fn node_size(&self) -> usize {
        self.inner.node_size
    }

    /// Number of node levels (1 for a single leaf)
    pub fn height(&self) -> Result<usize> {
        let _guard = self.inner.lock.read();
        let mut current = self.root_ref()?.root;
        let mut height = 1;
        while let Node::Inner { children, .. } = Node::load(self.inner.engine.as_ref(), current)? {
            current = children.first().copied().ok_or_else(|| {
                AtlasError::Corruption(format!("inner node {} has no children", current))
            })?;
            height += 1;
        }
        Ok(height)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn root_ref(&self) -> Result<RootRef> {
        RootRef::load(self.inner.engine.as_ref(), self.inner.root_ref)
    }

    fn wrap(&self, entries: LeafEntries) -> TreeIter<K, V> {
        TreeIter {
            entries,
            keys: Arc::clone(&self.inner.keys),
            values: Arc::clone(&self.inner.values),
        }
    }

    /// Binary search over serialized keys: `Ok(i)` on a match, otherwise
    /// `Err(insertion point)`
    fn search(&self, keys: &[Vec<u8>], key: &K) -> Result<std::result::Result<usize, usize>> {
        let (mut lo, mut hi) = (0, keys.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let probe: K = from_bytes(self.inner.keys.as_ref(), &keys[mid])?;
            match probe.cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Child slot to follow for `key` in an inner node
    fn child_index(&self, keys: &[Vec<u8>], key: &K) -> Result<usize> {
        Ok(match self.search(keys, key)? {
            Ok(i) => i + 1,
            Err(i) => i,
        })
    }

    /// Descend to the leaf that holds (or would hold) `key`
    fn find_leaf(&self, root: RecId, key: &K) -> Result<(RecId, Node)> {
        let engine = self.inner.engine.as_ref();
        let mut current = root;
        loop {
            let node = Node::load(engine, current)?;
            match &node {
                Node::Leaf { .. } => return Ok((current, node)),
                Node::Inner { keys, children } => {
                    let idx = self.child_index(keys, key)?;
                    current = *children.get(idx).ok_or_else(|| {
                        AtlasError::Corruption(format!("inner node {} is missing child {}", current, idx))
                    })?;
                }
            }
        }
    }

    fn insert_into(
        &self,
        node_id: RecId,
        key: &K,
        key_bytes: Vec<u8>,
        value_bytes: Vec<u8>,
    ) -> Result<InsertOutcome> {
        let engine = self.inner.engine.as_ref();
        let node_size = self.inner.node_size;

        match Node::load(engine, node_id)? {
            Node::Leaf {
                mut keys,
                mut values,
                next,
            } => {
                let old = match self.search(&keys, key)? {
                    Ok(i) => Some(std::mem::replace(&mut values[i], value_bytes)),
                    Err(i) => {
                        keys.insert(i, key_bytes);
                        values.insert(i, value_bytes);
                        None
                    }
                };

                if keys.len() <= node_size {
                    engine.update(node_id, &Node::Leaf { keys, values, next }.encode())?;
                    return Ok((old, None));
                }

                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid);
                let right_values = values.split_off(mid);
                let separator = right_keys[0].clone();
                let right = Node::Leaf {
                    keys: right_keys,
                    values: right_values,
                    next,
                };
                let right_id = engine.put(&right.encode())?;
                engine.update(
                    node_id,
                    &Node::Leaf {
                        keys,
                        values,
                        next: right_id,
                    }
                    .encode(),
                )?;
                Ok((old, Some((separator, right_id))))
            }
            Node::Inner {
                mut keys,
                mut children,
            } => {
                let idx = self.child_index(&keys, key)?;
                let child = *children.get(idx).ok_or_else(|| {
                    AtlasError::Corruption(format!("inner node {} is missing child {}", node_id, idx))
                })?;
                let (old, split) = self.insert_into(child, key, key_bytes, value_bytes)?;

                let Some((separator, right_child)) = split else {
                    return Ok((old, None));
                };
                keys.insert(idx, separator);
                children.insert(idx + 1, right_child);

                if keys.len() <= node_size {
                    engine.update(node_id, &Node::Inner { keys, children }.encode())?;
                    return Ok((old, None));
                }

                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid + 1);
                let right_children = children.split_off(mid + 1);
                let push_up = keys.pop().ok_or_else(|| {
                    AtlasError::Corruption("split of an empty inner node".to_string())
                })?;
                let right_id = engine.put(
                    &Node::Inner {
                        keys: right_keys,
                        children: right_children,
                    }
                    .encode(),
                )?;
                engine.update(node_id, &Node::Inner { keys, children }.encode())?;
                Ok((old, Some((push_up, right_id))))
            }
        }
    }

    /// Largest key under `node_id`, skipping empty leaves
    fn last_raw_key(&self, node_id: RecId) -> Result<Option<Vec<u8>>> {
        match Node::load(self.inner.engine.as_ref(), node_id)? {
            Node::Leaf { mut keys, .. } => Ok(keys.pop()),
            Node::Inner { children, .. } => {
                for child in children.into_iter().rev() {
                    if let Some(key) = self.last_raw_key(child)? {
                        return Ok(Some(key));
                    }
                }
                Ok(None)
            }
        }
    }
}

/// Write an empty tree and return its root-reference record
pub(crate) fn create(engine: &dyn Engine) -> Result<RecId> {
    let leaf = engine.put(&Node::empty_leaf().encode())?;
    engine.put(&RootRef { root: leaf, size: 0 }.encode())
}

/// Free every record of the tree behind `root_ref`, including the reference
pub(crate) fn free(engine: &dyn Engine, root_ref: RecId) -> Result<()> {
    let root = RootRef::load(engine, root_ref)?;
    for recid in node::node_ids(engine, root.root)? {
        engine.delete(recid)?;
    }
    engine.delete(root_ref)
}

/// Raw entries of the tree behind `root_ref`, in key order
pub(crate) fn raw_entries(engine: Arc<dyn Engine>, root_ref: RecId) -> Result<LeafEntries> {
    let root = RootRef::load(engine.as_ref(), root_ref)?;
    LeafEntries::from_root(engine, root.root)
}

/// Typed iterator over tree entries
pub struct TreeIter<K, V> {
    entries: LeafEntries,
    keys: Arc<dyn Serializer<K>>,
    values: Arc<dyn Serializer<V>>,
}

impl<K, V> Iterator for TreeIter<K, V> {
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
