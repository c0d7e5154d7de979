//! Sorted set: a tree map whose values are `()`

use crate::error::Result;
use crate::RecId;

use super::tree_map::{TreeIter, TreeMap};

/// Persistent sorted set
pub struct TreeSet<K> {
    map: TreeMap<K, ()>,
}

impl<K> Clone for TreeSet<K> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<K: Ord + 'static> TreeSet<K> {
    pub(crate) fn from_map(map: TreeMap<K, ()>) -> Self {
        Self { map }
    }

    /// Add `key`; returns true if it was not already present
    pub fn insert(&self, key: &K) -> Result<bool> {
        Ok(self.map.insert(key, &())?.is_none())
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        self.map.contains_key(key)
    }

    /// Remove `key`; returns true if it was present
    pub fn remove(&self, key: &K) -> Result<bool> {
        Ok(self.map.remove(key)?.is_some())
    }

    pub fn len(&self) -> Result<u64> {
        self.map.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.map.is_empty()
    }

    pub fn first(&self) -> Result<Option<K>> {
        self.map.first_key()
    }

    pub fn last(&self) -> Result<Option<K>> {
        self.map.last_key()
    }

    /// Elements in ascending order
    pub fn iter(&self) -> Result<SetIter<K>> {
        Ok(SetIter {
            inner: self.map.iter()?,
        })
    }

    /// Elements `>= from`, ascending
    pub fn range_from(&self, from: &K) -> Result<SetIter<K>> {
        Ok(SetIter {
            inner: self.map.range_from(from)?,
        })
    }

    pub fn root_ref_recid(&self) -> RecId {
        self.map.root_ref_recid()
    }

    pub fn height(&self) -> Result<usize> {
        self.map.height()
    }
}

pub struct SetIter<K> {
    inner: TreeIter<K, ()>,
}

impl<K> Iterator for SetIter<K> {
    type Item = Result<K>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|entry| entry.map(|(k, ())| k))
    }
}
