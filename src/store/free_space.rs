//! Free-space index
//!
//! Reusable byte ranges of the physical volume, bucketed by size class.
//! Class `c` holds regions of `(2^(c-1), 2^c]` allocation units, so any
//! region in a class above the request's own class is large enough.

use super::ALLOC_UNIT;

const SIZE_CLASSES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    offset: u64,
    size: u64,
}

/// Size-classed free lists
#[derive(Debug)]
pub(crate) struct FreeSpace {
    buckets: Vec<Vec<Region>>,
    total: u64,
}

impl FreeSpace {
    pub(crate) fn new() -> Self {
        Self {
            buckets: vec![Vec::new(); SIZE_CLASSES],
            total: 0,
        }
    }

    /// Size class of a region of `size` bytes (a multiple of ALLOC_UNIT)
    fn class_of(size: u64) -> usize {
        let units = (size / ALLOC_UNIT).max(1);
        units.next_power_of_two().trailing_zeros() as usize
    }

    /// Return a region to the index
    pub(crate) fn release(&mut self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.buckets[Self::class_of(size)].push(Region { offset, size });
        self.total += size;
    }

    /// Take `size` bytes: first fit in the request's class, otherwise any
    /// region from the smallest larger class. Remainders are split off.
    pub(crate) fn take(&mut self, size: u64) -> Option<u64> {
        let class = Self::class_of(size);

        let region = match self.buckets[class].iter().position(|r| r.size >= size) {
            Some(pos) => self.buckets[class].swap_remove(pos),
            None => self.buckets[class + 1..]
                .iter_mut()
                .find_map(|bucket| bucket.pop())?,
        };

        self.total -= region.size;
        if region.size > size {
            self.release(region.offset + size, region.size - size);
        }
        Some(region.offset)
    }

    /// Total free bytes
    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    pub(crate) fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.total = 0;
    }
}
