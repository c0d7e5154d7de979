//! Lazy, stable k-way merge

use std::cmp::Ordering;

use crate::error::Result;

/// Source of already-sorted items for [`merge`]
pub type Run<T> = Box<dyn Iterator<Item = Result<T>>>;

/// Comparator shared by sort and merge
pub type Comparator<T> = Box<dyn Fn(&T, &T) -> Ordering>;

/// Merge sorted sources into one sorted stream
///
/// Equal items come out in source order (all of `sources[0]`'s before any of
/// `sources[1]`'s), so the merge is stable. Nothing is pulled from a source
/// until the first call to `next`. The first error from any source is
/// yielded and ends the stream.
pub fn merge<T>(sources: Vec<Run<T>>, cmp: Comparator<T>) -> Merge<T> {
    let heads = sources.iter().map(|_| None).collect();
    Merge {
        sources,
        heads,
        cmp,
        primed: false,
        failed: false,
    }
}

pub struct Merge<T> {
    sources: Vec<Run<T>>,
    heads: Vec<Option<T>>,
    cmp: Comparator<T>,
    primed: bool,
    failed: bool,
}

impl<T> Merge<T> {
    /// Refill `heads[i]` from its source
    fn advance(&mut self, i: usize) -> Result<()> {
        self.heads[i] = self.sources[i].next().transpose()?;
        Ok(())
    }

    fn prime(&mut self) -> Result<()> {
        for i in 0..self.sources.len() {
            self.advance(i)?;
        }
        self.primed = true;
        Ok(())
    }

    /// Index of the smallest head; ties go to the earliest source
    fn smallest(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, head) in self.heads.iter().enumerate() {
            let Some(item) = head else { continue };
            best = match best {
                Some(b) => match &self.heads[b] {
                    Some(current) if (self.cmp)(item, current) == Ordering::Less => Some(i),
                    _ => Some(b),
                },
                None => Some(i),
            };
        }
        best
    }
}

impl<T> Iterator for Merge<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if !self.primed {
            if let Err(e) = self.prime() {
                self.failed = true;
                return Some(Err(e));
            }
        }

        let i = self.smallest()?;
        let item = self.heads[i].take()?;
        if let Err(e) = self.advance(i) {
            self.failed = true;
            return Some(Err(e));
        }
        Some(Ok(item))
    }
}
