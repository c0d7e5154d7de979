//! External merge sort
//!
//! ## Run File Format
//! ```text
//! ┌──────────────┬─────────────────┐
//! │ Length (u32) │ Serialized item │  × count
//! └──────────────┴─────────────────┘
//! ```
//! Runs live in anonymous temp files that disappear when the returned
//! iterator (or the part of it holding the run) is dropped.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use tracing::debug;

use crate::error::{AtlasError, Result};
use crate::serializer::{from_bytes, to_bytes, Serializer};

use super::merge::{merge, Comparator, Merge, Run};

/// Sort `source` using at most `batch_size` items of memory per run
///
/// Each full batch is sorted and spilled to a temp file; the final batch
/// stays in memory. The runs are then merged lazily. Equal items keep their
/// input order.
pub fn sort<T, I>(
    source: I,
    batch_size: usize,
    cmp: Comparator<T>,
    serializer: Arc<dyn Serializer<T>>,
) -> Result<Merge<T>>
where
    T: 'static,
    I: IntoIterator<Item = T>,
{
    if batch_size == 0 {
        return Err(AtlasError::InvalidArgument(
            "sort batch size must be at least 1".to_string(),
        ));
    }

    let mut runs: Vec<Run<T>> = Vec::new();
    let mut batch: Vec<T> = Vec::with_capacity(batch_size);
    let mut spilled = 0usize;

    for item in source {
        if batch.len() == batch_size {
            batch.sort_by(|a, b| cmp(a, b));
            runs.push(Box::new(spill(&batch, Arc::clone(&serializer))?));
            spilled += batch.len();
            batch.clear();
        }
        batch.push(item);
    }

    batch.sort_by(|a, b| cmp(a, b));
    let in_memory = batch.len();
    runs.push(Box::new(batch.into_iter().map(Ok)));

    debug!(runs = runs.len(), spilled, in_memory, "Sort runs prepared");
    Ok(merge(runs, cmp))
}

/// Write a sorted batch to a fresh temp file and return a reader over it
fn spill<T>(batch: &[T], serializer: Arc<dyn Serializer<T>>) -> Result<RunReader<T>> {
    let mut writer = BufWriter::new(tempfile::tempfile()?);
    for item in batch {
        let bytes = to_bytes(serializer.as_ref(), item)?;
        writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&bytes)?;
    }
    let mut file = writer.into_inner().map_err(|e| e.into_error())?;
    file.seek(SeekFrom::Start(0))?;

    Ok(RunReader {
        reader: BufReader::new(file),
        serializer,
        remaining: batch.len(),
        scratch: Vec::new(),
    })
}

/// Sequential reader over one spilled run
struct RunReader<T> {
    reader: BufReader<File>,
    serializer: Arc<dyn Serializer<T>>,
    remaining: usize,
    scratch: Vec<u8>,
}

impl<T> RunReader<T> {
    fn read_item(&mut self) -> Result<T> {
        let mut len = [0u8; 4];
        self.reader.read_exact(&mut len)?;
        self.scratch.resize(u32::from_le_bytes(len) as usize, 0);
        self.reader.read_exact(&mut self.scratch)?;
        from_bytes(self.serializer.as_ref(), &self.scratch)
    }
}

impl<T> Iterator for RunReader<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let item = self.read_item();
        if item.is_err() {
            self.remaining = 0;
        }
        Some(item)
    }
}
