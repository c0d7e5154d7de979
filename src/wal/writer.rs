//! WAL Writer
//!
//! Appends framed entries and decides when to fsync.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::config::WalSyncStrategy;
use crate::error::Result;

use super::{Operation, WalEntry, WalReader};

/// Writes entries to the WAL file
pub struct WalWriter {
    file: BufWriter<File>,
    path: PathBuf,
    /// LSN the next append will receive
    next_lsn: u64,
    sync_strategy: WalSyncStrategy,
    /// Entries appended since the last fsync
    unsynced: usize,
}

impl WalWriter {
    /// Open or create a WAL file
    ///
    /// Appends continue after the last readable entry. Callers that care
    /// about torn tails run `WalRecovery::recover` first.
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let mut last_lsn = 0;
        let mut reader = WalReader::open(path)?;
        while let Ok(Some(entry)) = reader.next_entry() {
            last_lsn = entry.lsn;
        }

        debug!(path = %path.display(), next_lsn = last_lsn + 1, "WAL opened");

        Ok(Self {
            file: BufWriter::new(file),
            path: path.to_path_buf(),
            next_lsn: last_lsn + 1,
            sync_strategy,
            unsynced: 0,
        })
    }

    /// Append an operation and return its LSN
    ///
    /// The entry is only guaranteed durable once `sync` has run, either
    /// explicitly or through the sync strategy.
    pub fn append(&mut self, operation: Operation) -> Result<u64> {
        let lsn = self.next_lsn;
        let bytes = WalEntry::new(lsn, operation).serialize()?;
        self.file.write_all(&bytes)?;

        self.next_lsn += 1;
        self.unsynced += 1;
        trace!(lsn, len = bytes.len(), "WAL append");

        let due = match self.sync_strategy {
            WalSyncStrategy::EveryWrite => true,
            WalSyncStrategy::EveryNEntries { count } => self.unsynced >= count,
        };
        if due {
            self.sync()?;
        }

        Ok(lsn)
    }

    /// Flush buffered entries and fsync
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Drop every entry and restart numbering at 1
    ///
    /// Called once the entries have been applied to the store.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.flush()?;
        let file = self.file.get_ref();
        file.set_len(0)?;
        file.sync_all()?;

        self.next_lsn = 1;
        self.unsynced = 0;
        debug!(path = %self.path.display(), "WAL truncated");
        Ok(())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// LSN the next append will receive
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn
    }

    /// Entries appended but not yet fsynced
    pub fn uncommitted_count(&self) -> usize {
        self.unsynced
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
