//! WAL Recovery
//!
//! Reads a log after a crash. Everything up to the first torn or damaged
//! entry is trusted; everything from there on is cut off.

use std::fs::OpenOptions;
use std::path::Path;

use tracing::{info, warn};

use crate::error::Result;
use crate::AtlasError;

use super::{WalEntry, WalReader};

/// Handles WAL recovery after crash
pub struct WalRecovery;

/// Result of a recovery operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of entries successfully recovered
    pub entries_recovered: u64,

    /// Number of complete entries that failed verification
    pub entries_corrupted: u64,

    /// Last valid LSN (0 if none)
    pub last_lsn: u64,

    /// Whether bytes after the last valid entry were (or would be) removed
    pub was_truncated: bool,
}

impl WalRecovery {
    /// Recover entries from a WAL file
    ///
    /// This will:
    /// 1. Read entries until the end of the log or the first bad one
    /// 2. Truncate the file just after the last valid entry
    /// 3. Return the valid entries in LSN order
    pub fn recover(path: &Path) -> Result<(Vec<WalEntry>, RecoveryResult)> {
        let (entries, result, valid_len) = Self::scan(path)?;

        if result.was_truncated {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
            warn!(
                path = %path.display(),
                valid_len,
                corrupted = result.entries_corrupted,
                "WAL tail truncated"
            );
        }

        info!(
            path = %path.display(),
            recovered = result.entries_recovered,
            last_lsn = result.last_lsn,
            "WAL recovery complete"
        );

        Ok((entries, result))
    }

    /// Verify integrity of a WAL file without modifying it
    pub fn verify(path: &Path) -> Result<RecoveryResult> {
        let (_, result, _) = Self::scan(path)?;
        Ok(result)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Returns valid entries, stats, and the byte length they occupy
    fn scan(path: &Path) -> Result<(Vec<WalEntry>, RecoveryResult, u64)> {
        let mut reader = WalReader::open(path)?;
        let mut entries = Vec::new();
        let mut corrupted = 0;

        loop {
            match reader.next_entry() {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break,
                Err(AtlasError::WalCorruption(msg)) => {
                    warn!(path = %path.display(), offset = reader.position(), %msg, "corrupt WAL entry");
                    corrupted += 1;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let valid_len = reader.position();
        let result = RecoveryResult {
            entries_recovered: entries.len() as u64,
            entries_corrupted: corrupted,
            last_lsn: entries.last().map(|e| e.lsn).unwrap_or(0),
            was_truncated: valid_len < reader.file_len(),
        };

        Ok((entries, result, valid_len))
    }
}
