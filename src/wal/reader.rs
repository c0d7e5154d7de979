//! WAL Reader
//!
//! Sequential reads of a WAL file. A torn tail (incomplete header or data)
//! reads as end-of-log; a complete entry with a bad checksum is an error.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::Result;

use super::entry::parse_header;
use super::{WalEntry, HEADER_SIZE};

/// Reads entries from the WAL file
pub struct WalReader {
    file: BufReader<File>,
    /// Byte offset of the next unread entry
    position: u64,
    file_len: u64,
    /// Set once a torn tail has been seen
    at_tail: bool,
}

impl WalReader {
    /// Open a WAL file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();

        Ok(Self {
            file: BufReader::new(file),
            position: 0,
            file_len,
            at_tail: false,
        })
    }

    /// Read the next entry
    ///
    /// Returns:
    /// - `Ok(Some(entry))`: a complete, checksummed entry
    /// - `Ok(None)`: end of log, or a partially written tail
    /// - `Err(WalCorruption)`: a complete entry failed verification
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        let remaining = self.file_len - self.position;
        if self.at_tail || remaining < HEADER_SIZE as u64 {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_SIZE];
        self.file.read_exact(&mut header)?;
        let (_, _, len) = parse_header(&header);

        if remaining < (HEADER_SIZE as u64 + len as u64) {
            // Header made it to disk, data did not. Position stays at the
            // start of the torn entry.
            self.at_tail = true;
            return Ok(None);
        }

        let mut buf = vec![0u8; HEADER_SIZE + len as usize];
        buf[..HEADER_SIZE].copy_from_slice(&header);
        self.file.read_exact(&mut buf[HEADER_SIZE..])?;

        let entry = WalEntry::deserialize(&buf).inspect_err(|_| self.at_tail = true)?;
        self.position += buf.len() as u64;
        Ok(Some(entry))
    }

    /// Iterate over entries until end of log or the first error
    pub fn entries(self) -> WalIterator {
        WalIterator {
            reader: self,
            done: false,
        }
    }

    // =========================================================================
    // Accessors (for recovery and debugging)
    // =========================================================================

    /// Offset just past the last entry returned
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Length of the file when it was opened
    pub fn file_len(&self) -> u64 {
        self.file_len
    }
}

/// Iterator over WAL entries
pub struct WalIterator {
    reader: WalReader,
    done: bool,
}

impl Iterator for WalIterator {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
