//! WAL Entry definitions
//!
//! A single framed log record and the operations a transaction can log.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::{AtlasError, RecId};

/// Size of the fixed entry header: LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// A single entry in the WAL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Log Sequence Number, monotonically increasing within one log
    pub lsn: u64,

    /// The operation to perform
    pub operation: Operation,

    /// Timestamp (unix millis) when entry was created
    pub timestamp: u64,
}

/// Operations that can be logged
///
/// Writes and deletes of one transaction are followed by a single `Commit`.
/// Operations after the last `Commit` belong to a transaction that never
/// became durable and are ignored by replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Record `recid` now holds `value`
    Write { recid: RecId, value: Vec<u8> },

    /// Record `recid` was freed
    Delete { recid: RecId },

    /// Everything logged since the previous marker is committed
    Commit { tx_id: u64 },
}

impl WalEntry {
    /// Create a new entry stamped with the current time
    pub fn new(lsn: u64, operation: Operation) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            lsn,
            operation,
            timestamp,
        }
    }

    /// Encode as `[LSN u64][CRC u32][Len u32][data]`, little-endian
    ///
    /// The CRC covers the LSN bytes and the data, so a damaged header is
    /// caught as well as a damaged body.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let data = self.encode_data()?;
        let crc = Self::checksum(self.lsn, &data);

        let mut buf = Vec::with_capacity(HEADER_SIZE + data.len());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&data);
        Ok(buf)
    }

    /// Decode one entry from the start of `bytes`
    ///
    /// Short input and checksum mismatches both fail with `WalCorruption`.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(AtlasError::WalCorruption(format!(
                "entry header needs {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let (lsn, crc, len) = parse_header(bytes);
        let end = HEADER_SIZE + len as usize;
        if bytes.len() < end {
            return Err(AtlasError::WalCorruption(format!(
                "entry {} declares {} data bytes, only {} present",
                lsn,
                len,
                bytes.len() - HEADER_SIZE
            )));
        }

        let data = &bytes[HEADER_SIZE..end];
        let actual = Self::checksum(lsn, data);
        if actual != crc {
            return Err(AtlasError::WalCorruption(format!(
                "CRC mismatch for entry {}: stored {:#010x}, computed {:#010x}",
                lsn, crc, actual
            )));
        }

        let (operation, timestamp): (Operation, u64) = bincode::deserialize(data)
            .map_err(|e| AtlasError::WalCorruption(format!("entry {}: {}", lsn, e)))?;

        Ok(Self {
            lsn,
            operation,
            timestamp,
        })
    }

    /// CRC of this entry as it would be written
    pub fn compute_crc(&self) -> Result<u32> {
        let data = self.encode_data()?;
        Ok(Self::checksum(self.lsn, &data))
    }

    /// Total encoded length including the header
    pub fn serialized_size(&self) -> Result<usize> {
        let data_len = bincode::serialized_size(&(&self.operation, self.timestamp))?;
        Ok(HEADER_SIZE + data_len as usize)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn encode_data(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(&self.operation, self.timestamp))?)
    }

    fn checksum(lsn: u64, data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&lsn.to_le_bytes());
        hasher.update(data);
        hasher.finalize()
    }
}

/// Split a header into (lsn, crc, data length). `bytes` must hold at least
/// `HEADER_SIZE` bytes.
pub(super) fn parse_header(bytes: &[u8]) -> (u64, u32, u32) {
    let mut lsn = [0u8; 8];
    let mut crc = [0u8; 4];
    let mut len = [0u8; 4];
    lsn.copy_from_slice(&bytes[0..8]);
    crc.copy_from_slice(&bytes[8..12]);
    len.copy_from_slice(&bytes[12..16]);
    (
        u64::from_le_bytes(lsn),
        u32::from_le_bytes(crc),
        u32::from_le_bytes(len),
    )
}
