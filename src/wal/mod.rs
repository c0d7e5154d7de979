//! Write-Ahead Log (WAL) Module
//!
//! Redo log behind the transaction layer.
//!
//! ## Responsibilities
//! - Append record writes and deletes before they reach the store
//! - CRC32 checksums for corruption detection
//! - Log Sequence Numbers (LSN) for ordering
//! - Commit markers so replay only applies whole transactions
//! - Crash recovery: trust the valid prefix, cut the torn tail
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Entry 1                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Entry 2                                 │
//! │   ...                                   │
//! └─────────────────────────────────────────┘
//! Data = bincode (Operation, timestamp)
//! CRC  = crc32(LSN bytes ++ Data)
//! ```
//!
//! A transaction appears as `Write`/`Delete` entries followed by one
//! `Commit`. The log is truncated after the store has absorbed the
//! transaction, so at rest it holds at most the unapplied tail.

mod entry;
mod reader;
mod recovery;
mod writer;

pub use entry::{Operation, WalEntry, HEADER_SIZE};
pub use reader::{WalIterator, WalReader};
pub use recovery::{RecoveryResult, WalRecovery};
pub use writer::WalWriter;
