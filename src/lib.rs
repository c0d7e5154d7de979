//! # AtlasDB
//!
//! An embedded record store with typed collections on top:
//! - Stable record ids over heap, single-file and append-only backings
//! - Write-Ahead Logging (WAL) for atomic, durable commits
//! - Crash recovery with partial write handling
//! - Optional async writer, LZ4 compression and an LRU record cache
//! - Hash maps, B+tree maps and sets, and queues addressed by name
//! - Pump: external sort, k-way merge, bulk tree build, store-to-store copy
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                            DB                               │
//! │      catalog (recid 1) · HashMap · TreeMap · TreeSet · Queue │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ Serializer: typed value ⇄ bytes
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                    Engine chain                             │
//! │     Cache → Compress → AsyncWrite → Tx (+ WAL)              │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │    Store    │          │ AppendStore │
//!   │ heap / file │          │  segments   │
//!   └─────────────┘          └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod buffer;
pub mod serializer;
pub mod store;
pub mod wal;
pub mod engine;
pub mod db;
pub mod pump;
pub mod failpoint;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{AtlasError, Result};
pub use config::{Backing, Config, WalSyncStrategy};
pub use buffer::{DataInput, DataOutput};
pub use serializer::{DefaultSerializer, Serializer, SerializerId};
pub use engine::{Engine, EngineExt};
pub use db::{HashMap, Queue, TreeMap, TreeSet, DB};

// =============================================================================
// Record Ids
// =============================================================================

/// Stable handle of a stored record
pub type RecId = u64;

/// Record holding the collection catalog; created empty with every store
pub const CATALOG_RECID: RecId = 1;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasDB
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
