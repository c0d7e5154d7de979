//! Storage Module
//!
//! The bottom of every engine chain: where record bytes live.
//!
//! ## Responsibilities
//! - Allocate, read, update and free records by id
//! - Reuse freed space (size-classed first fit) or append past the
//!   high-water mark
//! - Compaction to remove fragmentation without changing ids
//!
//! ## Direct Store Layout (index volume)
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (32 bytes)                                        │
//! │   Magic "ATDB" (4) | Version u16 (2) | Pad (2)           │
//! │   MaxRecid u64 (8) | PhysEnd u64 (8) | Reserved (8)      │
//! ├──────────────────────────────────────────────────────────┤
//! │ Entry for recid 1, 2, ... (16 bytes each)                │
//! │   Offset u64 (8) | Len u32 (4) | Flags u32 (4)           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//! Record bytes live in the physical volume in slots rounded up to
//! `ALLOC_UNIT`.
//!
//! ## Append-Only Layout
//! See [`AppendStore`].

mod append;
mod direct;
mod free_space;
mod volume;

pub use append::AppendStore;
pub use direct::Store;
pub use volume::{FileVolume, HeapVolume, Volume};

/// Allocation granularity of the physical volume
pub(crate) const ALLOC_UNIT: u64 = 16;

/// Round a record length up to whole allocation units
pub(crate) fn slot_size(len: u64) -> u64 {
    len.div_ceil(ALLOC_UNIT) * ALLOC_UNIT
}
