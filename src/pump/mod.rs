//! Pump Module
//!
//! Bulk operations that bypass per-key insertion.
//!
//! ## Responsibilities
//! - External merge sort with runs spilled to temp files
//! - Lazy, stable k-way merge of sorted sources
//! - Bottom-up tree construction from sorted input, with strict order checks
//! - Copying collections (or whole record sets) between stores
//!
//! ## Pipeline
//! ```text
//!   unsorted items
//!        │ sort(batch_size)
//!        ▼
//!   ┌────────┐ ┌────────┐     ┌───────────┐
//!   │ run 1  │ │ run 2  │ ... │ last batch│   (runs on disk, last in memory)
//!   └───┬────┘ └───┬────┘     └─────┬─────┘
//!       └──────────┴──── merge ─────┘
//!                        │ sorted, lazy
//!                        ▼
//!                   build_tree ──► leaves ──► inner levels ──► root ref
//! ```
//!
//! Every iterator here is pull-based: dropping one half-way is safe and
//! releases its temp files.

mod build;
mod copy;
mod merge;
mod sort;

pub use build::build_tree;
pub(crate) use build::check_node_size;
pub use copy::{copy, copy_records};
pub use merge::{merge, Comparator, Merge, Run};
pub use sort::sort;
