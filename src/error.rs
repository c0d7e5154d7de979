//! Error types for AtlasDB
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

use crate::RecId;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Unified error type for AtlasDB operations
#[derive(Debug, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    // -------------------------------------------------------------------------
    // Record / Storage Errors
    // -------------------------------------------------------------------------
    #[error("Record not found: {0}")]
    RecordNotFound(RecId),

    #[error("Corrupted data: {0}")]
    Corruption(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Engine is closed")]
    Closed,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Bulk Load Errors
    // -------------------------------------------------------------------------
    #[error("Ordering violation: {0}")]
    OrderingViolation(String),

    // -------------------------------------------------------------------------
    // Argument / Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for AtlasError {
    fn from(e: bincode::Error) -> Self {
        AtlasError::Serialization(e.to_string())
    }
}

impl AtlasError {
    /// True for `RecordNotFound`, the one error callers routinely recover from
    pub fn is_not_found(&self) -> bool {
        matches!(self, AtlasError::RecordNotFound(_))
    }
}
