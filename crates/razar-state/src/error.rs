//! Error types for razar-state

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the record stores.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem failure
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A document on disk exists but does not have the expected shape
    #[error("corrupt document {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// A requested record is absent
    #[error("not found: {what}")]
    NotFound { what: String },
}
