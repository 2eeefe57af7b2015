use std::fmt::Display;

use wikid_types::TypeError;

/// Errors from tiddler store operations.
///
/// An unknown title is never an error; operations report absence through
/// `Option` or their outcome type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Stored bytes for a title cannot be decoded. Read paths skip such
    /// entries; write paths refuse to overwrite them.
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Document-level encoding failure.
    #[error(transparent)]
    Type(#[from] TypeError),

    /// Failure reported by the on-disk engine.
    #[error("storage engine error: {0}")]
    Engine(#[from] sled::Error),

    /// I/O error from snapshot files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A lock was poisoned by a panicking writer.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

pub(crate) fn poisoned<E: Display>(e: E) -> StoreError {
    StoreError::LockPoisoned(e.to_string())
}
