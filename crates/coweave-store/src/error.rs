//! Error types for the store module.

use thiserror::Error;

use coweave_core::CoreError;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Header or transaction (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A row referenced by id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Stored content failed to replay into a CoValue.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The connection lock was poisoned or a blocking task died.
    #[error("background task failed: {0}")]
    Background(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
