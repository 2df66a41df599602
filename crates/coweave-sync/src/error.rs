//! Error types for the sync module.

use thiserror::Error;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Message validation or (de)serialization failed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Storage operation failed.
    #[error("store error: {0}")]
    StoreError(#[from] coweave_store::StoreError),

    /// CoValue ingestion failed.
    #[error("core error: {0}")]
    CoreError(#[from] coweave_core::CoreError),

    /// A peer with this id is already connected.
    #[error("duplicate peer: {0}")]
    DuplicatePeer(String),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
