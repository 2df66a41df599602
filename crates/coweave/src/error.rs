//! Error types for the local node.

use coweave_core::{CoID, ContentType, CoreError};
use coweave_perms::PermsError;
use coweave_store::StoreError;
use coweave_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
///
/// A CoValue that no peer can provide is not an error; loads report it as
/// [`LoadResult::Unavailable`](crate::LoadResult::Unavailable).
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("permission error: {0}")]
    Permission(#[from] PermsError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// The CoValue is not in this node's registry yet.
    #[error("not loaded: {0}")]
    NotLoaded(CoID),

    /// A CoValue an operation depends on could not be loaded from any peer.
    #[error("unavailable: {0}")]
    Unavailable(CoID),

    #[error("{id} is a {found:?}, not a {expected:?}")]
    WrongContentType {
        id: CoID,
        expected: ContentType,
        found: ContentType,
    },

    /// No resolvable read or write key for the operation.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The account migration hook failed.
    #[error("account migration failed: {0}")]
    Migration(#[source] anyhow::Error),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
