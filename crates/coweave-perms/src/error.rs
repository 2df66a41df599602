//! Error types for the permissions module.

use thiserror::Error;

/// Errors that can occur during permission operations.
#[derive(Debug, Error)]
pub enum PermsError {
    /// The acting agent lacks the role the operation needs.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No read key is resolvable for the acting agent.
    #[error("missing read key: {0}")]
    MissingReadKey(String),

    #[error("invalid role: {0}")]
    InvalidRole(String),

    #[error("invalid member: {0}")]
    InvalidMember(String),

    /// A member's sealing key could not be determined.
    #[error("unknown member: {0}")]
    UnknownMember(String),

    #[error("invalid invite: {0}")]
    InvalidInvite(String),

    #[error("not a group: {0}")]
    NotAGroup(String),

    #[error("core error: {0}")]
    CoreError(#[from] coweave_core::CoreError),
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
