//! Error types for coweave core.

use thiserror::Error;

use crate::types::{CoID, SessionID};

/// Errors raised by the crypto provider, the CoValue core and the codecs.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    /// Sealing, unsealing, encryption or decryption failed.
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    /// No read or write key is resolvable for the requested operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The caller assumed a session length that does not match ours.
    #[error("invalid assumption for {session}: expected after={ours}, got after={theirs}")]
    InvalidAssumption {
        session: SessionID,
        ours: usize,
        theirs: usize,
    },

    #[error("header does not hash to {0}")]
    HeaderMismatch(CoID),

    #[error("malformed id: {0}")]
    MalformedId(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

impl CoreError {
    /// Whether the error stems from failed cryptographic verification.
    pub fn is_crypto_failure(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidSignature | CoreError::InvalidPublicKey | CoreError::CryptoFailure(_)
        )
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
