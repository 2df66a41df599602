//! # coweave core
//!
//! Pure primitives for coweave: identities, CoValue headers, signed session
//! logs and the content-type interpreters.
//!
//! This crate contains no I/O, no storage, no networking, and no permission
//! logic. It is pure computation over cryptographic data structures.
//!
//! ## Key Types
//!
//! - [`CoValueCore`] - A CoValue: immutable [`Header`] plus one [`SessionLog`] per writer
//! - [`CoID`] - Content-addressed id (Blake3 of the canonical header)
//! - [`AgentID`] / [`AgentSecret`] - Signing + sealing identity
//! - [`Transaction`] - Trusting or private batch of [`Change`]s
//! - [`KnownState`] / [`NewContentPiece`] - What sync exchanges
//! - [`CoValueContent`] - Projected state (map, list, stream, binary stream)
//!
//! ## Cryptography
//!
//! All cryptography goes through the [`CryptoProvider`] trait;
//! [`SoftwareCrypto`] is the default implementation.
//!
//! ## Canonicalization
//!
//! Headers and transactions are hashed over deterministic CBOR. See the
//! [`canonical`] module.

pub mod canonical;
pub mod content;
pub mod covalue;
pub mod crypto;
pub mod error;
pub mod header;
pub mod session;
pub mod transaction;
pub mod types;

pub use content::{
    BinaryChunks, BinaryCoStream, CoList, CoMap, CoStream, CoValueContent, MapEdit, StreamItem,
};
pub use covalue::{CoValueCore, KnownState, NewContentPiece, Priority, SessionNewContent};
pub use crypto::{
    AgentID, AgentSecret, CryptoProvider, Hash, KeyID, KeySecret, ReadKey, SealerID, SealerSecret,
    Signature, SignerID, SignerSecret, SoftwareCrypto,
};
pub use error::{CoreError, Result};
pub use header::{account_id_of, ContentType, Header, Ruleset};
pub use session::{SessionLog, MAX_RECOMMENDED_TX_SIZE};
pub use transaction::{Change, DecryptedTransaction, Privacy, Transaction};
pub use types::{now_millis, CoID, OpID, SessionID, TransactionID};
