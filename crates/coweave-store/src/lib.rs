//! # coweave store
//!
//! Storage abstraction for coweave. Provides a row-level adapter trait for
//! CoValue persistence with SQLite and in-memory implementations.
//!
//! ## Overview
//!
//! The [`StorageAdapter`] trait exposes CoValues, sessions, transactions and
//! checkpoint signatures as rows. Multi-row writes go through
//! [`StorageAdapter::unit_of_work`] so a content piece lands completely or
//! not at all. [`StorageExt`] adds the operations the storage peer needs on
//! top of any adapter.
//!
//! ## Key Types
//!
//! - [`StorageAdapter`] - The async trait for row access
//! - [`StorageTransaction`] - Writes inside a unit of work
//! - [`StorageExt`] - Load a whole CoValue, persist a content piece
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use coweave_core::{
//!     Change, ContentType, CoValueCore, CryptoProvider, Header, Privacy, Ruleset, SessionID,
//!     SoftwareCrypto,
//! };
//! use coweave_store::{MemoryStore, StorageExt};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let crypto: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);
//!     let agent = crypto.new_agent_secret();
//!     let session = SessionID::new(crypto.agent_id(&agent), crypto.session_suffix());
//!
//!     let header = Header {
//!         content_type: ContentType::Map,
//!         ruleset: Ruleset::UnsafeAllowAll,
//!         meta: None,
//!         created_at: None,
//!         uniqueness: None,
//!     };
//!     let mut core = CoValueCore::new(header, crypto.clone())?;
//!     let set = Change::MapSet { key: "hello".into(), value: serde_json::json!("world") };
//!     core.make_transaction(&agent, session, &[set], Privacy::Trusting)?;
//!
//!     let store = MemoryStore::new();
//!     for piece in core.new_content_since(None) {
//!         store.store_piece(&piece).await?;
//!     }
//!
//!     let loaded = store.load_core(&core.id(), crypto).await?;
//!     assert_eq!(loaded.map(|c| c.known_state()), Some(core.known_state()));
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Storage trusts its node**: pieces are not re-verified on write, only
//!   when a CoValue is loaded back.
//! - **Overlap is skipped**: transactions already stored are ignored, so
//!   receiving the same piece twice is harmless.
//! - **Checkpoints**: a signature is kept mid-session whenever enough bytes
//!   accumulate since the last one, so large sessions can be streamed back
//!   in pieces.

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    RowID, SessionUpdate, StorageAdapter, StorageExt, StorageTransaction, StoreOutcome,
    StoredCoValue, StoredSession, StoredSignature, StoredTransaction, UnitOfWork,
};
