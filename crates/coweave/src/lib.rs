//! # coweave
//!
//! Collaborative values that sync between peers, with permissions enforced
//! by cryptography instead of by a server.
//!
//! ## Overview
//!
//! coweave provides an offline-first library for:
//!
//! - **CoValues**: append-only, signed transaction logs with one log per
//!   writer session, projected into maps, lists, streams and binary blobs
//! - **Groups**: replicated role tables that decide who may write and that
//!   distribute the read keys private transactions are encrypted with
//! - **Accounts**: an agent's identity with a public profile
//! - **Sync**: reconciliation with any number of peers, storage included
//!
//! ## Key Concepts
//!
//! - **Agent**: a signing and a sealing key pair. Every transaction is signed
//!   by the agent of the session it is in.
//! - **Session**: one writer's log inside a CoValue. Logs only grow.
//! - **Owner group**: every map, list or stream belongs to a group whose
//!   roles are checked against each transaction at the time it was made.
//! - **Peer**: anything speaking the sync protocol: another node, a relay
//!   server, or a storage driver.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use coweave::{LocalNode, NodeConfig};
//! use coweave::core::SoftwareCrypto;
//! use coweave::store::SqliteStore;
//!
//! async fn example() -> coweave::Result<()> {
//!     let node = LocalNode::with_new_account(
//!         Arc::new(SoftwareCrypto),
//!         NodeConfig::default(),
//!         "Ada",
//!         None,
//!     )?;
//!     node.connect_storage(Arc::new(SqliteStore::open("coweave.db")?))?;
//!
//!     let group = node.create_group()?;
//!     let todo = group.create_list()?;
//!     todo.append("write docs")?;
//!
//!     let mut updates = todo.subscribe();
//!     while let Some(content) = updates.next().await {
//!         println!("{}", content.as_list().map(|l| l.len()).unwrap_or(0));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `coweave::core` - CoValues, transactions, content types and crypto
//! - `coweave::perms` - Groups, roles, invites and read keys
//! - `coweave::store` - Storage abstraction, in-memory and SQLite
//! - `coweave::sync` - Sync protocol, peers and the storage driver

pub mod account;
pub mod config;
pub mod error;
pub mod group;
pub mod node;
pub mod subscription;
pub mod values;

// Re-export component crates
pub use coweave_core as core;
pub use coweave_perms as perms;
pub use coweave_store as store;
pub use coweave_sync as sync;

// Re-export main types for convenience
pub use account::{Account, AccountMigration};
pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use group::GroupHandle;
pub use node::{LoadResult, LocalNode, PrivacyMode};
pub use subscription::Subscription;
pub use values::{BinaryStreamHandle, CoListHandle, CoMapHandle, CoStreamHandle};

// Re-export commonly used component types
pub use coweave_core::{
    AgentID, AgentSecret, CoID, CoValueContent, ContentType, CryptoProvider, SessionID,
    SoftwareCrypto,
};
pub use coweave_perms::{InviteSecret, MemberID, Role};
pub use coweave_sync::{Peer, PeerRole, SyncConfig};
