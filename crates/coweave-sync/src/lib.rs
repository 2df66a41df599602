//! # coweave sync
//!
//! Peer-to-peer reconciliation of CoValues.
//!
//! ## Overview
//!
//! Nodes exchange four messages per CoValue: `load` asks for content and
//! tells what the sender already has, `known` answers with the receiver's
//! state (or corrects a wrong assumption), `content` carries new
//! transactions with their session signatures, and `done` ends an exchange.
//! Everything is idempotent, so resending after a correction or a reconnect
//! is always safe.
//!
//! ## Key Properties
//!
//! - **Dependencies first**: a CoValue's group and account headers reach a
//!   peer before the CoValue itself
//! - **Gap-free**: content that does not line up with what the receiver has
//!   is answered with a correction instead of being applied
//! - **Storage is a peer**: [`StorageDriver`] speaks the same protocol over
//!   a [`coweave_store::StorageAdapter`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use coweave_core::SoftwareCrypto;
//! use coweave_sync::{connected_pair, CoValueRegistry, PeerRole, SyncConfig, SyncManager};
//!
//! async fn example() {
//!     let crypto = Arc::new(SoftwareCrypto);
//!     let client = SyncManager::new(Arc::new(CoValueRegistry::new()), crypto.clone(), SyncConfig::default());
//!     let server = SyncManager::new(Arc::new(CoValueRegistry::new()), crypto, SyncConfig::default());
//!
//!     let (to_server, to_client) =
//!         connected_pair("client", PeerRole::Client, "server", PeerRole::Server, 256);
//!     client.add_peer(to_server).unwrap();
//!     server.add_peer(to_client).unwrap();
//!
//!     // let status = client.load(id, Duration::from_secs(10)).await;
//! }
//! ```

pub mod error;
pub mod manager;
pub mod messages;
pub mod peer;
pub mod registry;
pub mod storage;

pub use error::{Result, SyncError};
pub use manager::{SyncConfig, SyncManager};
pub use messages::{decode_frame, encode_frame, limits, split_piece, SyncMessage};
pub use peer::{connected_pair, framed, Peer, PeerID, PeerRole};
pub use registry::{CoValueRegistry, LoadStatus};
pub use storage::StorageDriver;
