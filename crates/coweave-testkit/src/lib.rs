//! # coweave testkit
//!
//! Testing utilities for coweave.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: nodes with accounts, a relay server, and helpers that wait
//!   for peers to converge
//! - **Generators**: Proptest strategies for map edits, authorship and
//!   open CoValues
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use coweave_testkit::fixtures::{account_node, connect_and_sync, relay_server};
//!
//! async fn example() {
//!     let server = relay_server();
//!     let ada = account_node("Ada");
//!     connect_and_sync(&ada, &server).await;
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use coweave_testkit::generators::{map_transactions, open_map};
//!
//! proptest! {
//!     #[test]
//!     fn header_id_is_stable(txs in map_transactions(8)) {
//!         let a = open_map("x");
//!         let b = open_map("x");
//!         prop_assert_eq!(a.id(), b.id());
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    account_node, connect, connect_and_sync, crypto, deterministic_agent, eventually,
    init_tracing, relay_server, test_config, wait_synced,
};
pub use generators::{open_map, write_all};
