//! # coweave permissions
//!
//! Groups, roles and read-key management.
//!
//! ## Overview
//!
//! Access control is itself replicated data. A group is a CoValue whose map
//! entries assign roles to members and distribute read keys. Instead of
//! mutable flags, the group's transactions are replayed in order and each is
//! kept only if its author held the right role when it was made.
//!
//! ## Key Concepts
//!
//! - **Role**: `admin`, `writer`, `reader`, `revoked`, or an invite role
//! - **Member**: an account, an agent, or `everyone`
//! - **Reveal**: the read key sealed to one member
//! - **Key-chain**: each old key encrypted under its successor
//! - **Invite**: a throwaway agent allowed to admit one member
//!
//! ## Encryption Model
//!
//! Content owned by a group is encrypted with the group's current read key.
//! Removing a member revokes it and rotates to a new key revealed only to
//! the remaining members. The old key is chained to the new one, so current
//! members keep reading history while the removed member cannot read
//! anything written afterwards.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use coweave_core::{
//!     AgentID, CoID, CoValueCore, CryptoProvider, Header, Privacy, SessionID, SoftwareCrypto,
//! };
//! use coweave_perms::{bootstrap, GroupState, GroupWriter, MemberID, Role};
//!
//! fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let crypto: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);
//!     let admin = crypto.new_agent_secret();
//!     let admin_id = crypto.agent_id(&admin);
//!     let session = SessionID::new(admin_id, crypto.session_suffix());
//!
//!     let mut group = CoValueCore::new(Header::group(admin_id, crypto.as_ref()), crypto.clone())?;
//!     let (plan, _key) = bootstrap(crypto.as_ref(), &group.id(), &admin, &MemberID::Agent(admin_id))?;
//!     for changes in plan {
//!         group.make_transaction(&admin, session, &changes, Privacy::Trusting)?;
//!     }
//!
//!     let writer = crypto.agent_id(&crypto.new_agent_secret());
//!     let no_accounts = |_: &CoID| -> Option<AgentID> { None };
//!     let state = GroupState::from_core(&group)?;
//!     let plan = GroupWriter::new(&state, &admin, &no_accounts)
//!         .add_member(&MemberID::Agent(writer), Role::Writer)?;
//!     for changes in plan {
//!         group.make_transaction(&admin, session, &changes, Privacy::Trusting)?;
//!     }
//!
//!     let state = GroupState::from_core(&group)?;
//!     assert_eq!(state.agent_role(&writer), Some(Role::Writer));
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod invite;
pub mod keys;
pub mod ops;
pub mod role;
pub mod state;

pub use error::{PermsError, Result};
pub use invite::InviteSecret;
pub use keys::{GroupKey, READ_KEY};
pub use ops::{bootstrap, GroupWriter, Plan};
pub use role::{MemberID, Role};
pub use state::{AccountResolver, GroupState};
