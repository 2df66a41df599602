//! Accounts.
//!
//! An account is a group-like CoValue administered by one agent. Its id is
//! derived from the agent alone, so anyone who knows the agent can name the
//! account. It holds a `profile` pointing at a publicly readable map and an
//! optional `root` for the application's own data.

use std::fmt;

use coweave_core::{AgentID, CoID, CoMap, ContentType, Ruleset};
use coweave_perms::{AccountResolver, Role};
use coweave_sync::CoValueRegistry;

use crate::error::{NodeError, Result};
use crate::node::{LocalNode, PrivacyMode};
use crate::values::CoMapHandle;

/// Runs against a freshly created or loaded account, e.g. to create its root.
pub type AccountMigration =
    Box<dyn FnOnce(&LocalNode, &Account) -> anyhow::Result<()> + Send>;

const PROFILE: &str = "profile";
const ROOT: &str = "root";

/// Resolves accounts from the CoValues a node has loaded.
pub(crate) struct RegistryResolver<'a>(pub(crate) &'a CoValueRegistry);

impl AccountResolver for RegistryResolver<'_> {
    fn account_agent(&self, account: &CoID) -> Option<AgentID> {
        self.0
            .with_core(account, |core| match (core.header().content_type, &core.header().ruleset) {
                (ContentType::Account, Ruleset::Group { initial_admin }) => Some(*initial_admin),
                _ => None,
            })
            .flatten()
    }
}

/// Handle to a loaded account.
#[derive(Clone)]
pub struct Account {
    node: LocalNode,
    id: CoID,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Account").field(&self.id).finish()
    }
}

impl Account {
    pub(crate) fn new(node: LocalNode, id: CoID) -> Self {
        Self { node, id }
    }

    pub fn id(&self) -> CoID {
        self.id
    }

    pub fn node(&self) -> &LocalNode {
        &self.node
    }

    /// The agent that controls this account.
    pub fn agent_id(&self) -> Result<AgentID> {
        RegistryResolver(self.node.registry())
            .account_agent(&self.id)
            .ok_or(NodeError::NotLoaded(self.id))
    }

    /// The account's map: member roles, key reveals, `profile` and `root`.
    pub fn content(&self) -> Result<CoMap> {
        Ok(self.node.group_state(&self.id)?.map().clone())
    }

    fn id_at(&self, key: &str) -> Result<Option<CoID>> {
        Ok(self
            .content()?
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok()))
    }

    pub fn profile_id(&self) -> Result<Option<CoID>> {
        self.id_at(PROFILE)
    }

    /// The profile map, if it is loaded.
    pub fn profile(&self) -> Result<Option<CoMapHandle>> {
        match self.profile_id()? {
            Some(id) if self.node.registry().is_available(&id) => Ok(Some(self.node.map(&id)?)),
            _ => Ok(None),
        }
    }

    pub fn root_id(&self) -> Result<Option<CoID>> {
        self.id_at(ROOT)
    }

    pub fn set_root(&self, root: &CoID) -> Result<()> {
        self.set_id(ROOT, root)
    }

    fn set_id(&self, key: &str, value: &CoID) -> Result<()> {
        let change = coweave_core::Change::MapSet {
            key: key.to_string(),
            value: serde_json::Value::String(value.to_string()),
        };
        self.node.transact(&self.id, &[change], PrivacyMode::Trusting)?;
        Ok(())
    }

    /// Create the public profile holding `name` and link it.
    pub(crate) fn create_profile(&self, name: &str) -> Result<CoMapHandle> {
        let group = self.node.create_group()?;
        group.set_everyone(Role::Reader)?;
        let profile = group.create_map()?.trusting();
        profile.set("name", name)?;
        self.set_id(PROFILE, &profile.id())?;
        Ok(profile)
    }
}
