//! Group handles: membership, invites and key rotation.

use std::fmt;

use tracing::info;

use coweave_core::{CoID, KeyID};
use coweave_perms::{GroupState, GroupWriter, InviteSecret, MemberID, Plan, Role};

use crate::account::RegistryResolver;
use crate::error::{NodeError, Result};
use crate::node::LocalNode;
use crate::subscription::Subscription;
use crate::values::{BinaryStreamHandle, CoListHandle, CoMapHandle, CoStreamHandle};

/// Handle to a loaded group.
#[derive(Clone)]
pub struct GroupHandle {
    node: LocalNode,
    id: CoID,
}

impl fmt::Debug for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GroupHandle").field(&self.id).finish()
    }
}

impl GroupHandle {
    pub(crate) fn new(node: LocalNode, id: CoID) -> Self {
        Self { node, id }
    }

    pub fn id(&self) -> CoID {
        self.id
    }

    pub fn state(&self) -> Result<GroupState> {
        self.node.group_state(&self.id)
    }

    pub fn role_of(&self, member: &MemberID) -> Result<Option<Role>> {
        Ok(self.state()?.role_of(member))
    }

    /// This node's role, through its agent or its account.
    pub fn my_role(&self) -> Result<Option<Role>> {
        Ok(self.state()?.agent_role(&self.node.agent_id()))
    }

    pub fn members(&self) -> Result<Vec<(MemberID, Role)>> {
        Ok(self.state()?.members())
    }

    pub fn read_key_id(&self) -> Result<Option<KeyID>> {
        Ok(self.state()?.read_key_id())
    }

    fn writer_plan(&self, plan: impl FnOnce(&GroupWriter<'_>) -> coweave_perms::Result<Plan>) -> Result<()> {
        let state = self.state()?;
        let resolver = RegistryResolver(self.node.registry());
        let plan = plan(&GroupWriter::new(&state, self.node.agent_secret(), &resolver))?;
        self.node
            .apply_plan(&self.id, self.node.agent_secret(), self.node.session(), plan)
    }

    /// Give `member` a role. An account member is loaded first so the read
    /// key can be sealed to its agent.
    pub async fn add_member(&self, member: &MemberID, role: Role) -> Result<()> {
        if let MemberID::Account(account) = member {
            if !self.node.load_id(*account).await {
                return Err(NodeError::Unavailable(*account));
            }
        }
        self.writer_plan(|w| w.add_member(member, role))?;
        info!(group = %self.id, %member, role = role.as_str(), "added member");
        Ok(())
    }

    /// Revoke `member` and rotate the read key so it cannot read new content.
    pub fn remove_member(&self, member: &MemberID) -> Result<()> {
        self.writer_plan(|w| w.remove_member(member))?;
        info!(group = %self.id, %member, "removed member");
        Ok(())
    }

    pub fn rotate_read_key(&self) -> Result<()> {
        self.writer_plan(|w| w.rotate_read_key())
    }

    /// An invite that admits one member at `role`.
    pub fn create_invite(&self, role: Role) -> Result<InviteSecret> {
        let mut secret = None;
        self.writer_plan(|w| {
            let (plan, invite) = w.create_invite(role)?;
            secret = Some(invite);
            Ok(plan)
        })?;
        secret.ok_or_else(|| NodeError::InvalidOperation("invite was not created".into()))
    }

    /// Open the group to every agent, or close it again with `Revoked`.
    pub fn set_everyone(&self, role: Role) -> Result<()> {
        self.writer_plan(|w| w.set_everyone(role))
    }

    pub fn create_map(&self) -> Result<CoMapHandle> {
        self.node.create_map(&self.id)
    }

    pub fn create_list(&self) -> Result<CoListHandle> {
        self.node.create_list(&self.id)
    }

    pub fn create_stream(&self) -> Result<CoStreamHandle> {
        self.node.create_stream(&self.id)
    }

    pub fn create_binary_stream(&self) -> Result<BinaryStreamHandle> {
        self.node.create_binary_stream(&self.id)
    }

    pub fn subscribe(&self) -> Subscription {
        self.node.subscribe(&self.id)
    }
}
