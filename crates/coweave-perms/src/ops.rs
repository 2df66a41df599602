//! Planning group operations.
//!
//! Each operation produces the transactions (as change batches) an agent
//! has to append to the group. Role changes and key reveals go into separate
//! transactions; all of them are trusting.

use coweave_core::{account_id_of, AgentID, AgentSecret, Change, CoID, CryptoProvider, ReadKey, SealerID};

use crate::error::{PermsError, Result};
use crate::invite::InviteSecret;
use crate::keys::{chain_entry, reveal_entry, READ_KEY};
use crate::role::{MemberID, Role};
use crate::state::{AccountResolver, GroupState};

/// Transactions to append, in order.
pub type Plan = Vec<Vec<Change>>;

fn set(key: String, value: serde_json::Value) -> Change {
    Change::MapSet { key, value }
}

fn set_role(member: &MemberID, role: Role) -> Change {
    set(member.to_string(), serde_json::Value::String(role.as_str().to_string()))
}

fn set_read_key(key: &ReadKey) -> Change {
    set(READ_KEY.to_string(), serde_json::Value::String(key.id.to_string()))
}

/// Transactions that set up a fresh group (or account) for its initial admin.
///
/// `admin` is the agent itself or its account.
pub fn bootstrap(
    crypto: &dyn CryptoProvider,
    group: &CoID,
    agent: &AgentSecret,
    admin: &MemberID,
) -> Result<(Plan, ReadKey)> {
    let agent_id = crypto.agent_id(agent);
    let key = crypto.new_read_key();
    let (reveal_key, reveal_value) = reveal_entry(crypto, group, &key, admin, Some(&agent_id.sealer))?;
    let plan = vec![
        vec![set_role(admin, Role::Admin)],
        vec![set(reveal_key, reveal_value), set_read_key(&key)],
    ];
    Ok((plan, key))
}

/// Plans group operations on behalf of one agent.
pub struct GroupWriter<'a> {
    state: &'a GroupState,
    agent: &'a AgentSecret,
    agent_id: AgentID,
    resolver: &'a dyn AccountResolver,
}

impl<'a> GroupWriter<'a> {
    pub fn new(state: &'a GroupState, agent: &'a AgentSecret, resolver: &'a dyn AccountResolver) -> Self {
        let agent_id = state.crypto().agent_id(agent);
        Self {
            state,
            agent,
            agent_id,
            resolver,
        }
    }

    fn crypto(&self) -> &dyn CryptoProvider {
        self.state.crypto().as_ref()
    }

    fn require_admin(&self, what: &str) -> Result<()> {
        match self.state.agent_role(&self.agent_id) {
            Some(Role::Admin) => Ok(()),
            _ => Err(PermsError::PermissionDenied(format!(
                "{what} in {} requires admin",
                self.state.id()
            ))),
        }
    }

    fn is_self(&self, member: &MemberID) -> bool {
        match member {
            MemberID::Agent(a) => *a == self.agent_id,
            MemberID::Account(id) => account_id_of(&self.agent_id, self.crypto()).map_or(false, |own| own == *id),
            MemberID::Everyone => false,
        }
    }

    /// Sealing key of a member; `None` for `everyone`.
    fn sealer_for(&self, member: &MemberID) -> Result<Option<SealerID>> {
        match member {
            MemberID::Everyone => Ok(None),
            MemberID::Agent(a) => Ok(Some(a.sealer)),
            MemberID::Account(_) if self.is_self(member) => Ok(Some(self.agent_id.sealer)),
            MemberID::Account(id) => self
                .resolver
                .account_agent(id)
                .map(|a| Some(a.sealer))
                .ok_or_else(|| PermsError::UnknownMember(id.to_string())),
        }
    }

    fn current_key(&self) -> Result<ReadKey> {
        self.state
            .read_key(self.agent)
            .ok_or_else(|| PermsError::MissingReadKey(self.state.id().to_string()))
    }

    fn reveal(&self, key: &ReadKey, to: &MemberID) -> Result<Change> {
        let sealer = self.sealer_for(to)?;
        let (k, v) = reveal_entry(self.crypto(), &self.state.id(), key, to, sealer.as_ref())?;
        Ok(set(k, v))
    }

    /// Give `member` a role and reveal the current read key to it.
    pub fn add_member(&self, member: &MemberID, role: Role) -> Result<Plan> {
        self.require_admin("adding members")?;
        if *member == MemberID::Everyone && !matches!(role, Role::Reader | Role::Writer | Role::Revoked) {
            return Err(PermsError::InvalidRole(format!("everyone cannot be {role}")));
        }
        if self.state.role_of(member) == Some(Role::Admin) && !self.is_self(member) && role != Role::Admin {
            return Err(PermsError::PermissionDenied(format!("cannot demote admin {member}")));
        }

        let mut plan = vec![vec![set_role(member, role)]];
        if role.holds_keys() {
            let key = self.current_key()?;
            plan.push(vec![self.reveal(&key, member)?]);
        }
        Ok(plan)
    }

    /// Create an invite agent holding the invite role for `role`.
    pub fn create_invite(&self, role: Role) -> Result<(Plan, InviteSecret)> {
        let invite_role = role
            .invite()
            .ok_or_else(|| PermsError::InvalidRole(format!("cannot invite as {role}")))?;
        let seed = self.crypto().new_seed();
        let secret = InviteSecret::new(self.state.id(), seed);
        let invite_agent = self.crypto().agent_id(&secret.agent_secret(self.crypto()));
        let plan = self.add_member(&MemberID::Agent(invite_agent), invite_role)?;
        Ok((plan, secret))
    }

    /// Acting as the invite agent, admit `joiner` at the invite's level.
    ///
    /// Returns an empty plan when `joiner` already has that role or better.
    pub fn accept_invite(&self, joiner: &MemberID, joiner_sealer: &SealerID) -> Result<Plan> {
        let invite_role = self
            .state
            .role_of(&MemberID::Agent(self.agent_id))
            .ok_or_else(|| PermsError::InvalidInvite("invite agent is not in the group".into()))?;
        let role = invite_role
            .admitted_role()
            .ok_or_else(|| PermsError::InvalidInvite(format!("invite agent holds {invite_role}")))?;

        if let Some(existing) = self.state.role_of(joiner) {
            if existing.level() >= role.level() && existing != Role::Revoked {
                return Ok(Vec::new());
            }
            return Err(PermsError::InvalidInvite(format!("{joiner} is already {existing}")));
        }

        let key = self.current_key()?;
        let (k, v) = reveal_entry(self.crypto(), &self.state.id(), &key, joiner, Some(joiner_sealer))?;
        Ok(vec![vec![set_role(joiner, role)], vec![set(k, v)]])
    }

    /// Revoke `member` and rotate the read key away from it.
    pub fn remove_member(&self, member: &MemberID) -> Result<Plan> {
        let mut plan = self.add_member(member, Role::Revoked)?;
        plan.extend(self.rotate_excluding(Some(member))?);
        Ok(plan)
    }

    /// New read key for every remaining member, chained from the current one.
    pub fn rotate_read_key(&self) -> Result<Plan> {
        self.rotate_excluding(None)
    }

    fn rotate_excluding(&self, excluded: Option<&MemberID>) -> Result<Plan> {
        self.require_admin("rotating the read key")?;
        let new_key = self.crypto().new_read_key();
        let mut changes = Vec::new();

        for (member, role) in self.state.members() {
            if Some(&member) == excluded || !self.keeps_keys(&member, role) {
                continue;
            }
            match self.reveal(&new_key, &member) {
                Ok(change) => changes.push(change),
                Err(PermsError::UnknownMember(m)) => {
                    tracing::warn!(group = %self.state.id(), member = %m, "cannot reveal rotated key to member");
                }
                Err(e) => return Err(e),
            }
        }

        if self.state.read_key_id().is_some() {
            let old = self.current_key()?;
            let (k, v) = chain_entry(self.crypto(), &self.state.id(), &old, &new_key)?;
            changes.push(set(k, v));
        }
        changes.push(set_read_key(&new_key));
        Ok(vec![changes])
    }

    /// Members the next read key is sealed to: readers and up, plus invites
    /// that can still admit someone.
    fn keeps_keys(&self, member: &MemberID, role: Role) -> bool {
        match member {
            MemberID::Agent(agent) if role.is_invite() => !self.state.invite_consumed(agent),
            _ => role.can_read(),
        }
    }

    /// Make the group public (`reader`/`writer`) or private again (`revoked`).
    pub fn set_everyone(&self, role: Role) -> Result<Plan> {
        if role == Role::Revoked {
            return self.remove_member(&MemberID::Everyone);
        }
        self.add_member(&MemberID::Everyone, role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coweave_core::{DecryptedTransaction, SessionID, SoftwareCrypto, TransactionID};
    use std::sync::Arc;

    /// Applies plans as transactions and replays the group after each.
    struct Harness {
        crypto: Arc<dyn CryptoProvider>,
        group: CoID,
        admin_agent: AgentID,
        txs: Vec<DecryptedTransaction>,
    }

    impl Harness {
        fn new(admin: &AgentSecret) -> Self {
            let crypto: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);
            let admin_agent = crypto.agent_id(admin);
            let group = CoID::from_bytes([42; 32]);
            let mut h = Self {
                crypto,
                group,
                admin_agent,
                txs: Vec::new(),
            };
            let (plan, _) = bootstrap(h.crypto.as_ref(), &group, admin, &MemberID::Agent(admin_agent)).unwrap();
            h.apply(admin, plan);
            h
        }

        fn apply(&mut self, author: &AgentSecret, plan: Plan) {
            let session = SessionID::new(self.crypto.agent_id(author), 0);
            for changes in plan {
                let index = self.txs.iter().filter(|t| t.tx_id.session == session).count() as u64;
                let made_at = self.txs.len() as u64 + 1;
                self.txs.push(DecryptedTransaction {
                    tx_id: TransactionID::new(session, index),
                    made_at,
                    changes,
                    private: false,
                });
            }
        }

        fn state(&self) -> GroupState {
            GroupState::replay(self.group, self.admin_agent, &self.txs, self.crypto.clone())
        }
    }

    fn no_accounts(_: &CoID) -> Option<AgentID> {
        None
    }

    #[test]
    fn test_bootstrap_gives_admin_the_key() {
        let crypto = SoftwareCrypto;
        let admin = crypto.new_agent_secret();
        let h = Harness::new(&admin);
        let state = h.state();
        assert_eq!(state.agent_role(&h.admin_agent), Some(Role::Admin));
        assert!(state.read_key(&admin).is_some());
        assert_eq!(state.rejected(), 0);
    }

    #[test]
    fn test_add_member_reveals_key() {
        let crypto = SoftwareCrypto;
        let admin = crypto.new_agent_secret();
        let reader = crypto.new_agent_secret();
        let reader_id = crypto.agent_id(&reader);
        let mut h = Harness::new(&admin);

        let state = h.state();
        let plan = GroupWriter::new(&state, &admin, &no_accounts)
            .add_member(&MemberID::Agent(reader_id), Role::Reader)
            .unwrap();
        assert_eq!(plan.len(), 2);
        h.apply(&admin, plan);

        let state = h.state();
        assert_eq!(state.agent_role(&reader_id), Some(Role::Reader));
        assert_eq!(state.read_key(&reader).unwrap(), state.read_key(&admin).unwrap());
    }

    #[test]
    fn test_non_admin_cannot_add() {
        let crypto = SoftwareCrypto;
        let admin = crypto.new_agent_secret();
        let outsider = crypto.new_agent_secret();
        let h = Harness::new(&admin);
        let state = h.state();
        let err = GroupWriter::new(&state, &outsider, &no_accounts)
            .add_member(&MemberID::Everyone, Role::Reader)
            .unwrap_err();
        assert!(matches!(err, PermsError::PermissionDenied(_)));
    }

    #[test]
    fn test_invite_flow() {
        let crypto = SoftwareCrypto;
        let admin = crypto.new_agent_secret();
        let joiner = crypto.new_agent_secret();
        let joiner_id = crypto.agent_id(&joiner);
        let mut h = Harness::new(&admin);

        let state = h.state();
        let (plan, invite) = GroupWriter::new(&state, &admin, &no_accounts)
            .create_invite(Role::Writer)
            .unwrap();
        h.apply(&admin, plan);

        let invite_agent = invite.agent_secret(&crypto);
        let state = h.state();
        let plan = GroupWriter::new(&state, &invite_agent, &no_accounts)
            .accept_invite(&MemberID::Agent(joiner_id), &joiner_id.sealer)
            .unwrap();
        h.apply(&invite_agent, plan);

        let state = h.state();
        assert_eq!(state.agent_role(&joiner_id), Some(Role::Writer));
        assert!(state.read_key(&joiner).is_some());
        assert_eq!(state.rejected(), 0);

        // Accepting again is a no-op.
        let again = GroupWriter::new(&state, &invite_agent, &no_accounts)
            .accept_invite(&MemberID::Agent(joiner_id), &joiner_id.sealer)
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_remove_member_rotates_key() {
        let crypto = SoftwareCrypto;
        let admin = crypto.new_agent_secret();
        let stay = crypto.new_agent_secret();
        let leave = crypto.new_agent_secret();
        let stay_id = crypto.agent_id(&stay);
        let leave_id = crypto.agent_id(&leave);
        let mut h = Harness::new(&admin);

        for (id, role) in [(stay_id, Role::Writer), (leave_id, Role::Reader)] {
            let state = h.state();
            let plan = GroupWriter::new(&state, &admin, &no_accounts)
                .add_member(&MemberID::Agent(id), role)
                .unwrap();
            h.apply(&admin, plan);
        }
        let old_key = h.state().read_key(&admin).unwrap();

        let state = h.state();
        let plan = GroupWriter::new(&state, &admin, &no_accounts)
            .remove_member(&MemberID::Agent(leave_id))
            .unwrap();
        h.apply(&admin, plan);

        let state = h.state();
        let new_key = state.read_key(&admin).unwrap();
        assert_ne!(new_key.id, old_key.id);
        assert_eq!(state.agent_role(&leave_id), Some(Role::Revoked));
        assert_eq!(state.read_key(&stay).unwrap(), new_key);
        assert!(state.key_secret(&new_key.id, &leave).is_none());
        // Old content stays readable to the remaining member via the chain.
        assert_eq!(state.key_secret(&old_key.id, &stay), Some(old_key.secret));
        assert_eq!(state.rejected(), 0);
    }

    #[test]
    fn test_spent_invite_gets_no_rotated_key() {
        let crypto = SoftwareCrypto;
        let admin = crypto.new_agent_secret();
        let joiner = crypto.new_agent_secret();
        let joiner_id = crypto.agent_id(&joiner);
        let mut h = Harness::new(&admin);

        let state = h.state();
        let (plan, spent) = GroupWriter::new(&state, &admin, &no_accounts)
            .create_invite(Role::Reader)
            .unwrap();
        h.apply(&admin, plan);
        let state = h.state();
        let (plan, pending) = GroupWriter::new(&state, &admin, &no_accounts)
            .create_invite(Role::Reader)
            .unwrap();
        h.apply(&admin, plan);

        let spent_agent = spent.agent_secret(&crypto);
        let state = h.state();
        let plan = GroupWriter::new(&state, &spent_agent, &no_accounts)
            .accept_invite(&MemberID::Agent(joiner_id), &joiner_id.sealer)
            .unwrap();
        h.apply(&spent_agent, plan);
        assert!(h.state().invite_consumed(&crypto.agent_id(&spent_agent)));

        let state = h.state();
        let plan = GroupWriter::new(&state, &admin, &no_accounts)
            .remove_member(&MemberID::Agent(joiner_id))
            .unwrap();
        h.apply(&admin, plan);

        // The joiner kept the invite token, but it no longer reaches new keys.
        let state = h.state();
        let new_key = state.read_key_id().unwrap();
        assert!(state.key_secret(&new_key, &joiner).is_none());
        assert!(state.key_secret(&new_key, &spent_agent).is_none());
        assert!(state.key_secret(&new_key, &pending.agent_secret(&crypto)).is_some());
    }

    #[test]
    fn test_public_group_key() {
        let crypto = SoftwareCrypto;
        let admin = crypto.new_agent_secret();
        let anyone = crypto.new_agent_secret();
        let mut h = Harness::new(&admin);

        let state = h.state();
        let plan = GroupWriter::new(&state, &admin, &no_accounts)
            .set_everyone(Role::Reader)
            .unwrap();
        h.apply(&admin, plan);
        assert!(h.state().read_key(&anyone).is_some());
    }

    #[test]
    fn test_account_member_needs_resolver() {
        let crypto = SoftwareCrypto;
        let admin = crypto.new_agent_secret();
        let member = crypto.new_agent_secret();
        let member_id = crypto.agent_id(&member);
        let account = account_id_of(&member_id, &crypto).unwrap();
        let mut h = Harness::new(&admin);

        let state = h.state();
        let err = GroupWriter::new(&state, &admin, &no_accounts)
            .add_member(&MemberID::Account(account), Role::Writer)
            .unwrap_err();
        assert!(matches!(err, PermsError::UnknownMember(_)));

        let resolver = move |id: &CoID| (*id == account).then_some(member_id);
        let plan = GroupWriter::new(&state, &admin, &resolver)
            .add_member(&MemberID::Account(account), Role::Writer)
            .unwrap();
        h.apply(&admin, plan);
        assert!(h.state().read_key(&member).is_some());
    }
}
