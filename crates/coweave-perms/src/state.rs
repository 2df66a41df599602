//! Group state computation.
//!
//! Group state is computed by replaying the group's transactions in total
//! order and keeping only the ones its author was allowed to make at that
//! point. The surviving edits form the group map that roles, read keys and
//! the key-chain are read from.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use coweave_core::{
    account_id_of, AgentID, AgentSecret, Change, CoID, CoMap, CoValueCore, CryptoProvider,
    DecryptedTransaction, KeyID, KeySecret, ReadKey, Ruleset,
};

use crate::error::{PermsError, Result};
use crate::keys::{open_chain_entry, open_reveal, GroupKey};
use crate::role::{MemberID, Role};

/// Looks up the agent behind an account (the account header's initial admin).
pub trait AccountResolver {
    fn account_agent(&self, account: &CoID) -> Option<AgentID>;
}

impl<F> AccountResolver for F
where
    F: Fn(&CoID) -> Option<AgentID>,
{
    fn account_agent(&self, account: &CoID) -> Option<AgentID> {
        self(account)
    }
}

/// Edits of the transaction being checked, consulted before the map.
#[derive(Default)]
struct Staged {
    edits: Vec<(String, Option<serde_json::Value>)>,
    consumed_invite: bool,
}

/// Replayed state of a group (or account).
#[derive(Debug, Clone)]
pub struct GroupState {
    id: CoID,
    initial_admin: AgentID,
    map: CoMap,
    consumed_invites: HashSet<AgentID>,
    rejected: usize,
    crypto: Arc<dyn CryptoProvider>,
}

impl GroupState {
    /// Replay a group or account CoValue.
    pub fn from_core(core: &CoValueCore) -> Result<Self> {
        let Ruleset::Group { initial_admin } = &core.header().ruleset else {
            return Err(PermsError::NotAGroup(core.id().to_string()));
        };
        // Group transactions are always trusting.
        let txs = core.decrypted_transactions(|_| None);
        Ok(Self::replay(core.id(), *initial_admin, &txs, core.crypto().clone()))
    }

    /// Replay transactions, which must be in total order.
    pub fn replay(
        id: CoID,
        initial_admin: AgentID,
        txs: &[DecryptedTransaction],
        crypto: Arc<dyn CryptoProvider>,
    ) -> Self {
        let mut state = Self {
            id,
            initial_admin,
            map: CoMap::default(),
            consumed_invites: HashSet::new(),
            rejected: 0,
            crypto,
        };
        for tx in txs {
            state.apply(tx);
        }
        state
    }

    fn apply(&mut self, tx: &DecryptedTransaction) {
        if tx.private {
            self.rejected += 1;
            return;
        }
        let author = tx.tx_id.session.agent;
        let mut staged = Staged::default();
        for change in &tx.changes {
            if !self.check_change(&author, change, &mut staged) {
                debug!(group = %self.id, ?author, tx = ?tx.tx_id, "rejecting invalid group transaction");
                self.rejected += 1;
                return;
            }
        }
        if staged.consumed_invite {
            self.consumed_invites.insert(author);
        }
        self.map.apply(tx);
    }

    fn lookup<'a>(&'a self, staged: &'a Staged, key: &str) -> Option<&'a serde_json::Value> {
        match staged.edits.iter().rev().find(|(k, _)| k == key) {
            Some((_, value)) => value.as_ref(),
            None => self.map.get(key),
        }
    }

    fn staged_role(&self, staged: &Staged, member: &MemberID) -> Option<Role> {
        self.lookup(staged, &member.to_string())?
            .as_str()?
            .parse()
            .ok()
    }

    fn identities(&self, agent: &AgentID) -> Vec<MemberID> {
        let mut ids = vec![MemberID::Agent(*agent)];
        if let Ok(account) = account_id_of(agent, self.crypto.as_ref()) {
            ids.push(MemberID::Account(account));
        }
        ids
    }

    fn staged_agent_role(&self, staged: &Staged, agent: &AgentID) -> Option<Role> {
        self.identities(agent)
            .iter()
            .filter_map(|m| self.staged_role(staged, m))
            .max_by_key(Role::rank)
    }

    fn check_change(&self, author: &AgentID, change: &Change, staged: &mut Staged) -> bool {
        let author_role = self.staged_agent_role(staged, author);
        let (key, value) = match change {
            Change::MapSet { key, value } => (key, Some(value)),
            Change::MapDel { key } => (key, None),
            _ => return true,
        };

        let allowed = match (GroupKey::parse(key), value) {
            (GroupKey::Member(target), Some(value)) => {
                let Some(new_role) = value.as_str().and_then(|s| s.parse::<Role>().ok()) else {
                    return false;
                };
                self.check_role_change(author, author_role, &target, new_role, staged)
            }
            // Member entries are never deleted; revocation is a role.
            (GroupKey::Member(_), None) => false,
            (GroupKey::ReadKey, Some(value)) => {
                author_role == Some(Role::Admin)
                    && value.as_str().map_or(false, |s| s.parse::<KeyID>().is_ok())
            }
            (GroupKey::Reveal { .. }, Some(_)) => {
                author_role.map_or(false, |r| r == Role::Admin || r.is_invite())
            }
            _ => author_role == Some(Role::Admin),
        };

        if allowed {
            staged.edits.push((key.clone(), value.cloned()));
        }
        allowed
    }

    fn check_role_change(
        &self,
        author: &AgentID,
        author_role: Option<Role>,
        target: &MemberID,
        new_role: Role,
        staged: &mut Staged,
    ) -> bool {
        let targets_self = self.identities(author).contains(target);
        match author_role {
            Some(Role::Admin) => {
                if *target == MemberID::Everyone
                    && !matches!(new_role, Role::Reader | Role::Writer | Role::Revoked)
                {
                    return false;
                }
                let current = self.staged_role(staged, target);
                !(current == Some(Role::Admin) && !targets_self && new_role != Role::Admin)
            }
            Some(invite) if invite.is_invite() => {
                let Some(max) = invite.admitted_role() else {
                    return false;
                };
                let ok = !self.consumed_invites.contains(author)
                    && !staged.consumed_invite
                    && *target != MemberID::Everyone
                    && self.staged_role(staged, target).is_none()
                    && new_role.can_read()
                    && new_role.level() <= max.level();
                if ok {
                    staged.consumed_invite = true;
                }
                ok
            }
            _ => *author == self.initial_admin && targets_self && new_role == Role::Admin,
        }
    }

    pub fn id(&self) -> CoID {
        self.id
    }

    pub fn initial_admin(&self) -> &AgentID {
        &self.initial_admin
    }

    /// The group map with invalid edits removed.
    pub fn map(&self) -> &CoMap {
        &self.map
    }

    /// Number of transactions rejected during replay.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Whether the invite agent `agent` has already admitted its member.
    pub fn invite_consumed(&self, agent: &AgentID) -> bool {
        self.consumed_invites.contains(agent)
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.crypto
    }

    pub fn role_of(&self, member: &MemberID) -> Option<Role> {
        self.map.get(&member.to_string())?.as_str()?.parse().ok()
    }

    /// Role of `member` as of `time` (inclusive).
    pub fn role_at(&self, member: &MemberID, time: u64) -> Option<Role> {
        self.map
            .get_at(&member.to_string(), time)?
            .as_str()?
            .parse()
            .ok()
    }

    /// Best role of an agent through itself or its account. `everyone` is
    /// not considered.
    pub fn agent_role(&self, agent: &AgentID) -> Option<Role> {
        self.identities(agent)
            .iter()
            .filter_map(|m| self.role_of(m))
            .max_by_key(Role::rank)
    }

    /// Whether `agent` could write content owned by this group at `time`.
    pub fn can_write_at(&self, agent: &AgentID, time: u64) -> bool {
        self.identities(agent)
            .iter()
            .chain(std::iter::once(&MemberID::Everyone))
            .filter_map(|m| self.role_at(m, time))
            .any(|r| r.can_write())
    }

    /// Whether `agent` can currently read content owned by this group.
    pub fn can_read(&self, agent: &AgentID) -> bool {
        self.identities(agent)
            .iter()
            .chain(std::iter::once(&MemberID::Everyone))
            .filter_map(|m| self.role_of(m))
            .any(|r| r.can_read())
    }

    /// Current members and their roles, revoked ones included.
    pub fn members(&self) -> Vec<(MemberID, Role)> {
        self.map
            .keys()
            .filter_map(|k| match GroupKey::parse(k) {
                GroupKey::Member(m) => Some((m, self.role_of(&m)?)),
                _ => None,
            })
            .collect()
    }

    pub fn read_key_id(&self) -> Option<KeyID> {
        self.map.get(crate::keys::READ_KEY)?.as_str()?.parse().ok()
    }

    /// The current read key, if `agent` can resolve it.
    pub fn read_key(&self, agent: &AgentSecret) -> Option<ReadKey> {
        let id = self.read_key_id()?;
        let secret = self.key_secret(&id, agent)?;
        Some(ReadKey { id, secret })
    }

    /// Resolve any read key `agent` has access to, directly or through the
    /// key-chain.
    pub fn key_secret(&self, key_id: &KeyID, agent: &AgentSecret) -> Option<KeySecret> {
        let agent_id = self.crypto.agent_id(agent);
        self.resolve_key(key_id, &agent_id, agent, &mut HashSet::new())
    }

    fn resolve_key(
        &self,
        key_id: &KeyID,
        agent_id: &AgentID,
        agent: &AgentSecret,
        visiting: &mut HashSet<KeyID>,
    ) -> Option<KeySecret> {
        if !visiting.insert(*key_id) {
            return None;
        }
        let crypto = self.crypto.as_ref();

        for member in self.identities(agent_id) {
            let map_key = GroupKey::Reveal { key: *key_id, to: member }.to_string();
            if let Some(value) = self.map.get(&map_key) {
                if let Ok(secret) = open_reveal(crypto, &self.id, &map_key, value, Some(&agent.sealer)) {
                    return Some(secret);
                }
            }
        }

        let everyone = GroupKey::Reveal { key: *key_id, to: MemberID::Everyone }.to_string();
        if let Some(value) = self.map.get(&everyone) {
            if let Ok(secret) = open_reveal(crypto, &self.id, &everyone, value, None) {
                return Some(secret);
            }
        }

        let newer: Vec<(String, KeyID)> = self
            .map
            .keys()
            .filter_map(|k| match GroupKey::parse(k) {
                GroupKey::KeyChain { old, new } if old == *key_id => Some((k.to_string(), new)),
                _ => None,
            })
            .collect();
        for (map_key, new) in newer {
            let Some(new_secret) = self.resolve_key(&new, agent_id, agent, visiting) else {
                continue;
            };
            let Some(value) = self.map.get(&map_key) else {
                continue;
            };
            if let Ok(secret) = open_chain_entry(crypto, &self.id, &map_key, value, &new_secret) {
                return Some(secret);
            }
        }
        None
    }

    /// Keep the transactions of an owned CoValue whose author could write
    /// at the time they were made.
    pub fn valid_owned_transactions(
        &self,
        txs: Vec<DecryptedTransaction>,
    ) -> Vec<DecryptedTransaction> {
        txs.into_iter()
            .filter(|tx| self.can_write_at(&tx.tx_id.session.agent, tx.made_at))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{chain_entry, reveal_entry};
    use coweave_core::{SessionID, SoftwareCrypto, TransactionID};
    use serde_json::json;

    struct Fixture {
        crypto: Arc<dyn CryptoProvider>,
        group: CoID,
        txs: Vec<DecryptedTransaction>,
        clock: u64,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                crypto: Arc::new(SoftwareCrypto),
                group: CoID::from_bytes([8; 32]),
                txs: Vec::new(),
                clock: 0,
            }
        }

        fn agent(&self, n: u8) -> (AgentSecret, AgentID) {
            let secret = self.crypto.agent_secret_from_seed(&[n; 32]);
            let id = self.crypto.agent_id(&secret);
            (secret, id)
        }

        fn push(&mut self, author: AgentID, changes: Vec<Change>) {
            self.clock += 1;
            let session = SessionID::new(author, 0);
            let index = self.txs.iter().filter(|t| t.tx_id.session == session).count() as u64;
            self.txs.push(DecryptedTransaction {
                tx_id: TransactionID::new(session, index),
                made_at: self.clock,
                changes,
                private: false,
            });
        }

        fn state(&self, admin: AgentID) -> GroupState {
            GroupState::replay(self.group, admin, &self.txs, self.crypto.clone())
        }
    }

    fn set(key: impl ToString, value: serde_json::Value) -> Change {
        Change::MapSet {
            key: key.to_string(),
            value,
        }
    }

    #[test]
    fn test_initial_admin_bootstraps() {
        let mut f = Fixture::new();
        let (_, admin) = f.agent(1);
        let (_, stranger) = f.agent(2);

        f.push(stranger, vec![set(MemberID::Agent(stranger), json!("admin"))]);
        f.push(admin, vec![set(MemberID::Agent(admin), json!("admin"))]);

        let state = f.state(admin);
        assert_eq!(state.agent_role(&admin), Some(Role::Admin));
        assert_eq!(state.agent_role(&stranger), None);
        assert_eq!(state.rejected(), 1);
    }

    #[test]
    fn test_admin_cannot_demote_other_admin() {
        let mut f = Fixture::new();
        let (_, a) = f.agent(1);
        let (_, b) = f.agent(2);

        f.push(a, vec![set(MemberID::Agent(a), json!("admin"))]);
        f.push(a, vec![set(MemberID::Agent(b), json!("admin"))]);
        f.push(b, vec![set(MemberID::Agent(a), json!("revoked"))]);
        f.push(b, vec![set(MemberID::Agent(b), json!("writer"))]);

        let state = f.state(a);
        assert_eq!(state.agent_role(&a), Some(Role::Admin));
        assert_eq!(state.agent_role(&b), Some(Role::Writer));
    }

    #[test]
    fn test_invite_admits_once_within_level() {
        let mut f = Fixture::new();
        let (_, admin) = f.agent(1);
        let (_, invite) = f.agent(2);
        let (_, joiner) = f.agent(3);
        let (_, second) = f.agent(4);

        f.push(admin, vec![set(MemberID::Agent(admin), json!("admin"))]);
        f.push(admin, vec![set(MemberID::Agent(invite), json!("writerInvite"))]);
        // Above the invite's level.
        f.push(invite, vec![set(MemberID::Agent(joiner), json!("admin"))]);
        f.push(invite, vec![set(MemberID::Agent(joiner), json!("writer"))]);
        // Already used.
        f.push(invite, vec![set(MemberID::Agent(second), json!("reader"))]);

        let state = f.state(admin);
        assert_eq!(state.agent_role(&joiner), Some(Role::Writer));
        assert_eq!(state.agent_role(&second), None);
        assert_eq!(state.rejected(), 2);
    }

    #[test]
    fn test_invite_cannot_change_existing_member() {
        let mut f = Fixture::new();
        let (_, admin) = f.agent(1);
        let (_, invite) = f.agent(2);
        let (_, member) = f.agent(3);

        f.push(admin, vec![set(MemberID::Agent(admin), json!("admin"))]);
        f.push(admin, vec![set(MemberID::Agent(member), json!("revoked"))]);
        f.push(admin, vec![set(MemberID::Agent(invite), json!("adminInvite"))]);
        f.push(invite, vec![set(MemberID::Agent(member), json!("admin"))]);

        assert_eq!(f.state(admin).agent_role(&member), Some(Role::Revoked));
    }

    #[test]
    fn test_read_key_admin_only() {
        let mut f = Fixture::new();
        let (_, admin) = f.agent(1);
        let (_, writer) = f.agent(2);
        let key = f.crypto.new_read_key();

        f.push(admin, vec![set(MemberID::Agent(admin), json!("admin"))]);
        f.push(admin, vec![set(MemberID::Agent(writer), json!("writer"))]);
        f.push(writer, vec![set("readKey", json!(key.id.to_string()))]);
        assert_eq!(f.state(admin).read_key_id(), None);

        f.push(admin, vec![set("readKey", json!(key.id.to_string()))]);
        assert_eq!(f.state(admin).read_key_id(), Some(key.id));
    }

    #[test]
    fn test_transaction_is_all_or_nothing() {
        let mut f = Fixture::new();
        let (_, admin) = f.agent(1);
        let (_, writer) = f.agent(2);

        f.push(admin, vec![set(MemberID::Agent(admin), json!("admin"))]);
        f.push(admin, vec![set(MemberID::Agent(writer), json!("writer"))]);
        f.push(writer, vec![
            set("profile", json!("x")),
            set(MemberID::Agent(writer), json!("admin")),
        ]);

        let state = f.state(admin);
        assert_eq!(state.map().get("profile"), None);
        assert_eq!(state.agent_role(&writer), Some(Role::Writer));
    }

    #[test]
    fn test_key_resolution_through_chain() {
        let mut f = Fixture::new();
        let (admin_secret, admin) = f.agent(1);
        let (reader_secret, reader) = f.agent(2);
        let crypto = f.crypto.clone();
        let old = crypto.new_read_key();
        let new = crypto.new_read_key();

        let (k_old, v_old) =
            reveal_entry(crypto.as_ref(), &f.group, &old, &MemberID::Agent(admin), Some(&admin.sealer)).unwrap();
        let (k_new, v_new) =
            reveal_entry(crypto.as_ref(), &f.group, &new, &MemberID::Agent(reader), Some(&reader.sealer)).unwrap();
        let (k_chain, v_chain) = chain_entry(crypto.as_ref(), &f.group, &old, &new).unwrap();

        f.push(admin, vec![set(MemberID::Agent(admin), json!("admin"))]);
        f.push(admin, vec![set(k_old, v_old), set("readKey", json!(old.id.to_string()))]);
        f.push(admin, vec![set(MemberID::Agent(reader), json!("reader"))]);
        f.push(admin, vec![set(k_new, v_new), set(k_chain, v_chain), set("readKey", json!(new.id.to_string()))]);

        let state = f.state(admin);
        // The reader only got the new key but can walk back to the old one.
        assert_eq!(state.key_secret(&old.id, &reader_secret), Some(old.secret.clone()));
        assert_eq!(state.read_key(&reader_secret).unwrap().id, new.id);
        // The admin never got the new key in this history.
        assert_eq!(state.key_secret(&old.id, &admin_secret), Some(old.secret));
        assert!(state.key_secret(&new.id, &admin_secret).is_none());
    }

    #[test]
    fn test_owned_transaction_validity_by_time() {
        let mut f = Fixture::new();
        let (_, admin) = f.agent(1);
        let (_, writer) = f.agent(2);

        f.push(admin, vec![set(MemberID::Agent(admin), json!("admin"))]); // t=1
        f.push(admin, vec![set(MemberID::Agent(writer), json!("writer"))]); // t=2
        f.push(admin, vec![set(MemberID::Agent(writer), json!("revoked"))]); // t=3
        let state = f.state(admin);

        let owned = |made_at| DecryptedTransaction {
            tx_id: TransactionID::new(SessionID::new(writer, 0), made_at),
            made_at,
            changes: vec![],
            private: false,
        };
        let valid = state.valid_owned_transactions(vec![owned(1), owned(2), owned(4)]);
        assert_eq!(valid.iter().map(|t| t.made_at).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_everyone_writer() {
        let mut f = Fixture::new();
        let (_, admin) = f.agent(1);
        let (_, anyone) = f.agent(9);

        f.push(admin, vec![set(MemberID::Agent(admin), json!("admin"))]);
        f.push(admin, vec![set(MemberID::Everyone, json!("writer"))]);
        let state = f.state(admin);
        assert!(state.can_write_at(&anyone, 10));
        assert!(state.can_read(&anyone));
        assert_eq!(state.agent_role(&anyone), None);
    }

    #[test]
    fn test_everyone_cannot_be_admin() {
        let mut f = Fixture::new();
        let (_, admin) = f.agent(1);
        f.push(admin, vec![set(MemberID::Agent(admin), json!("admin"))]);
        f.push(admin, vec![set(MemberID::Everyone, json!("admin"))]);
        assert_eq!(f.state(admin).role_of(&MemberID::Everyone), None);
    }

    #[test]
    fn test_account_membership_covers_agent() {
        let mut f = Fixture::new();
        let (_, admin) = f.agent(1);
        let (_, member) = f.agent(2);
        let account = account_id_of(&member, f.crypto.as_ref()).unwrap();

        f.push(admin, vec![set(MemberID::Agent(admin), json!("admin"))]);
        f.push(admin, vec![set(MemberID::Account(account), json!("writer"))]);
        let state = f.state(admin);
        assert_eq!(state.agent_role(&member), Some(Role::Writer));
        assert_eq!(state.members().len(), 2);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        const OUTSIDER: u8 = 9;

        fn role_name() -> impl Strategy<Value = &'static str> {
            prop::sample::select(vec![
                "admin",
                "writer",
                "reader",
                "revoked",
                "adminInvite",
                "writerInvite",
                "readerInvite",
            ])
        }

        /// (author, target, role) with authors and targets among agents 1..=4,
        /// or the outsider as author.
        fn edits() -> impl Strategy<Value = Vec<(u8, u8, &'static str)>> {
            prop::collection::vec(
                (prop_oneof![1u8..=4, Just(OUTSIDER)], 1u8..=4, role_name()),
                0..24,
            )
        }

        fn replay(edits: &[(u8, u8, &'static str)], skip_outsider: bool) -> GroupState {
            let mut f = Fixture::new();
            let (_, admin) = f.agent(1);
            f.push(admin, vec![set(MemberID::Agent(admin), json!("admin"))]);
            for &(author, target, role) in edits {
                if skip_outsider && author == OUTSIDER {
                    continue;
                }
                let (_, author) = f.agent(author);
                let (_, target) = f.agent(target);
                f.push(author, vec![set(MemberID::Agent(target), json!(role))]);
            }
            f.state(admin)
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn test_outsider_edits_never_take_effect(edits in edits()) {
                let with = replay(&edits, false);
                let without = replay(&edits, true);
                prop_assert_eq!(with.members(), without.members());
                let (_, outsider) = Fixture::new().agent(OUTSIDER);
                prop_assert_eq!(with.agent_role(&outsider), None);
            }

            #[test]
            fn test_admin_only_lost_by_own_hand(edits in edits()) {
                let state = replay(&edits, false);
                let (_, admin) = Fixture::new().agent(1);
                let demoted_self = edits.iter().any(|&(a, t, r)| a == 1 && t == 1 && r != "admin");
                if !demoted_self {
                    prop_assert_eq!(state.agent_role(&admin), Some(Role::Admin));
                }
            }
        }
    }
}
