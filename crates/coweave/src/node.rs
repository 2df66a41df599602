//! The local node: one agent's view of the CoValues it has loaded.
//!
//! A [`LocalNode`] owns the registry of loaded CoValues and the sync
//! manager that keeps them reconciled with peers. Everything an
//! application does goes through it: creating CoValues, loading them,
//! reading their content through the permission rules of their group, and
//! writing transactions in the node's own session.
//!
//! `LocalNode` is a cheap handle; clones share the same node.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use coweave_core::{
    account_id_of, AgentID, AgentSecret, Change, CoID, CoValueContent, CoValueCore, ContentType,
    CryptoProvider, Header, KeyID, KeySecret, Privacy, Ruleset, SessionID, TransactionID,
};
use coweave_perms::{
    bootstrap, GroupState, GroupWriter, InviteSecret, MemberID, PermsError, Plan, Role,
};
use coweave_store::StorageAdapter;
use coweave_sync::{
    connected_pair, CoValueRegistry, LoadStatus, Peer, PeerRole, StorageDriver, SyncManager,
};

use crate::account::{Account, AccountMigration, RegistryResolver};
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::group::GroupHandle;
use crate::subscription::Subscription;
use crate::values::{BinaryStreamHandle, CoListHandle, CoMapHandle, CoStreamHandle};

/// How a new transaction is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrivacyMode {
    /// Encrypted under the owning group's current read key.
    #[default]
    Private,
    /// In the clear, protected by signatures only.
    Trusting,
}

/// Outcome of a load.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadResult<T> {
    Available(T),
    /// No connected peer provided the CoValue before the load timed out.
    Unavailable,
}

impl<T> LoadResult<T> {
    pub fn is_available(&self) -> bool {
        matches!(self, LoadResult::Available(_))
    }

    pub fn available(self) -> Option<T> {
        match self {
            LoadResult::Available(value) => Some(value),
            LoadResult::Unavailable => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> LoadResult<U> {
        match self {
            LoadResult::Available(value) => LoadResult::Available(f(value)),
            LoadResult::Unavailable => LoadResult::Unavailable,
        }
    }
}

struct NodeInner {
    crypto: Arc<dyn CryptoProvider>,
    agent: AgentSecret,
    agent_id: AgentID,
    session: SessionID,
    account: Option<CoID>,
    registry: Arc<CoValueRegistry>,
    sync: Arc<SyncManager>,
    config: NodeConfig,
}

/// A node acting for one account (or an anonymous agent).
#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<NodeInner>,
}

impl fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNode")
            .field("agent", &self.inner.agent_id)
            .field("session", &self.inner.session)
            .field("account", &self.inner.account)
            .finish()
    }
}

impl LocalNode {
    fn build(
        crypto: Arc<dyn CryptoProvider>,
        config: NodeConfig,
        agent: AgentSecret,
        session: SessionID,
        account: Option<CoID>,
    ) -> Self {
        let agent_id = crypto.agent_id(&agent);
        let registry = Arc::new(CoValueRegistry::new());
        let sync = SyncManager::new(registry.clone(), crypto.clone(), config.sync.clone());
        Self {
            inner: Arc::new(NodeInner {
                crypto,
                agent,
                agent_id,
                session,
                account,
                registry,
                sync,
                config,
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Construction
    // ─────────────────────────────────────────────────────────────────────────

    /// A node for a fresh agent without an account, e.g. a sync server.
    pub fn anonymous(crypto: Arc<dyn CryptoProvider>, config: NodeConfig) -> Self {
        let agent = crypto.new_agent_secret();
        let session = SessionID::new(crypto.agent_id(&agent), crypto.session_suffix());
        Self::build(crypto, config, agent, session, None)
    }

    /// Create a new agent and its account.
    ///
    /// The account gets a public profile map holding `name`. `migration`
    /// runs once the account exists.
    pub fn with_new_account(
        crypto: Arc<dyn CryptoProvider>,
        config: NodeConfig,
        name: &str,
        migration: Option<AccountMigration>,
    ) -> Result<Self> {
        let agent = crypto.new_agent_secret();
        let agent_id = crypto.agent_id(&agent);
        let session = SessionID::new(agent_id, crypto.session_suffix());

        let mut core = CoValueCore::new(Header::account(agent_id), crypto.clone())?;
        let account_id = core.id();
        let (plan, _) = bootstrap(crypto.as_ref(), &account_id, &agent, &MemberID::Agent(agent_id))?;
        apply_plan_to(&mut core, &agent, session, plan)?;

        let node = Self::build(crypto, config, agent, session, Some(account_id));
        node.insert_local(core);

        let account = Account::new(node.clone(), account_id);
        account.create_profile(name)?;
        info!(account = %account_id, "created account");

        node.run_migration(&account, migration)?;
        Ok(node)
    }

    /// A node for an existing account, identified by its agent secret.
    ///
    /// Without `session`, a new session is opened. Connect storage or peers,
    /// then call [`load_account`](Self::load_account).
    pub fn with_account(
        crypto: Arc<dyn CryptoProvider>,
        config: NodeConfig,
        agent: AgentSecret,
        session: Option<SessionID>,
    ) -> Result<Self> {
        let agent_id = crypto.agent_id(&agent);
        let session = match session {
            Some(session) if session.agent != agent_id => {
                return Err(NodeError::InvalidOperation(format!(
                    "session {session} belongs to another agent"
                )))
            }
            Some(session) => session,
            None => SessionID::new(agent_id, crypto.session_suffix()),
        };
        let account_id = account_id_of(&agent_id, crypto.as_ref())?;
        Ok(Self::build(crypto, config, agent, session, Some(account_id)))
    }

    /// Load this node's account from its peers and run `migration` on it.
    pub async fn load_account(&self, migration: Option<AccountMigration>) -> Result<Account> {
        let id = self
            .inner
            .account
            .ok_or_else(|| NodeError::InvalidOperation("anonymous node has no account".into()))?;
        if !self.load_id(id).await {
            return Err(NodeError::Unavailable(id));
        }
        if self.group_state(&id)?.agent_role(&self.inner.agent_id) != Some(Role::Admin) {
            return Err(NodeError::Unauthorized(format!(
                "{} does not control account {id}",
                self.inner.agent_id
            )));
        }
        let account = Account::new(self.clone(), id);
        self.run_migration(&account, migration)?;
        Ok(account)
    }

    fn run_migration(&self, account: &Account, migration: Option<AccountMigration>) -> Result<()> {
        if let Some(migrate) = migration {
            debug!(account = %account.id(), "running account migration");
            migrate(self, account).map_err(NodeError::Migration)?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.inner.crypto
    }

    pub fn agent_id(&self) -> AgentID {
        self.inner.agent_id
    }

    /// The agent secret, for persisting the node's credentials.
    pub fn agent_secret(&self) -> &AgentSecret {
        &self.inner.agent
    }

    pub fn session(&self) -> SessionID {
        self.inner.session
    }

    pub fn account_id(&self) -> Option<CoID> {
        self.inner.account
    }

    /// The node's account, once it is loaded.
    pub fn account(&self) -> Option<Account> {
        let id = self.inner.account?;
        self.inner
            .registry
            .is_available(&id)
            .then(|| Account::new(self.clone(), id))
    }

    /// The identity this node joins groups as: its account, or its agent.
    pub fn member_id(&self) -> MemberID {
        self.inner
            .account
            .map_or(MemberID::Agent(self.inner.agent_id), MemberID::Account)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<CoValueRegistry> {
        &self.inner.registry
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.inner.sync
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_peer(&self, peer: Peer) -> Result<()> {
        Ok(self.inner.sync.add_peer(peer)?)
    }

    /// Persist everything through `storage` and load from it.
    pub fn connect_storage(&self, storage: Arc<dyn StorageAdapter>) -> Result<()> {
        let sync = &self.inner.config.sync;
        let (to_storage, to_node) = connected_pair(
            "node",
            PeerRole::Client,
            "storage",
            PeerRole::Storage,
            sync.outgoing_buffer,
        );
        self.add_peer(to_storage)?;
        StorageDriver::new(storage, self.inner.crypto.clone(), sync.max_piece_bytes).spawn(to_node);
        Ok(())
    }

    pub fn disconnect_all(&self) {
        self.inner.sync.disconnect_all();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────────

    /// Load `id` and its owner group. Returns whether both are available.
    pub(crate) async fn load_id(&self, id: CoID) -> bool {
        let timeout = self.inner.config.load_timeout;
        if self.inner.sync.load(id, timeout).await != LoadStatus::Available {
            debug!(co_value = %id, "load failed");
            return false;
        }
        let owner = self
            .inner
            .registry
            .with_core(&id, |core| core.header().owner_group())
            .flatten();
        match owner {
            Some(group) => self.inner.sync.load(group, timeout).await == LoadStatus::Available,
            None => true,
        }
    }

    /// Load a CoValue from peers unless it is already here.
    pub async fn load(&self, id: CoID) -> Result<LoadResult<CoValueContent>> {
        if !self.load_id(id).await {
            return Ok(LoadResult::Unavailable);
        }
        Ok(LoadResult::Available(self.content(&id)?))
    }

    async fn load_typed<T>(
        &self,
        id: CoID,
        expected: ContentType,
        make: fn(LocalNode, CoID) -> T,
    ) -> Result<LoadResult<T>> {
        if !self.load_id(id).await {
            return Ok(LoadResult::Unavailable);
        }
        self.expect_type(&id, expected)?;
        Ok(LoadResult::Available(make(self.clone(), id)))
    }

    pub async fn load_map(&self, id: CoID) -> Result<LoadResult<CoMapHandle>> {
        self.load_typed(id, ContentType::Map, CoMapHandle::new).await
    }

    pub async fn load_list(&self, id: CoID) -> Result<LoadResult<CoListHandle>> {
        self.load_typed(id, ContentType::List, CoListHandle::new).await
    }

    pub async fn load_stream(&self, id: CoID) -> Result<LoadResult<CoStreamHandle>> {
        self.load_typed(id, ContentType::Stream, CoStreamHandle::new).await
    }

    pub async fn load_binary_stream(&self, id: CoID) -> Result<LoadResult<BinaryStreamHandle>> {
        self.load_typed(id, ContentType::BinaryStream, BinaryStreamHandle::new)
            .await
    }

    pub async fn load_group(&self, id: CoID) -> Result<LoadResult<GroupHandle>> {
        self.load_typed(id, ContentType::Group, GroupHandle::new).await
    }

    fn expect_type(&self, id: &CoID, expected: ContentType) -> Result<()> {
        let found = self.header(id)?.content_type;
        if found != expected {
            return Err(NodeError::WrongContentType {
                id: *id,
                expected,
                found,
            });
        }
        Ok(())
    }

    pub fn map(&self, id: &CoID) -> Result<CoMapHandle> {
        self.expect_type(id, ContentType::Map)?;
        Ok(CoMapHandle::new(self.clone(), *id))
    }

    pub fn list(&self, id: &CoID) -> Result<CoListHandle> {
        self.expect_type(id, ContentType::List)?;
        Ok(CoListHandle::new(self.clone(), *id))
    }

    pub fn stream(&self, id: &CoID) -> Result<CoStreamHandle> {
        self.expect_type(id, ContentType::Stream)?;
        Ok(CoStreamHandle::new(self.clone(), *id))
    }

    pub fn binary_stream(&self, id: &CoID) -> Result<BinaryStreamHandle> {
        self.expect_type(id, ContentType::BinaryStream)?;
        Ok(BinaryStreamHandle::new(self.clone(), *id))
    }

    pub fn group(&self, id: &CoID) -> Result<GroupHandle> {
        self.expect_type(id, ContentType::Group)?;
        Ok(GroupHandle::new(self.clone(), *id))
    }

    /// Watch a CoValue for changes.
    pub fn subscribe(&self, id: &CoID) -> Subscription {
        Subscription::new(self.clone(), *id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Creating
    // ─────────────────────────────────────────────────────────────────────────

    fn insert_local(&self, core: CoValueCore) {
        let id = core.id();
        self.inner.registry.insert(core);
        self.inner.sync.sync_co_value(&id);
    }

    /// Create a group administered by this node's account (or agent).
    pub fn create_group(&self) -> Result<GroupHandle> {
        let crypto = &self.inner.crypto;
        let header = Header::group(self.inner.agent_id, crypto.as_ref());
        let mut core = CoValueCore::new(header, crypto.clone())?;
        let id = core.id();
        let (plan, _) = bootstrap(crypto.as_ref(), &id, &self.inner.agent, &self.member_id())?;
        apply_plan_to(&mut core, &self.inner.agent, self.inner.session, plan)?;
        self.insert_local(core);
        debug!(group = %id, "created group");
        Ok(GroupHandle::new(self.clone(), id))
    }

    fn create_owned(&self, content_type: ContentType, owner: &CoID) -> Result<CoID> {
        if !matches!(self.header(owner)?.ruleset, Ruleset::Group { .. }) {
            return Err(NodeError::InvalidOperation(format!(
                "{owner} is not a group or account"
            )));
        }
        let crypto = &self.inner.crypto;
        let header = Header::owned_by(content_type, *owner, None, crypto.as_ref());
        let core = CoValueCore::new(header, crypto.clone())?;
        let id = core.id();
        self.insert_local(core);
        debug!(co_value = %id, ?content_type, %owner, "created");
        Ok(id)
    }

    pub fn create_map(&self, owner: &CoID) -> Result<CoMapHandle> {
        let id = self.create_owned(ContentType::Map, owner)?;
        Ok(CoMapHandle::new(self.clone(), id))
    }

    pub fn create_list(&self, owner: &CoID) -> Result<CoListHandle> {
        let id = self.create_owned(ContentType::List, owner)?;
        Ok(CoListHandle::new(self.clone(), id))
    }

    pub fn create_stream(&self, owner: &CoID) -> Result<CoStreamHandle> {
        let id = self.create_owned(ContentType::Stream, owner)?;
        Ok(CoStreamHandle::new(self.clone(), id))
    }

    pub fn create_binary_stream(&self, owner: &CoID) -> Result<BinaryStreamHandle> {
        let id = self.create_owned(ContentType::BinaryStream, owner)?;
        Ok(BinaryStreamHandle::new(self.clone(), id))
    }

    /// Join a group with an invite, at the role the invite was created for.
    pub async fn accept_invite(&self, invite: &InviteSecret) -> Result<GroupHandle> {
        let group = invite.group;
        if !self.load_id(group).await {
            return Err(NodeError::Unavailable(group));
        }
        let crypto = self.inner.crypto.as_ref();
        let state = self.group_state(&group)?;
        let invite_agent = invite.agent_secret(crypto);
        let invite_session = SessionID::new(crypto.agent_id(&invite_agent), crypto.session_suffix());

        let resolver = RegistryResolver(&self.inner.registry);
        let plan = GroupWriter::new(&state, &invite_agent, &resolver)
            .accept_invite(&self.member_id(), &self.inner.agent_id.sealer)?;
        self.apply_plan(&group, &invite_agent, invite_session, plan)?;

        // A spent invite still lets us append, but replay drops the edits.
        if self.group_state(&group)?.role_of(&self.member_id()).is_none() {
            return Err(PermsError::InvalidInvite(format!("invite for {group} was already used")).into());
        }
        info!(%group, member = %self.member_id(), "accepted invite");
        Ok(GroupHandle::new(self.clone(), group))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reading and writing
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn header(&self, id: &CoID) -> Result<Header> {
        self.inner
            .registry
            .with_core(id, |core| core.header().clone())
            .ok_or(NodeError::NotLoaded(*id))
    }

    /// Replayed state of a loaded group or account.
    pub fn group_state(&self, id: &CoID) -> Result<GroupState> {
        Ok(self
            .inner
            .registry
            .with_core(id, GroupState::from_core)
            .ok_or(NodeError::NotLoaded(*id))??)
    }

    /// Current content of a loaded CoValue as this node may see it.
    ///
    /// Transactions of owned CoValues are kept only if their author could
    /// write at the time, and private ones only if this node can resolve
    /// their read key.
    pub fn content(&self, id: &CoID) -> Result<CoValueContent> {
        let header = self.header(id)?;
        match header.ruleset {
            Ruleset::Group { .. } => {
                let map = self.group_state(id)?.map().clone();
                Ok(match header.content_type {
                    ContentType::Account => CoValueContent::Account(map),
                    _ => CoValueContent::Group(map),
                })
            }
            Ruleset::OwnedByGroup { group } => {
                let state = self.group_state(&group)?;
                let agent = &self.inner.agent;
                let keys: RefCell<HashMap<KeyID, Option<KeySecret>>> = RefCell::new(HashMap::new());
                let txs = self
                    .inner
                    .registry
                    .with_core(id, |core| {
                        core.decrypted_transactions(|key_id| {
                            keys.borrow_mut()
                                .entry(*key_id)
                                .or_insert_with(|| state.key_secret(key_id, agent))
                                .clone()
                        })
                    })
                    .ok_or(NodeError::NotLoaded(*id))?;
                let txs = state.valid_owned_transactions(txs);
                Ok(CoValueContent::project(header.content_type, &txs))
            }
            Ruleset::UnsafeAllowAll => {
                let txs = self
                    .inner
                    .registry
                    .with_core(id, |core| core.decrypted_transactions(|_| None))
                    .ok_or(NodeError::NotLoaded(*id))?;
                Ok(CoValueContent::project(header.content_type, &txs))
            }
        }
    }

    /// Append `changes` to `id` in this node's session and push them to peers.
    pub fn transact(&self, id: &CoID, changes: &[Change], mode: PrivacyMode) -> Result<TransactionID> {
        let header = self.header(id)?;
        let agent_id = &self.inner.agent_id;

        let key = match &header.ruleset {
            Ruleset::OwnedByGroup { group } => {
                let state = self.group_state(group)?;
                if !state.can_write_at(agent_id, u64::MAX) {
                    return Err(NodeError::Unauthorized(format!(
                        "{agent_id} cannot write to {id}"
                    )));
                }
                match mode {
                    PrivacyMode::Private => Some(state.read_key(&self.inner.agent).ok_or_else(|| {
                        NodeError::Unauthorized(format!("no read key for {group}"))
                    })?),
                    PrivacyMode::Trusting => None,
                }
            }
            // Groups and accounts are always written in the clear.
            Ruleset::Group { .. } => {
                if self.group_state(id)?.agent_role(agent_id) != Some(Role::Admin) {
                    return Err(NodeError::Unauthorized(format!("{agent_id} is not admin of {id}")));
                }
                None
            }
            Ruleset::UnsafeAllowAll => match mode {
                PrivacyMode::Private => {
                    return Err(NodeError::InvalidOperation(format!(
                        "{id} has no group to take a read key from"
                    )))
                }
                PrivacyMode::Trusting => None,
            },
        };

        let privacy = key.as_ref().map_or(Privacy::Trusting, Privacy::Private);
        let tx_id = self
            .inner
            .registry
            .with_core_mut(id, |core| {
                core.make_transaction(&self.inner.agent, self.inner.session, changes, privacy)
            })
            .ok_or(NodeError::NotLoaded(*id))??;
        self.inner.sync.sync_co_value(id);
        Ok(tx_id)
    }

    /// Append a group plan as `agent` writing in `session`.
    pub(crate) fn apply_plan(
        &self,
        group: &CoID,
        agent: &AgentSecret,
        session: SessionID,
        plan: Plan,
    ) -> Result<()> {
        if plan.is_empty() {
            return Ok(());
        }
        self.inner
            .registry
            .with_core_mut(group, |core| apply_plan_to(core, agent, session, plan))
            .ok_or(NodeError::NotLoaded(*group))??;
        self.inner.sync.sync_co_value(group);
        Ok(())
    }
}

fn apply_plan_to(
    core: &mut CoValueCore,
    agent: &AgentSecret,
    session: SessionID,
    plan: Plan,
) -> Result<()> {
    for changes in plan {
        core.make_transaction(agent, session, &changes, Privacy::Trusting)?;
    }
    Ok(())
}
