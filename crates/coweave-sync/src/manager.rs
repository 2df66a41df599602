//! The sync manager: reconciles CoValues with connected peers.
//!
//! Each peer gets a reader task that handles its messages one at a time and
//! a writer task that drains an unbounded outbox, so handling a message
//! never waits on a slow peer.
//!
//! ## Per-peer bookkeeping
//!
//! For every CoValue a peer is involved with we keep two known states:
//! `confirmed` is what the peer last told us, `optimistic` additionally
//! includes everything we have sent since. New content is always computed
//! against the optimistic state; a correction resets it.
//!
//! ## Message flow
//!
//! ```text
//! Client                              Server
//!   |-------- load{known} ------------>|
//!   |<------- known (dependency) ------|
//!   |<------- content (dependency) ----|
//!   |<------- known -------------------|
//!   |<------- content -----------------|
//!   |-------- content (client-only) -->|
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use coweave_core::{CoID, CoValueCore, CryptoProvider, KnownState, NewContentPiece, SessionID};

use crate::error::{Result, SyncError};
use crate::messages::{split_piece, SyncMessage};
use crate::peer::{Peer, PeerID, PeerRole};
use crate::registry::{CoValueRegistry, LoadStatus};

/// Configuration for sync behavior.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Capacity of the channel between a peer's writer task and its link.
    pub outgoing_buffer: usize,
    /// Content pieces larger than this are split by session.
    pub max_piece_bytes: usize,
    /// How long a server waits on its own upstream before telling a client
    /// it does not have a CoValue.
    pub forward_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            outgoing_buffer: 256,
            max_piece_bytes: coweave_core::MAX_RECOMMENDED_TX_SIZE,
            forward_timeout: Duration::from_secs(10),
        }
    }
}

struct PeerState {
    role: PeerRole,
    outbox: mpsc::UnboundedSender<SyncMessage>,
    optimistic: HashMap<CoID, KnownState>,
    confirmed: HashMap<CoID, KnownState>,
}

impl PeerState {
    fn send(&self, peer: &PeerID, message: SyncMessage) {
        trace!(%peer, action = message.action(), co_value = %message.id(), "send");
        if self.outbox.send(message).is_err() {
            debug!(%peer, "outbox closed");
        }
    }
}

/// Reconciles the CoValues in a registry with every connected peer.
pub struct SyncManager {
    registry: Arc<CoValueRegistry>,
    crypto: Arc<dyn CryptoProvider>,
    peers: RwLock<HashMap<PeerID, PeerState>>,
    config: SyncConfig,
}

impl SyncManager {
    pub fn new(
        registry: Arc<CoValueRegistry>,
        crypto: Arc<dyn CryptoProvider>,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            crypto,
            peers: RwLock::new(HashMap::new()),
            config,
        })
    }

    pub fn registry(&self) -> &Arc<CoValueRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn peers(&self) -> RwLockReadGuard<'_, HashMap<PeerID, PeerState>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn peers_mut(&self) -> RwLockWriteGuard<'_, HashMap<PeerID, PeerState>> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, peer: &PeerID, message: SyncMessage) {
        if let Some(state) = self.peers().get(peer) {
            state.send(peer, message);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Start syncing with `peer`.
    ///
    /// For servers and storage, every available CoValue is announced with a
    /// `load` so both sides can catch up.
    pub fn add_peer(self: &Arc<Self>, peer: Peer) -> Result<()> {
        let Peer {
            id,
            role,
            mut incoming,
            outgoing,
        } = peer;

        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<SyncMessage>();
        {
            let mut peers = self.peers_mut();
            if peers.contains_key(&id) {
                return Err(SyncError::DuplicatePeer(id.to_string()));
            }
            peers.insert(
                id.clone(),
                PeerState {
                    role,
                    outbox,
                    optimistic: HashMap::new(),
                    confirmed: HashMap::new(),
                },
            );
        }
        debug!(peer = %id, ?role, "peer added");

        tokio::spawn(async move {
            while let Some(message) = outbox_rx.recv().await {
                if outgoing.send(message).await.is_err() {
                    break;
                }
            }
        });

        let manager = Arc::clone(self);
        let reader_id = id.clone();
        tokio::spawn(async move {
            while let Some(message) = incoming.recv().await {
                manager.handle_message(&reader_id, message);
            }
            manager.remove_peer(&reader_id);
        });

        if role.is_upstream() {
            for (co_id, _) in self.registry.available() {
                if let Some(known) = self.registry.known_state(&co_id) {
                    self.send(&id, SyncMessage::Load { known });
                }
            }
        }
        Ok(())
    }

    /// Disconnect `peer`. Loads waiting on it stop waiting.
    pub fn remove_peer(&self, peer: &PeerID) {
        if self.peers_mut().remove(peer).is_some() {
            debug!(%peer, "peer removed");
        }
        self.registry.peer_gone(peer);
    }

    /// Disconnect every peer.
    pub fn disconnect_all(&self) {
        let ids: Vec<PeerID> = self.peers().keys().cloned().collect();
        for id in ids {
            self.remove_peer(&id);
        }
    }

    pub fn peer_ids(&self) -> Vec<PeerID> {
        self.peers().keys().cloned().collect()
    }

    /// What `peer` last told us it holds of `id`.
    pub fn confirmed_known(&self, peer: &PeerID, id: &CoID) -> Option<KnownState> {
        self.peers().get(peer)?.confirmed.get(id).cloned()
    }

    /// What we assume `peer` holds of `id`, including what we sent.
    pub fn optimistic_known(&self, peer: &PeerID, id: &CoID) -> Option<KnownState> {
        self.peers().get(peer)?.optimistic.get(id).cloned()
    }

    fn upstream_peers(&self, except: Option<&PeerID>) -> BTreeSet<PeerID> {
        self.peers()
            .iter()
            .filter(|(id, p)| p.role.is_upstream() && Some(*id) != except)
            .map(|(id, _)| id.clone())
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading and pushing
    // ─────────────────────────────────────────────────────────────────────────

    /// Load `id` from servers and storage unless it is already here.
    ///
    /// Returns `Available`, `Unavailable`, or `Loading` if `timeout` ran out.
    pub async fn load(&self, id: CoID, timeout: Duration) -> LoadStatus {
        if self.registry.is_available(&id) {
            return LoadStatus::Available;
        }
        self.request_from_upstream(id, None);
        self.registry.wait_for(&id, timeout).await
    }

    fn request_from_upstream(&self, id: CoID, except: Option<&PeerID>) -> bool {
        if self.registry.status(&id) == LoadStatus::Loading {
            return true;
        }
        let upstream = self.upstream_peers(except);
        if !self.registry.start_loading(id, upstream.clone()) {
            return self.registry.status(&id) == LoadStatus::Loading;
        }
        for peer in &upstream {
            debug!(%peer, co_value = %id, "requesting");
            self.send(
                peer,
                SyncMessage::Load {
                    known: KnownState::empty(id),
                },
            );
        }
        !upstream.is_empty()
    }

    /// Push whatever each interested peer is missing of `id`.
    ///
    /// Servers and storage are always interested; clients only in CoValues
    /// they have loaded or sent.
    pub fn sync_co_value(&self, id: &CoID) {
        let interested: Vec<PeerID> = self
            .peers()
            .iter()
            .filter(|(_, p)| p.role.is_upstream() || p.optimistic.contains_key(id))
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in interested {
            self.send_with_dependencies(&peer, *id, false);
        }
    }

    /// `root` and the CoValues it depends on, dependencies first.
    fn dependency_order(&self, root: CoID) -> Vec<CoID> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            let Some(deps) = self.registry.with_core(&id, CoValueCore::dependencies) else {
                continue;
            };
            stack.push((id, true));
            stack.extend(
                deps.into_iter()
                    .filter(|d| !visited.contains(d))
                    .map(|d| (d, false)),
            );
        }
        order
    }

    /// Send `peer` what it lacks of `root` and its dependencies.
    ///
    /// With `tell_known`, a `known` precedes each CoValue's content.
    fn send_with_dependencies(&self, peer_id: &PeerID, root: CoID, tell_known: bool) {
        let order = self.dependency_order(root);
        let mut peers = self.peers_mut();
        let Some(peer) = peers.get_mut(peer_id) else {
            return;
        };

        for id in order {
            let theirs = peer.optimistic.get(&id);
            let Some((ours, pieces)) = self
                .registry
                .with_core(&id, |core| (core.known_state(), core.new_content_since(theirs)))
            else {
                continue;
            };

            if tell_known {
                peer.send(
                    peer_id,
                    SyncMessage::Known {
                        known: ours.clone(),
                        is_correction: false,
                        as_dependency_of: (id != root).then_some(root),
                    },
                );
            }
            for piece in pieces {
                for part in split_piece(piece, self.config.max_piece_bytes) {
                    peer.send(peer_id, SyncMessage::Content { piece: part });
                }
            }
            peer.optimistic
                .entry(id)
                .or_insert_with(|| KnownState::empty(id))
                .combine(&ours);
        }
    }

    fn record_known(&self, peer_id: &PeerID, known: &KnownState, reset: bool) {
        let mut peers = self.peers_mut();
        let Some(peer) = peers.get_mut(peer_id) else {
            return;
        };
        peer.confirmed.insert(known.id, known.clone());
        if reset {
            peer.optimistic.insert(known.id, known.clone());
        } else {
            peer.optimistic
                .entry(known.id)
                .or_insert_with(|| KnownState::empty(known.id))
                .combine(known);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Incoming messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle one message from `from`.
    pub fn handle_message(self: &Arc<Self>, from: &PeerID, message: SyncMessage) {
        trace!(peer = %from, action = message.action(), co_value = %message.id(), "received");
        if let Err(e) = message.validate_limits() {
            warn!(peer = %from, error = e, "ignoring oversized message");
            return;
        }
        match message {
            SyncMessage::Load { known } => self.handle_load(from, known),
            SyncMessage::Known {
                known,
                is_correction,
                ..
            } => self.handle_known(from, known, is_correction),
            SyncMessage::Content { piece } => self.handle_content(from, piece),
            SyncMessage::Done { id } => trace!(peer = %from, co_value = %id, "done"),
        }
    }

    fn handle_load(self: &Arc<Self>, from: &PeerID, known: KnownState) {
        let id = known.id;
        let they_have_it = known.header;
        self.record_known(from, &known, true);

        if self.registry.is_available(&id) {
            self.send_with_dependencies(from, id, true);
            return;
        }

        // A peer that has the header will push it once it hears we lack it.
        if they_have_it || !self.request_from_upstream(id, Some(from)) {
            self.send(from, SyncMessage::known(KnownState::empty(id)));
            return;
        }

        let manager = Arc::clone(self);
        let from = from.clone();
        tokio::spawn(async move {
            let status = manager
                .registry
                .wait_for(&id, manager.config.forward_timeout)
                .await;
            if status == LoadStatus::Available {
                manager.send_with_dependencies(&from, id, true);
            } else {
                manager.send(&from, SyncMessage::known(KnownState::empty(id)));
            }
        });
    }

    fn handle_known(&self, from: &PeerID, known: KnownState, is_correction: bool) {
        let id = known.id;
        if is_correction {
            debug!(peer = %from, co_value = %id, "correction received");
        }
        self.record_known(from, &known, is_correction);
        if !known.header {
            self.registry.peer_missing(&id, from);
        }
        if self.registry.is_available(&id) {
            self.send_with_dependencies(from, id, false);
        }
    }

    fn handle_content(&self, from: &PeerID, piece: NewContentPiece) {
        let id = piece.id;
        let header = piece.header;
        let crypto = Arc::clone(&self.crypto);

        let create = || {
            let header = header?;
            match CoValueCore::with_expected_id(id, header, crypto) {
                Ok(core) => Some(core),
                Err(e) => {
                    warn!(peer = %from, co_value = %id, error = %e, "rejecting header");
                    None
                }
            }
        };

        let ingested = self.registry.upsert_with(id, create, |core| {
            let mut accepted: Vec<(SessionID, usize)> = Vec::new();
            let mut correct = false;
            for (session, content) in piece.new {
                let ours = core.session_log(&session).map_or(0, |log| log.len());
                let end = content.after + content.new_transactions.len();
                if content.after > ours {
                    debug!(peer = %from, co_value = %id, %session, ours, after = content.after, "content does not line up");
                    correct = true;
                    continue;
                }
                if end <= ours {
                    accepted.push((session, end));
                    continue;
                }
                let txs = content.new_transactions[ours - content.after..].to_vec();
                match core.try_add_transactions(session, ours, txs, Some(content.last_signature)) {
                    Ok(()) => accepted.push((session, end)),
                    Err(e) if e.is_crypto_failure() => {
                        warn!(peer = %from, co_value = %id, %session, error = %e, "dropping unverifiable content");
                        correct = true;
                    }
                    Err(e) => {
                        warn!(peer = %from, co_value = %id, %session, error = %e, "dropping content");
                        correct = true;
                    }
                }
            }
            (accepted, correct, core.known_state())
        });

        let Some((accepted, correct, ours)) = ingested else {
            debug!(peer = %from, co_value = %id, "content for unknown CoValue without header");
            self.send(from, SyncMessage::correction(KnownState::empty(id)));
            return;
        };

        {
            let mut peers = self.peers_mut();
            if let Some(peer) = peers.get_mut(from) {
                let theirs = peer
                    .optimistic
                    .entry(id)
                    .or_insert_with(|| KnownState::empty(id));
                theirs.header = true;
                for (session, end) in accepted {
                    let len = theirs.sessions.entry(session).or_insert(0);
                    *len = (*len).max(end);
                }
            }
        }

        // Whatever we could not take, the sender must not assume we hold.
        if correct {
            debug!(peer = %from, co_value = %id, "sending correction");
            self.send(from, SyncMessage::correction(ours));
        }

        self.sync_co_value(&id);
    }
}
