//! The node's table of CoValues and their loading state.
//!
//! Every CoValue the node knows about is either being loaded from peers,
//! available, or known to be unavailable. Each entry carries a version
//! counter on a `watch` channel that is bumped on every change, so loaders
//! and subscribers can wait without polling.
//!
//! The table sits behind a `std::sync::RwLock` that is never held across an
//! `.await`; all access goes through short closures.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use coweave_core::{CoID, CoValueCore, KnownState, Priority};

use crate::peer::PeerID;

/// Where a CoValue stands locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// Never requested and never received.
    Unknown,
    /// Waiting for answers from peers.
    Loading,
    Available,
    /// Every peer asked said it does not have it.
    Unavailable,
}

#[derive(Debug)]
enum CoValueState {
    Unknown,
    Loading { waiting_on: BTreeSet<PeerID> },
    Available(Box<CoValueCore>),
    Unavailable,
}

impl CoValueState {
    fn status(&self) -> LoadStatus {
        match self {
            CoValueState::Unknown => LoadStatus::Unknown,
            CoValueState::Loading { .. } => LoadStatus::Loading,
            CoValueState::Available(_) => LoadStatus::Available,
            CoValueState::Unavailable => LoadStatus::Unavailable,
        }
    }
}

#[derive(Debug)]
struct Entry {
    state: CoValueState,
    version: watch::Sender<u64>,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: CoValueState::Unknown,
            version: watch::channel(0).0,
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

/// All CoValues of one node.
#[derive(Debug, Default)]
pub struct CoValueRegistry {
    entries: RwLock<HashMap<CoID, Entry>>,
}

impl CoValueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<CoID, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<CoID, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self, id: &CoID) -> LoadStatus {
        self.read()
            .get(id)
            .map_or(LoadStatus::Unknown, |e| e.state.status())
    }

    pub fn is_available(&self, id: &CoID) -> bool {
        self.status(id) == LoadStatus::Available
    }

    /// Run `f` on an available CoValue.
    pub fn with_core<R>(&self, id: &CoID, f: impl FnOnce(&CoValueCore) -> R) -> Option<R> {
        match &self.read().get(id)?.state {
            CoValueState::Available(core) => Some(f(core)),
            _ => None,
        }
    }

    /// Run `f` on an available CoValue, then notify watchers.
    pub fn with_core_mut<R>(&self, id: &CoID, f: impl FnOnce(&mut CoValueCore) -> R) -> Option<R> {
        let mut entries = self.write();
        let entry = entries.get_mut(id)?;
        let CoValueState::Available(core) = &mut entry.state else {
            return None;
        };
        let result = f(core);
        entry.bump();
        Some(result)
    }

    /// Like [`with_core_mut`](Self::with_core_mut), but if the CoValue is
    /// not available yet, first make it available from `create`. Creating
    /// and the first mutation happen under one lock, so watchers never see
    /// the bare header.
    pub fn upsert_with<R>(
        &self,
        id: CoID,
        create: impl FnOnce() -> Option<CoValueCore>,
        f: impl FnOnce(&mut CoValueCore) -> R,
    ) -> Option<R> {
        let mut entries = self.write();
        let entry = entries.entry(id).or_insert_with(Entry::new);
        if !matches!(entry.state, CoValueState::Available(_)) {
            let core = create()?;
            debug!(co_value = %id, "now available");
            entry.state = CoValueState::Available(Box::new(core));
        }
        let CoValueState::Available(core) = &mut entry.state else {
            return None;
        };
        let result = f(core);
        entry.bump();
        Some(result)
    }

    /// Make `core` available. An already available CoValue is kept.
    pub fn insert(&self, core: CoValueCore) -> bool {
        let id = core.id();
        let mut entries = self.write();
        let entry = entries.entry(id).or_insert_with(Entry::new);
        if matches!(entry.state, CoValueState::Available(_)) {
            return false;
        }
        entry.state = CoValueState::Available(Box::new(core));
        entry.bump();
        true
    }

    /// Mark `id` as loading from `peers`. Returns false if it is already
    /// available or loading. With no peers it becomes unavailable at once.
    pub fn start_loading(&self, id: CoID, peers: BTreeSet<PeerID>) -> bool {
        let mut entries = self.write();
        let entry = entries.entry(id).or_insert_with(Entry::new);
        match entry.state {
            CoValueState::Unknown | CoValueState::Unavailable => {}
            _ => return false,
        }
        entry.state = if peers.is_empty() {
            CoValueState::Unavailable
        } else {
            CoValueState::Loading { waiting_on: peers }
        };
        entry.bump();
        true
    }

    /// `peer` answered that it lacks `id`.
    pub fn peer_missing(&self, id: &CoID, peer: &PeerID) {
        let mut entries = self.write();
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        Self::drop_waiter(id, entry, peer);
    }

    /// `peer` disconnected; stop waiting on it everywhere.
    pub fn peer_gone(&self, peer: &PeerID) {
        let mut entries = self.write();
        for (id, entry) in entries.iter_mut() {
            Self::drop_waiter(id, entry, peer);
        }
    }

    fn drop_waiter(id: &CoID, entry: &mut Entry, peer: &PeerID) {
        let CoValueState::Loading { waiting_on } = &mut entry.state else {
            return;
        };
        if waiting_on.remove(peer) && waiting_on.is_empty() {
            debug!(co_value = %id, "unavailable from all peers");
            entry.state = CoValueState::Unavailable;
            entry.bump();
        }
    }

    /// Watch the version counter of `id`, creating an unknown entry if needed.
    pub fn watch(&self, id: &CoID) -> watch::Receiver<u64> {
        if let Some(entry) = self.read().get(id) {
            return entry.version.subscribe();
        }
        self.write()
            .entry(*id)
            .or_insert_with(Entry::new)
            .version
            .subscribe()
    }

    /// Wait until `id` is available or unavailable, or until `timeout`.
    pub async fn wait_for(&self, id: &CoID, timeout: Duration) -> LoadStatus {
        let mut changes = self.watch(id);
        let settled = tokio::time::timeout(timeout, async {
            loop {
                let status = self.status(id);
                if matches!(status, LoadStatus::Available | LoadStatus::Unavailable) {
                    return status;
                }
                if changes.changed().await.is_err() {
                    return status;
                }
            }
        })
        .await;
        settled.unwrap_or_else(|_| self.status(id))
    }

    /// Available CoValues with their priorities, high priority first.
    pub fn available(&self) -> Vec<(CoID, Priority)> {
        let mut out: Vec<_> = self
            .read()
            .iter()
            .filter_map(|(id, e)| match &e.state {
                CoValueState::Available(core) => Some((*id, core.priority())),
                _ => None,
            })
            .collect();
        out.sort_by_key(|(id, p)| (*p, *id));
        out
    }

    pub fn known_state(&self, id: &CoID) -> Option<KnownState> {
        self.with_core(id, CoValueCore::known_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use coweave_core::{ContentType, CryptoProvider, Header, Ruleset, SoftwareCrypto};

    fn core(tag: &str) -> CoValueCore {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);
        let header = Header {
            content_type: ContentType::Map,
            ruleset: Ruleset::UnsafeAllowAll,
            meta: None,
            created_at: None,
            uniqueness: Some(tag.into()),
        };
        CoValueCore::new(header, crypto).unwrap()
    }

    fn peers(names: &[&str]) -> BTreeSet<PeerID> {
        names.iter().map(|n| PeerID::from(*n)).collect()
    }

    #[test]
    fn test_loading_becomes_unavailable_after_all_peers_answer() {
        let registry = CoValueRegistry::new();
        let id = CoID::from_bytes([1; 32]);

        assert!(registry.start_loading(id, peers(&["a", "b"])));
        assert!(!registry.start_loading(id, peers(&["c"])));
        registry.peer_missing(&id, &PeerID::from("a"));
        assert_eq!(registry.status(&id), LoadStatus::Loading);
        registry.peer_gone(&PeerID::from("b"));
        assert_eq!(registry.status(&id), LoadStatus::Unavailable);

        // Unavailable values may be retried.
        assert!(registry.start_loading(id, peers(&["c"])));
    }

    #[test]
    fn test_no_peers_means_unavailable() {
        let registry = CoValueRegistry::new();
        let id = CoID::from_bytes([1; 32]);
        registry.start_loading(id, BTreeSet::new());
        assert_eq!(registry.status(&id), LoadStatus::Unavailable);
    }

    #[test]
    fn test_insert_keeps_existing() {
        let registry = CoValueRegistry::new();
        let c = core("x");
        let id = c.id();
        assert!(registry.insert(c.clone()));
        assert!(!registry.insert(c));
        assert!(registry.is_available(&id));
        assert!(registry.known_state(&id).unwrap().header);
    }

    #[test]
    fn test_upsert_needs_header_for_new_values() {
        let registry = CoValueRegistry::new();
        let c = core("y");
        let id = c.id();
        assert!(registry.upsert_with(id, || None, |_| ()).is_none());
        assert_eq!(registry.status(&id), LoadStatus::Unknown);
        assert_eq!(registry.upsert_with(id, || Some(c), |core| core.id()), Some(id));
        assert!(registry.is_available(&id));
    }

    #[tokio::test]
    async fn test_wait_for_wakes_on_insert() {
        let registry = Arc::new(CoValueRegistry::new());
        let c = core("z");
        let id = c.id();
        registry.start_loading(id, peers(&["server"]));

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_for(&id, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        registry.upsert_with(id, || Some(c), |_| ());
        assert_eq!(waiter.await.unwrap(), LoadStatus::Available);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let registry = CoValueRegistry::new();
        let id = CoID::from_bytes([4; 32]);
        registry.start_loading(id, peers(&["server"]));
        assert_eq!(
            registry.wait_for(&id, Duration::from_millis(20)).await,
            LoadStatus::Loading
        );
    }
}
