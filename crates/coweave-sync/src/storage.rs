//! Storage as a peer.
//!
//! [`StorageDriver`] answers the sync protocol from a [`StorageAdapter`]:
//! `load` is served from stored rows (dependencies first) and `content` is
//! persisted. Storage keeps no per-peer state, so `known` and `done` are
//! ignored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use coweave_core::{CoID, CoValueCore, CryptoProvider, KnownState};
use coweave_store::{StorageAdapter, StorageExt, StoreOutcome};

use crate::error::Result;
use crate::messages::{split_piece, SyncMessage};
use crate::peer::Peer;

/// Serves one node from a storage adapter.
pub struct StorageDriver {
    storage: Arc<dyn StorageAdapter>,
    crypto: Arc<dyn CryptoProvider>,
    max_piece_bytes: usize,
}

impl StorageDriver {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        crypto: Arc<dyn CryptoProvider>,
        max_piece_bytes: usize,
    ) -> Self {
        Self {
            storage,
            crypto,
            max_piece_bytes,
        }
    }

    /// Serve `peer` (the storage end of a link to a node) until it closes.
    pub fn spawn(self, peer: Peer) -> JoinHandle<()> {
        tokio::spawn(self.run(peer))
    }

    pub async fn run(self, mut peer: Peer) {
        while let Some(message) = peer.incoming.recv().await {
            let id = message.id();
            match self.handle(message).await {
                Ok(replies) => {
                    for reply in replies {
                        if peer.outgoing.send(reply).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!(co_value = %id, error = %e, "storage request failed"),
            }
        }
        debug!(peer = %peer.id, "storage link closed");
    }

    /// Replies to one message.
    pub async fn handle(&self, message: SyncMessage) -> Result<Vec<SyncMessage>> {
        match message {
            SyncMessage::Load { known } => self.answer_load(known).await,
            SyncMessage::Content { piece } => {
                let id = piece.id;
                Ok(match self.storage.store_piece(&piece).await? {
                    StoreOutcome::Stored => Vec::new(),
                    StoreOutcome::UnknownCoValue => {
                        vec![SyncMessage::correction(KnownState::empty(id))]
                    }
                    StoreOutcome::Gap(known) => vec![SyncMessage::correction(known)],
                })
            }
            SyncMessage::Known { .. } | SyncMessage::Done { .. } => {
                trace!("storage ignores known and done");
                Ok(Vec::new())
            }
        }
    }

    async fn answer_load(&self, known: KnownState) -> Result<Vec<SyncMessage>> {
        let root = known.id;
        let mut cores: HashMap<CoID, CoValueCore> = HashMap::new();
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
            let Some(core) = self.storage.load_core(&id, self.crypto.clone()).await? else {
                continue;
            };
            stack.push((id, true));
            stack.extend(
                core.dependencies()
                    .into_iter()
                    .filter(|d| !visited.contains(d))
                    .map(|d| (d, false)),
            );
            cores.insert(id, core);
        }

        if !cores.contains_key(&root) {
            return Ok(vec![SyncMessage::known(KnownState::empty(root))]);
        }

        let mut replies = Vec::new();
        for id in order {
            let Some(core) = cores.get(&id) else {
                continue;
            };
            let is_root = id == root;
            replies.push(SyncMessage::Known {
                known: core.known_state(),
                is_correction: false,
                as_dependency_of: (!is_root).then_some(root),
            });
            let pieces = core.new_content_since(is_root.then_some(&known));
            for piece in pieces {
                for part in split_piece(piece, self.max_piece_bytes) {
                    replies.push(SyncMessage::Content { piece: part });
                }
            }
        }
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use coweave_core::{
        Change, ContentType, Header, Privacy, Ruleset, SessionID, SoftwareCrypto,
    };
    use coweave_store::{MemoryStore, SqliteStore};

    use crate::manager::{SyncConfig, SyncManager};
    use crate::peer::{connected_pair, PeerRole};
    use crate::registry::{CoValueRegistry, LoadStatus};

    fn crypto() -> Arc<dyn CryptoProvider> {
        Arc::new(SoftwareCrypto)
    }

    fn node_with_storage(storage: Arc<dyn StorageAdapter>) -> Arc<SyncManager> {
        let crypto = crypto();
        let manager = SyncManager::new(
            Arc::new(CoValueRegistry::new()),
            crypto.clone(),
            SyncConfig::default(),
        );
        let (to_storage, to_node) =
            connected_pair("node", PeerRole::Client, "storage", PeerRole::Storage, 16);
        manager.add_peer(to_storage).unwrap();
        StorageDriver::new(storage, crypto, SyncConfig::default().max_piece_bytes).spawn(to_node);
        manager
    }

    fn write_map(manager: &SyncManager, tag: &str) -> CoID {
        let crypto = crypto();
        let agent = crypto.new_agent_secret();
        let session = SessionID::new(crypto.agent_id(&agent), 1);
        let header = Header {
            content_type: ContentType::Map,
            ruleset: Ruleset::UnsafeAllowAll,
            meta: None,
            created_at: None,
            uniqueness: Some(tag.into()),
        };
        let mut core = CoValueCore::new(header, crypto).unwrap();
        for n in 0..3 {
            core.make_transaction(
                &agent,
                session,
                &[Change::MapSet {
                    key: "n".into(),
                    value: serde_json::json!(n),
                }],
                Privacy::Trusting,
            )
            .unwrap();
        }
        let id = core.id();
        manager.registry().insert(core);
        manager.sync_co_value(&id);
        id
    }

    async fn until_stored(storage: &dyn StorageAdapter, id: &CoID, len: usize) {
        for _ in 0..200 {
            if let Some(known) = storage.known_state(id).await.unwrap() {
                if known.sessions.values().sum::<usize>() == len {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("storage never caught up");
    }

    #[tokio::test]
    async fn test_writes_reach_storage_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.db");
        let storage: Arc<dyn StorageAdapter> = Arc::new(SqliteStore::open(&path).unwrap());

        let first = node_with_storage(storage.clone());
        let id = write_map(&first, "persisted");
        until_stored(storage.as_ref(), &id, 3).await;
        let expected = first.registry().known_state(&id).unwrap();
        first.disconnect_all();

        let reopened: Arc<dyn StorageAdapter> = Arc::new(SqliteStore::open(&path).unwrap());
        let second = node_with_storage(reopened);
        assert_eq!(
            second.load(id, Duration::from_secs(5)).await,
            LoadStatus::Available
        );
        assert_eq!(second.registry().known_state(&id).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_missing_value_answers_empty_known() {
        let driver = StorageDriver::new(Arc::new(MemoryStore::new()), crypto(), 1024);
        let id = CoID::from_bytes([8; 32]);
        let replies = driver
            .handle(SyncMessage::Load {
                known: KnownState::empty(id),
            })
            .await
            .unwrap();
        assert_eq!(replies, vec![SyncMessage::known(KnownState::empty(id))]);
    }

    #[tokio::test]
    async fn test_headerless_content_gets_correction() {
        let store = Arc::new(MemoryStore::new());
        let driver = StorageDriver::new(store, crypto(), 1024);
        let manager = SyncManager::new(Arc::new(CoValueRegistry::new()), crypto(), SyncConfig::default());
        let id = write_map(&manager, "headerless");
        let mut piece = manager
            .registry()
            .with_core(&id, |c| c.new_content_since(None))
            .unwrap()
            .remove(0);
        piece.header = None;

        let replies = driver.handle(SyncMessage::Content { piece }).await.unwrap();
        assert_eq!(replies, vec![SyncMessage::correction(KnownState::empty(id))]);
    }

    #[tokio::test]
    async fn test_known_and_done_are_ignored() {
        let driver = StorageDriver::new(Arc::new(MemoryStore::new()), crypto(), 1024);
        let id = CoID::from_bytes([8; 32]);
        assert!(driver
            .handle(SyncMessage::known(KnownState::empty(id)))
            .await
            .unwrap()
            .is_empty());
        assert!(driver.handle(SyncMessage::Done { id }).await.unwrap().is_empty());
    }
}
