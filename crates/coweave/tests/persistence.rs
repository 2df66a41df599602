//! Storage as a peer: everything a node writes survives a restart.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use coweave::store::{SqliteStore, StorageAdapter, StorageExt};
use coweave::{Account, AccountMigration, CoID, CryptoProvider, LocalNode, NodeError};
use coweave_testkit::fixtures::{account_node, crypto, init_tracing, test_config};

async fn until_stored(storage: &dyn StorageAdapter, node: &LocalNode, ids: &[CoID]) {
    for _ in 0..500 {
        let mut done = true;
        for id in ids {
            let ours = node.registry().known_state(id).unwrap();
            let stored = storage.known_state(id).await.unwrap();
            done &= stored.map_or(false, |s| s.covers(&ours));
        }
        if done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("storage did not catch up");
}

#[tokio::test]
async fn test_account_and_content_reload_from_sqlite() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.db");

    let first = account_node("Ada");
    let storage: Arc<dyn StorageAdapter> = Arc::new(SqliteStore::open(&path).unwrap());
    first.connect_storage(storage.clone()).unwrap();

    let group = first.create_group().unwrap();
    let map = group.create_map().unwrap();
    map.set("greeting", "hello").unwrap();
    let blob = group.create_binary_stream().unwrap();
    blob.write_all("text/plain", Some("note.txt"), b"stored bytes", 4)
        .unwrap();
    let account = first.account().unwrap();
    account.set_root(&map.id()).unwrap();

    let mut ids: Vec<CoID> = first
        .registry()
        .available()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    ids.sort();
    until_stored(storage.as_ref(), &first, &ids).await;
    first.disconnect_all();

    // Same agent, new session, fresh registry.
    let second = LocalNode::with_account(crypto(), test_config(), first.agent_secret().clone(), None)
        .unwrap();
    assert_ne!(second.session(), first.session());
    second
        .connect_storage(Arc::new(SqliteStore::open(&path).unwrap()))
        .unwrap();

    let account = second.load_account(None).await.unwrap();
    assert_eq!(account.id(), first.account_id().unwrap());
    let root = account.root_id().unwrap().unwrap();
    assert_eq!(root, map.id());

    let map = second.load_map(root).await.unwrap().available().unwrap();
    assert_eq!(map.get("greeting").unwrap(), Some(json!("hello")));
    map.set("greeting", "hello again").unwrap();

    let blob = second
        .load_binary_stream(blob.id())
        .await
        .unwrap()
        .available()
        .unwrap();
    let chunks = blob.chunks(false).unwrap().unwrap();
    assert_eq!(chunks.file_name.as_deref(), Some("note.txt"));
    assert_eq!(chunks.to_bytes(), Bytes::from_static(b"stored bytes"));

    let profile_id = account.profile_id().unwrap().unwrap();
    let profile = second.load_map(profile_id).await.unwrap().available().unwrap();
    assert_eq!(profile.get("name").unwrap(), Some(json!("Ada")));
    assert!(account.profile().unwrap().is_some());
}

#[tokio::test]
async fn test_migration_runs_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("migrate.db");

    let first = account_node("Bo");
    let storage: Arc<dyn StorageAdapter> = Arc::new(SqliteStore::open(&path).unwrap());
    first.connect_storage(storage.clone()).unwrap();
    let account_id = first.account_id().unwrap();
    let mut ids: Vec<CoID> = first.registry().available().into_iter().map(|(id, _)| id).collect();
    ids.sort();
    until_stored(storage.as_ref(), &first, &ids).await;
    first.disconnect_all();

    let second = LocalNode::with_account(crypto(), test_config(), first.agent_secret().clone(), None)
        .unwrap();
    second
        .connect_storage(Arc::new(SqliteStore::open(&path).unwrap()))
        .unwrap();
    let migration: AccountMigration = Box::new(|node: &LocalNode, account: &Account| {
        if account.root_id()?.is_none() {
            let group = node.create_group()?;
            let root = group.create_list()?;
            account.set_root(&root.id())?;
        }
        Ok(())
    });
    let account = second.load_account(Some(migration)).await.unwrap();
    assert_eq!(account.id(), account_id);
    assert!(account.root_id().unwrap().is_some());
}

#[tokio::test]
async fn test_account_missing_from_storage_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.db");
    let mut config = test_config();
    config.load_timeout = Duration::from_millis(500);

    let node = LocalNode::with_account(crypto(), config, crypto().new_agent_secret(), None).unwrap();
    node.connect_storage(Arc::new(SqliteStore::open(&path).unwrap()))
        .unwrap();
    assert!(matches!(
        node.load_account(None).await,
        Err(NodeError::Unavailable(_))
    ));
}
