//! SQLite implementation of the storage adapter.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;

use coweave_core::{CoID, Header, SessionID, Signature, Transaction};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{
    RowID, SessionUpdate, StorageAdapter, StorageTransaction, StoredCoValue, StoredSession,
    StoredSignature, StoredTransaction, UnitOfWork,
};

/// SQLite-based storage adapter.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Background(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Background(format!("spawn_blocking failed: {e}")))?
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(format!("{what}: {e}")))
}

fn fixed<const N: usize>(bytes: Vec<u8>, what: &str) -> Result<[u8; N]> {
    bytes.try_into().map_err(|b: Vec<u8>| {
        StoreError::InvalidData(format!("{what}: expected {N} bytes, got {}", b.len()))
    })
}

fn session_from_row(
    row_id: RowID,
    co_value: RowID,
    session: String,
    len: i64,
    signature: Vec<u8>,
    bytes_since: i64,
) -> Result<StoredSession> {
    Ok(StoredSession {
        row_id,
        co_value,
        session: session
            .parse::<SessionID>()
            .map_err(|e| StoreError::InvalidData(e.to_string()))?,
        len: len as usize,
        last_signature: Signature::from_bytes(fixed(signature, "last_signature")?),
        bytes_since_signature: bytes_since as usize,
    })
}

/// A unit of work bound to an open SQLite transaction.
struct SqliteTransaction<'a> {
    conn: &'a Connection,
}

impl StorageTransaction for SqliteTransaction<'_> {
    fn add_session_update(&mut self, update: &SessionUpdate) -> Result<RowID> {
        let session = update.session.to_string();
        self.conn.execute(
            "INSERT INTO sessions (covalue, session_id, len, last_signature, bytes_since_signature)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(covalue, session_id) DO UPDATE SET
                len = excluded.len,
                last_signature = excluded.last_signature,
                bytes_since_signature = excluded.bytes_since_signature",
            params![
                update.co_value,
                session,
                update.len as i64,
                update.last_signature.as_bytes().as_slice(),
                update.bytes_since_signature as i64,
            ],
        )?;
        let row_id = self.conn.query_row(
            "SELECT row_id FROM sessions WHERE covalue = ?1 AND session_id = ?2",
            params![update.co_value, session],
            |row| row.get(0),
        )?;
        Ok(row_id)
    }

    fn add_transaction(&mut self, session_row: RowID, idx: usize, tx: &Transaction) -> Result<()> {
        let bytes = tx.canonical_bytes()?;
        self.conn.execute(
            "INSERT INTO transactions (session, idx, tx) VALUES (?1, ?2, ?3)",
            params![session_row, idx as i64, bytes],
        )?;
        Ok(())
    }

    fn add_signature_after(
        &mut self,
        session_row: RowID,
        idx: usize,
        signature: &Signature,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO signature_after (session, idx, signature) VALUES (?1, ?2, ?3)",
            params![session_row, idx as i64, signature.as_bytes().as_slice()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for SqliteStore {
    async fn get_co_value(&self, id: &CoID) -> Result<Option<StoredCoValue>> {
        let id = *id;
        self.blocking(move |conn| {
            let raw: Option<(RowID, Vec<u8>)> = conn
                .query_row(
                    "SELECT row_id, header FROM covalues WHERE id = ?1",
                    params![id.as_bytes().as_slice()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match raw {
                Some((row_id, header)) => Ok(Some(StoredCoValue {
                    row_id,
                    id,
                    header: decode(&header, "header")?,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_co_value_sessions(&self, co_value: RowID) -> Result<Vec<StoredSession>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT row_id, session_id, len, last_signature, bytes_since_signature
                 FROM sessions WHERE covalue = ?1 ORDER BY row_id",
            )?;
            let rows = stmt
                .query_map(params![co_value], |row| {
                    Ok((
                        row.get::<_, RowID>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(row_id, session, len, sig, bytes)| {
                    session_from_row(row_id, co_value, session, len, sig, bytes)
                })
                .collect()
        })
        .await
    }

    async fn get_new_transaction_in_session(
        &self,
        session_row: RowID,
        from: usize,
    ) -> Result<Vec<StoredTransaction>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT idx, tx FROM transactions WHERE session = ?1 AND idx >= ?2 ORDER BY idx",
            )?;
            let rows = stmt
                .query_map(params![session_row, from as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(idx, tx)| -> Result<StoredTransaction> {
                    Ok(StoredTransaction {
                        idx: idx as usize,
                        tx: decode(&tx, "transaction")?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn get_signatures(
        &self,
        session_row: RowID,
        from: usize,
    ) -> Result<Vec<StoredSignature>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT idx, signature FROM signature_after
                 WHERE session = ?1 AND idx >= ?2 ORDER BY idx",
            )?;
            let rows = stmt
                .query_map(params![session_row, from as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(idx, sig)| -> Result<StoredSignature> {
                    Ok(StoredSignature {
                        idx: idx as usize,
                        signature: Signature::from_bytes(fixed(sig, "signature")?),
                    })
                })
                .collect()
        })
        .await
    }

    async fn add_co_value(&self, id: &CoID, header: &Header) -> Result<RowID> {
        let id = *id;
        let header = header.canonical_bytes()?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO covalues (id, header) VALUES (?1, ?2)",
                params![id.as_bytes().as_slice(), header],
            )?;
            let row_id = conn.query_row(
                "SELECT row_id FROM covalues WHERE id = ?1",
                params![id.as_bytes().as_slice()],
                |row| row.get(0),
            )?;
            Ok(row_id)
        })
        .await
    }

    async fn unit_of_work(&self, work: UnitOfWork) -> Result<()> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            work(&mut SqliteTransaction { conn: &tx })?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{StorageExt, StoreOutcome};
    use coweave_core::{
        Change, CoValueCore, ContentType, CryptoProvider, Privacy, Ruleset, SoftwareCrypto,
    };

    fn map_core(crypto: &Arc<dyn CryptoProvider>) -> (CoValueCore, coweave_core::AgentSecret, SessionID) {
        let agent = crypto.new_agent_secret();
        let session = SessionID::new(crypto.agent_id(&agent), 7);
        let header = Header {
            content_type: ContentType::Map,
            ruleset: Ruleset::UnsafeAllowAll,
            meta: Some(serde_json::json!({"kind": "test"})),
            created_at: Some(1),
            uniqueness: None,
        };
        (CoValueCore::new(header, crypto.clone()).unwrap(), agent, session)
    }

    fn write(core: &mut CoValueCore, agent: &coweave_core::AgentSecret, session: SessionID, key: &str) {
        core.make_transaction(
            agent,
            session,
            &[Change::MapSet {
                key: key.into(),
                value: serde_json::json!(key.len()),
            }],
            Privacy::Trusting,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_add_co_value_is_idempotent() {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);
        let (core, _, _) = map_core(&crypto);
        let store = SqliteStore::open_memory().unwrap();

        let a = store.add_co_value(&core.id(), core.header()).await.unwrap();
        let b = store.add_co_value(&core.id(), core.header()).await.unwrap();
        assert_eq!(a, b);

        let stored = store.get_co_value(&core.id()).await.unwrap().unwrap();
        assert_eq!(&stored.header, core.header());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coweave.db");
        let crypto: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);
        let (mut core, agent, session) = map_core(&crypto);
        write(&mut core, &agent, session, "a");
        write(&mut core, &agent, session, "bb");

        {
            let store = SqliteStore::open(&path).unwrap();
            for piece in core.new_content_since(None) {
                assert_eq!(store.store_piece(&piece).await.unwrap(), StoreOutcome::Stored);
            }
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.load_core(&core.id(), crypto.clone()).await.unwrap().unwrap();
        assert_eq!(loaded.known_state(), core.known_state());
        assert_eq!(
            loaded.verified_sorted_transactions().len(),
            core.verified_sorted_transactions().len()
        );
    }

    #[tokio::test]
    async fn test_unit_of_work_rolls_back() {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);
        let (core, _, session) = map_core(&crypto);
        let store = SqliteStore::open_memory().unwrap();
        let row = store.add_co_value(&core.id(), core.header()).await.unwrap();

        let result = store
            .unit_of_work(Box::new(move |txn: &mut dyn StorageTransaction| {
                txn.add_session_update(&SessionUpdate {
                    co_value: row,
                    session,
                    len: 0,
                    last_signature: Signature::ZERO,
                    bytes_since_signature: 0,
                })?;
                Err(StoreError::InvalidData("abort".into()))
            }))
            .await;

        assert!(result.is_err());
        assert!(store.get_co_value_sessions(row).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_update_upserts() {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);
        let (mut core, agent, session) = map_core(&crypto);
        write(&mut core, &agent, session, "a");
        let store = SqliteStore::open_memory().unwrap();
        store.store_piece(&core.new_content_since(None)[0]).await.unwrap();

        let known = store.known_state(&core.id()).await.unwrap().unwrap();
        write(&mut core, &agent, session, "b");
        store
            .store_piece(&core.new_content_since(Some(&known))[0])
            .await
            .unwrap();

        let row = store.get_co_value(&core.id()).await.unwrap().unwrap().row_id;
        let sessions = store.get_co_value_sessions(row).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].len, 2);
        assert_eq!(sessions[0].session, session);
    }

    #[tokio::test]
    async fn test_unknown_co_value() {
        let store = SqliteStore::open_memory().unwrap();
        assert!(store.get_co_value(&CoID::from_bytes([3; 32])).await.unwrap().is_none());
        assert!(store.known_state(&CoID::from_bytes([3; 32])).await.unwrap().is_none());
    }
}
