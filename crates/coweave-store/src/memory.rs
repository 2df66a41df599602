//! In-memory implementation of the storage adapter.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use coweave_core::{CoID, Header, SessionID, Signature, Transaction};

use crate::error::{Result, StoreError};
use crate::traits::{
    RowID, SessionUpdate, StorageAdapter, StorageTransaction, StoredCoValue, StoredSession,
    StoredSignature, StoredTransaction, UnitOfWork,
};

/// In-memory store.
///
/// All data is lost when the store is dropped. A unit of work runs against
/// a staged copy that replaces the live state only if the work succeeds.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default, Clone)]
struct MemoryStoreInner {
    next_row: RowID,
    co_values: BTreeMap<RowID, StoredCoValue>,
    by_id: HashMap<CoID, RowID>,
    sessions: BTreeMap<RowID, StoredSession>,
    session_rows: HashMap<(RowID, SessionID), RowID>,
    transactions: BTreeMap<(RowID, usize), Transaction>,
    signatures: BTreeMap<(RowID, usize), Signature>,
}

impl MemoryStoreInner {
    fn next_row(&mut self) -> RowID {
        self.next_row += 1;
        self.next_row
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Background(format!("lock poisoned: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Background(format!("lock poisoned: {e}")))
    }
}

impl StorageTransaction for MemoryStoreInner {
    fn add_session_update(&mut self, update: &SessionUpdate) -> Result<RowID> {
        if !self.co_values.contains_key(&update.co_value) {
            return Err(StoreError::NotFound(format!("co_value row {}", update.co_value)));
        }
        let key = (update.co_value, update.session);
        let row_id = match self.session_rows.get(&key) {
            Some(&row) => row,
            None => {
                let row = self.next_row();
                self.session_rows.insert(key, row);
                row
            }
        };
        self.sessions.insert(
            row_id,
            StoredSession {
                row_id,
                co_value: update.co_value,
                session: update.session,
                len: update.len,
                last_signature: update.last_signature,
                bytes_since_signature: update.bytes_since_signature,
            },
        );
        Ok(row_id)
    }

    fn add_transaction(&mut self, session_row: RowID, idx: usize, tx: &Transaction) -> Result<()> {
        if !self.sessions.contains_key(&session_row) {
            return Err(StoreError::NotFound(format!("session row {session_row}")));
        }
        if self.transactions.contains_key(&(session_row, idx)) {
            return Err(StoreError::InvalidData(format!(
                "transaction {idx} of session row {session_row} already stored"
            )));
        }
        self.transactions.insert((session_row, idx), tx.clone());
        Ok(())
    }

    fn add_signature_after(
        &mut self,
        session_row: RowID,
        idx: usize,
        signature: &Signature,
    ) -> Result<()> {
        if !self.sessions.contains_key(&session_row) {
            return Err(StoreError::NotFound(format!("session row {session_row}")));
        }
        self.signatures.insert((session_row, idx), *signature);
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for MemoryStore {
    async fn get_co_value(&self, id: &CoID) -> Result<Option<StoredCoValue>> {
        let inner = self.read()?;
        Ok(inner
            .by_id
            .get(id)
            .and_then(|row| inner.co_values.get(row))
            .cloned())
    }

    async fn get_co_value_sessions(&self, co_value: RowID) -> Result<Vec<StoredSession>> {
        let inner = self.read()?;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.co_value == co_value)
            .cloned()
            .collect())
    }

    async fn get_new_transaction_in_session(
        &self,
        session_row: RowID,
        from: usize,
    ) -> Result<Vec<StoredTransaction>> {
        let inner = self.read()?;
        Ok(inner
            .transactions
            .range((session_row, from)..(session_row, usize::MAX))
            .map(|(&(_, idx), tx)| StoredTransaction { idx, tx: tx.clone() })
            .collect())
    }

    async fn get_signatures(
        &self,
        session_row: RowID,
        from: usize,
    ) -> Result<Vec<StoredSignature>> {
        let inner = self.read()?;
        Ok(inner
            .signatures
            .range((session_row, from)..(session_row, usize::MAX))
            .map(|(&(_, idx), signature)| StoredSignature {
                idx,
                signature: *signature,
            })
            .collect())
    }

    async fn add_co_value(&self, id: &CoID, header: &Header) -> Result<RowID> {
        let mut inner = self.write()?;
        if let Some(&row) = inner.by_id.get(id) {
            return Ok(row);
        }
        let row_id = inner.next_row();
        inner.by_id.insert(*id, row_id);
        inner.co_values.insert(
            row_id,
            StoredCoValue {
                row_id,
                id: *id,
                header: header.clone(),
            },
        );
        Ok(row_id)
    }

    async fn unit_of_work(&self, work: UnitOfWork) -> Result<()> {
        let mut inner = self.write()?;
        let mut staged = inner.clone();
        work(&mut staged)?;
        *inner = staged;
        Ok(())
    }
}
