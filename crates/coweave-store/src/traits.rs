//! Storage adapter trait: the row-level interface for persisting CoValues.
//!
//! The layout mirrors the data model. One row per CoValue holds its
//! header, one row per session holds its length and latest signature, and
//! transactions and checkpoint signatures hang off the session row.
//!
//! [`StorageExt`] builds the operations the storage peer needs (load a
//! whole CoValue, write a content piece) on top of those rows.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use coweave_core::{
    CoID, CoValueCore, CryptoProvider, Header, KnownState, NewContentPiece, SessionID, Signature,
    Transaction, MAX_RECOMMENDED_TX_SIZE,
};

use crate::error::Result;

/// Storage-local row id.
pub type RowID = i64;

/// A stored CoValue header.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCoValue {
    pub row_id: RowID,
    pub id: CoID,
    pub header: Header,
}

/// A stored session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub row_id: RowID,
    pub co_value: RowID,
    pub session: SessionID,
    /// Number of stored transactions.
    pub len: usize,
    /// Signature over the whole stored session.
    pub last_signature: Signature,
    /// Transaction bytes written since the last checkpoint signature.
    pub bytes_since_signature: usize,
}

/// Insert-or-update for a session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub co_value: RowID,
    pub session: SessionID,
    pub len: usize,
    pub last_signature: Signature,
    pub bytes_since_signature: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTransaction {
    pub idx: usize,
    pub tx: Transaction,
}

/// A checkpoint: the signature over the session up to and including `idx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredSignature {
    pub idx: usize,
    pub signature: Signature,
}

/// Writes performed inside a unit of work. Either all of them land or none.
pub trait StorageTransaction {
    /// Upsert the session row keyed by `(co_value, session)` and return its row id.
    fn add_session_update(&mut self, update: &SessionUpdate) -> Result<RowID>;

    fn add_transaction(&mut self, session_row: RowID, idx: usize, tx: &Transaction) -> Result<()>;

    fn add_signature_after(
        &mut self,
        session_row: RowID,
        idx: usize,
        signature: &Signature,
    ) -> Result<()>;
}

/// A batch of writes run atomically by [`StorageAdapter::unit_of_work`].
pub type UnitOfWork = Box<dyn FnOnce(&mut dyn StorageTransaction) -> Result<()> + Send>;

/// The storage adapter: async row access for CoValue persistence.
///
/// For SQLite, implementations use `spawn_blocking` internally to avoid
/// blocking the runtime.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get_co_value(&self, id: &CoID) -> Result<Option<StoredCoValue>>;

    async fn get_co_value_sessions(&self, co_value: RowID) -> Result<Vec<StoredSession>>;

    /// Transactions of a session with index `from` or later, ordered by index.
    async fn get_new_transaction_in_session(
        &self,
        session_row: RowID,
        from: usize,
    ) -> Result<Vec<StoredTransaction>>;

    /// Checkpoint signatures at index `from` or later, ordered by index.
    async fn get_signatures(&self, session_row: RowID, from: usize)
        -> Result<Vec<StoredSignature>>;

    /// Store a header. Storing the same id twice returns the existing row.
    async fn add_co_value(&self, id: &CoID, header: &Header) -> Result<RowID>;

    /// Run `work` atomically. If it returns an error, nothing it wrote is kept.
    async fn unit_of_work(&self, work: UnitOfWork) -> Result<()>;
}

/// Outcome of writing a content piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Everything new in the piece was written.
    Stored,
    /// No header is stored for the CoValue and the piece carried none.
    UnknownCoValue,
    /// Some sessions started past what storage holds; nothing was written
    /// for those. Carries what storage actually has.
    Gap(KnownState),
}

/// Higher-level operations over a [`StorageAdapter`].
#[async_trait]
pub trait StorageExt: StorageAdapter {
    /// What storage holds for `id`, without reading transactions.
    async fn known_state(&self, id: &CoID) -> Result<Option<KnownState>>;

    /// Rebuild a CoValue from storage, re-verifying every signature.
    async fn load_core(
        &self,
        id: &CoID,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Option<CoValueCore>>;

    /// Persist a content piece, skipping transactions already stored.
    async fn store_piece(&self, piece: &NewContentPiece) -> Result<StoreOutcome>;
}

#[async_trait]
impl<S: StorageAdapter + ?Sized> StorageExt for S {
    async fn known_state(&self, id: &CoID) -> Result<Option<KnownState>> {
        let Some(stored) = self.get_co_value(id).await? else {
            return Ok(None);
        };
        let mut known = KnownState::empty(*id);
        known.header = true;
        for session in self.get_co_value_sessions(stored.row_id).await? {
            known.sessions.insert(session.session, session.len);
        }
        Ok(Some(known))
    }

    async fn load_core(
        &self,
        id: &CoID,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Option<CoValueCore>> {
        let Some(stored) = self.get_co_value(id).await? else {
            return Ok(None);
        };
        let mut core = CoValueCore::with_expected_id(*id, stored.header, crypto)?;

        for session in self.get_co_value_sessions(stored.row_id).await? {
            let txs: Vec<Transaction> = self
                .get_new_transaction_in_session(session.row_id, 0)
                .await?
                .into_iter()
                .map(|t| t.tx)
                .collect();
            let checkpoints = self.get_signatures(session.row_id, 0).await?;

            let mut start = 0;
            for checkpoint in checkpoints {
                let end = checkpoint.idx + 1;
                if end <= start || end >= txs.len() {
                    continue;
                }
                core.try_add_transactions(
                    session.session,
                    start,
                    txs[start..end].to_vec(),
                    Some(checkpoint.signature),
                )?;
                start = end;
            }
            if start < txs.len() {
                core.try_add_transactions(
                    session.session,
                    start,
                    txs[start..].to_vec(),
                    Some(session.last_signature),
                )?;
            }
        }

        debug!(co_value = %id, "loaded from storage");
        Ok(Some(core))
    }

    async fn store_piece(&self, piece: &NewContentPiece) -> Result<StoreOutcome> {
        let row = match (self.get_co_value(&piece.id).await?, &piece.header) {
            (Some(stored), _) => stored.row_id,
            (None, Some(header)) => self.add_co_value(&piece.id, header).await?,
            (None, None) => return Ok(StoreOutcome::UnknownCoValue),
        };

        let existing: BTreeMap<SessionID, StoredSession> = self
            .get_co_value_sessions(row)
            .await?
            .into_iter()
            .map(|s| (s.session, s))
            .collect();

        let mut gap = false;
        let mut plans = Vec::new();
        for (session, content) in &piece.new {
            let stored = existing.get(session);
            let ours = stored.map_or(0, |s| s.len);
            let theirs_end = content.after + content.new_transactions.len();

            if content.after > ours {
                trace!(co_value = %piece.id, %session, ours, after = content.after, "gap in stored session");
                gap = true;
                continue;
            }
            if theirs_end <= ours {
                continue;
            }

            let new_txs = &content.new_transactions[ours - content.after..];
            let mut bytes = stored.map_or(0, |s| s.bytes_since_signature);
            for tx in new_txs {
                bytes += tx.canonical_bytes()?.len();
            }
            let checkpoint = if bytes > MAX_RECOMMENDED_TX_SIZE {
                bytes = 0;
                Some(theirs_end - 1)
            } else {
                None
            };

            plans.push(SessionPlan {
                update: SessionUpdate {
                    co_value: row,
                    session: *session,
                    len: theirs_end,
                    last_signature: content.last_signature,
                    bytes_since_signature: bytes,
                },
                first_idx: ours,
                txs: new_txs.to_vec(),
                checkpoint,
            });
        }

        if !plans.is_empty() {
            self.unit_of_work(Box::new(move |txn: &mut dyn StorageTransaction| {
                for plan in plans {
                    let session_row = txn.add_session_update(&plan.update)?;
                    for (i, tx) in plan.txs.iter().enumerate() {
                        txn.add_transaction(session_row, plan.first_idx + i, tx)?;
                    }
                    if let Some(idx) = plan.checkpoint {
                        txn.add_signature_after(session_row, idx, &plan.update.last_signature)?;
                    }
                }
                Ok(())
            }))
            .await?;
        }

        if gap {
            let known = self
                .known_state(&piece.id)
                .await?
                .unwrap_or_else(|| KnownState::empty(piece.id));
            return Ok(StoreOutcome::Gap(known));
        }
        Ok(StoreOutcome::Stored)
    }
}

struct SessionPlan {
    update: SessionUpdate,
    first_idx: usize,
    txs: Vec<Transaction>,
    checkpoint: Option<usize>,
}
