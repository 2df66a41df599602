//! The CoValue core: a header plus one signed log per session.
//!
//! The core owns replication state only. It knows nothing about permissions
//! or which read key applies; callers pass those in.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{AgentSecret, CryptoProvider, KeyID, KeySecret, Signature};
use crate::error::{CoreError, Result};
use crate::header::{ContentType, Header};
use crate::session::{signed_message, SessionLog};
use crate::transaction::{tx_nonce_material, Change, DecryptedTransaction, Privacy, Transaction};
use crate::types::{now_millis, CoID, SessionID, TransactionID};

/// How many transactions of each session a party holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: CoID,
    pub header: bool,
    pub sessions: BTreeMap<SessionID, usize>,
}

impl KnownState {
    /// Knows nothing, not even the header.
    pub fn empty(id: CoID) -> Self {
        Self {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    /// Take the per-session maximum of both states.
    pub fn combine(&mut self, other: &KnownState) {
        self.header |= other.header;
        for (session, &len) in &other.sessions {
            let entry = self.sessions.entry(*session).or_insert(0);
            *entry = (*entry).max(len);
        }
    }

    /// Whether `self` holds at least everything `other` holds.
    pub fn covers(&self, other: &KnownState) -> bool {
        (self.header || !other.header)
            && other
                .sessions
                .iter()
                .all(|(s, len)| self.sessions.get(s).copied().unwrap_or(0) >= *len)
    }

    pub fn session_len(&self, session: &SessionID) -> usize {
        self.sessions.get(session).copied().unwrap_or(0)
    }
}

/// Delivery priority of content. Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn for_header(header: &Header) -> Self {
        match header.content_type {
            ContentType::Group | ContentType::Account => Priority::High,
            ContentType::BinaryStream => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

/// New transactions of one session, ending in a signature over them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNewContent {
    pub after: usize,
    pub new_transactions: Vec<Transaction>,
    pub last_signature: Signature,
}

/// One verifiable piece of a CoValue's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewContentPiece {
    pub id: CoID,
    pub header: Option<Header>,
    pub priority: Priority,
    pub new: BTreeMap<SessionID, SessionNewContent>,
}

impl NewContentPiece {
    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.is_empty()
    }

    pub fn transaction_count(&self) -> usize {
        self.new.values().map(|s| s.new_transactions.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct CoValueCore {
    id: CoID,
    header: Header,
    sessions: BTreeMap<SessionID, SessionLog>,
    /// Newest `made_at` seen in any session; new local transactions sort after it.
    crypto: Arc<dyn CryptoProvider>,
}

impl CoValueCore {
    /// Create an empty CoValue; its id is the hash of `header`.
    pub fn new(header: Header, crypto: Arc<dyn CryptoProvider>) -> Result<Self> {
        let id = header.id(crypto.as_ref())?;
        Ok(Self {
            id,
            header,
            sessions: BTreeMap::new(),
            crypto,
        })
    }

    /// Create from a header received for `id`, rejecting mismatches.
    pub fn with_expected_id(
        id: CoID,
        header: Header,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self> {
        let core = Self::new(header, crypto)?;
        if core.id != id {
            return Err(CoreError::HeaderMismatch(id));
        }
        Ok(core)
    }

    pub fn id(&self) -> CoID {
        self.id
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.crypto
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&SessionID, &SessionLog)> {
        self.sessions.iter()
    }

    pub fn session_log(&self, session: &SessionID) -> Option<&SessionLog> {
        self.sessions.get(session)
    }

    pub fn priority(&self) -> Priority {
        Priority::for_header(&self.header)
    }

    /// Author, sign and append a transaction to `session`.
    pub fn make_transaction(
        &mut self,
        agent: &AgentSecret,
        session: SessionID,
        changes: &[Change],
        privacy: Privacy<'_>,
    ) -> Result<TransactionID> {
        if self.crypto.agent_id(agent) != session.agent {
            return Err(CoreError::Unauthorized(format!(
                "session {session} belongs to another agent"
            )));
        }

        // Only our own session's clock counts; remote made_at values are unchecked.
        let last = self
            .sessions
            .get(&session)
            .and_then(|log| log.transactions().last())
            .map_or(0, Transaction::made_at);
        let made_at = now_millis().max(last.saturating_add(1));
        self.append_transaction(agent, session, changes, privacy, made_at)
    }

    pub(crate) fn append_transaction(
        &mut self,
        agent: &AgentSecret,
        session: SessionID,
        changes: &[Change],
        privacy: Privacy<'_>,
        made_at: u64,
    ) -> Result<TransactionID> {
        let index = self.sessions.get(&session).map_or(0, SessionLog::len);
        let tx_id = TransactionID::new(session, index as u64);
        let encoded = Change::encode_all(changes)?;
        let tx = match privacy {
            Privacy::Trusting => Transaction::Trusting {
                made_at,
                changes: encoded.into(),
            },
            Privacy::Private(key) => {
                let material = tx_nonce_material(&self.id, &tx_id);
                let encrypted = self.crypto.encrypt(&key.secret, &encoded, &material)?;
                Transaction::Private {
                    made_at,
                    key_id: key.id,
                    encrypted_changes: encrypted.into(),
                }
            }
        };

        let txs = vec![tx];
        let log = self.sessions.entry(session).or_default();
        let batch = log.prepare(self.crypto.as_ref(), &txs)?;
        let head = batch.head().copied().unwrap_or_else(|| log.head());
        let msg = signed_message(&self.id, &session, log.len() + 1, &head);
        let signature = self.crypto.sign(&agent.signer, &msg);
        log.extend(txs, batch, Some(signature));

        debug!(co_value = %self.id, session = %session, index = tx_id.index, "made transaction");
        Ok(tx_id)
    }

    /// Append transactions received from elsewhere.
    ///
    /// `after` must equal our current length of the session. With a
    /// signature, it must verify against the session agent or nothing is
    /// appended.
    pub fn try_add_transactions(
        &mut self,
        session: SessionID,
        after: usize,
        txs: Vec<Transaction>,
        signature: Option<Signature>,
    ) -> Result<()> {
        let ours = self.sessions.get(&session).map_or(0, SessionLog::len);
        if after != ours {
            return Err(CoreError::InvalidAssumption {
                session,
                ours,
                theirs: after,
            });
        }

        let log = self.sessions.entry(session).or_default();
        let result = log.verify_and_extend(self.crypto.as_ref(), &self.id, &session, txs, signature);
        if log.is_empty() {
            self.sessions.remove(&session);
        }
        result
    }

    /// Trusted transactions in total order: (made_at, session, index).
    pub fn verified_sorted_transactions(&self) -> Vec<(TransactionID, &Transaction)> {
        let mut out: Vec<_> = self
            .sessions
            .iter()
            .flat_map(|(session, log)| {
                log.signed_transactions()
                    .iter()
                    .enumerate()
                    .map(move |(i, tx)| (TransactionID::new(*session, i as u64), tx))
            })
            .collect();
        out.sort_by(|a, b| (a.1.made_at(), a.0).cmp(&(b.1.made_at(), b.0)));
        out
    }

    /// Decode a transaction's changes, decrypting with `key` if private.
    pub fn decrypt_transaction(
        &self,
        tx_id: &TransactionID,
        tx: &Transaction,
        key: Option<&KeySecret>,
    ) -> Result<Vec<Change>> {
        match tx {
            Transaction::Trusting { changes, .. } => Change::decode_all(changes),
            Transaction::Private {
                key_id,
                encrypted_changes,
                ..
            } => {
                let key = key.ok_or_else(|| {
                    CoreError::Unauthorized(format!("no read key {key_id} for {}", self.id))
                })?;
                let material = tx_nonce_material(&self.id, tx_id);
                let plain = self.crypto.decrypt(key, encrypted_changes, &material)?;
                Change::decode_all(&plain)
            }
        }
    }

    /// Verified transactions in order, decoded. Transactions whose key
    /// `key_for` cannot provide, or that fail to decode, are skipped.
    pub fn decrypted_transactions<F>(&self, key_for: F) -> Vec<DecryptedTransaction>
    where
        F: Fn(&KeyID) -> Option<KeySecret>,
    {
        self.verified_sorted_transactions()
            .into_iter()
            .filter_map(|(tx_id, tx)| {
                let key = tx.key_id().and_then(|k| key_for(&k));
                match self.decrypt_transaction(&tx_id, tx, key.as_ref()) {
                    Ok(changes) => Some(DecryptedTransaction {
                        tx_id,
                        made_at: tx.made_at(),
                        changes,
                        private: tx.is_private(),
                    }),
                    Err(e) => {
                        debug!(co_value = %self.id, ?tx_id, error = %e, "skipping transaction");
                        None
                    }
                }
            })
            .collect()
    }

    pub fn known_state(&self) -> KnownState {
        KnownState {
            id: self.id,
            header: true,
            sessions: self.sessions.iter().map(|(s, log)| (*s, log.len())).collect(),
        }
    }

    /// Content a party with `known` lacks, split at signature checkpoints.
    ///
    /// Only signed transactions are ever sent. Returns nothing when the other
    /// party is up to date.
    pub fn new_content_since(&self, known: Option<&KnownState>) -> Vec<NewContentPiece> {
        let send_header = known.map_or(true, |k| !k.header);

        let per_session: Vec<_> = self
            .sessions
            .iter()
            .filter_map(|(session, log)| {
                let theirs = known.map_or(0, |k| k.session_len(session));
                let segments = log.signed_segments(theirs);
                (!segments.is_empty()).then_some((session, log, segments))
            })
            .collect();

        let piece_count = per_session.iter().map(|(_, _, s)| s.len()).max().unwrap_or(0);
        if piece_count == 0 && !send_header {
            return Vec::new();
        }

        (0..piece_count.max(1))
            .map(|i| NewContentPiece {
                id: self.id,
                header: (i == 0 && send_header).then(|| self.header.clone()),
                priority: self.priority(),
                new: per_session
                    .iter()
                    .filter_map(|(session, log, segments)| {
                        let &(start, end, sig) = segments.get(i)?;
                        Some((
                            **session,
                            SessionNewContent {
                                after: start,
                                new_transactions: log.transactions()[start..end].to_vec(),
                                last_signature: sig,
                            },
                        ))
                    })
                    .collect(),
            })
            .collect()
    }

    /// CoValues that must be present before this one can be interpreted:
    /// the owning group, and for groups and accounts the member accounts.
    pub fn dependencies(&self) -> Vec<CoID> {
        let mut deps = Vec::new();
        if let Some(group) = self.header.owner_group() {
            deps.push(group);
        }
        if self.header.content_type.is_group_like() {
            for (_, tx) in self.verified_sorted_transactions() {
                let Transaction::Trusting { changes, .. } = tx else {
                    continue;
                };
                let Ok(changes) = Change::decode_all(changes) else {
                    continue;
                };
                for change in changes {
                    if let Change::MapSet { key, .. } = change {
                        if let Ok(id) = key.parse::<CoID>() {
                            if id != self.id && !deps.contains(&id) {
                                deps.push(id);
                            }
                        }
                    }
                }
            }
        }
        deps
    }
}
