//! Session logs: one writer's hash-chained, signed, append-only log.
//!
//! Every transaction extends a Blake3 chain; a signature over the chain head
//! vouches for the whole prefix up to it. Only the signed prefix is trusted.
//! Whenever more than [`MAX_RECOMMENDED_TX_SIZE`] bytes were signed since the
//! previous checkpoint, the signature is kept as a checkpoint so content can
//! be shipped in verifiable pieces.

use std::collections::BTreeMap;

use crate::crypto::{CryptoProvider, Hash, Signature};
use crate::error::{CoreError, Result};
use crate::transaction::Transaction;
use crate::types::{CoID, SessionID};

/// Bytes of transactions after which a signature is kept as a checkpoint.
pub const MAX_RECOMMENDED_TX_SIZE: usize = 100 * 1024;

/// Message an agent signs to vouch for the first `len` transactions of a session.
pub fn signed_message(co_id: &CoID, session: &SessionID, len: usize, head: &Hash) -> Vec<u8> {
    let mut msg = Vec::with_capacity(256);
    msg.extend_from_slice(b"coweave-session-v0:");
    msg.extend_from_slice(co_id.as_bytes());
    msg.extend_from_slice(session.to_string().as_bytes());
    msg.extend_from_slice(&(len as u64).to_be_bytes());
    msg.extend_from_slice(head.as_bytes());
    msg
}

/// Chain hashes and encoded sizes for a batch about to be appended.
#[derive(Debug, Clone, Default)]
pub struct PreparedBatch {
    pub hashes: Vec<Hash>,
    pub sizes: Vec<usize>,
}

impl PreparedBatch {
    /// Chain head after the batch, if it is non-empty.
    pub fn head(&self) -> Option<&Hash> {
        self.hashes.last()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    transactions: Vec<Transaction>,
    hashes: Vec<Hash>,
    sizes: Vec<usize>,
    signed_len: usize,
    last_signature: Option<Signature>,
    /// Checkpoint signatures keyed by the index of the last covered transaction.
    signature_after: BTreeMap<usize, Signature>,
    bytes_since_checkpoint: usize,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Number of transactions covered by a verified signature.
    pub fn signed_len(&self) -> usize {
        self.signed_len
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// The trusted prefix.
    pub fn signed_transactions(&self) -> &[Transaction] {
        &self.transactions[..self.signed_len]
    }

    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }

    pub fn signature_after(&self) -> &BTreeMap<usize, Signature> {
        &self.signature_after
    }

    pub fn bytes_since_checkpoint(&self) -> usize {
        self.bytes_since_checkpoint
    }

    /// Chain head after the first `len` transactions.
    pub fn hash_at(&self, len: usize) -> Hash {
        if len == 0 {
            Hash::ZERO
        } else {
            self.hashes[len - 1]
        }
    }

    pub fn head(&self) -> Hash {
        self.hash_at(self.len())
    }

    /// Compute chain hashes for `txs` as if appended after the current head.
    pub fn prepare(&self, crypto: &dyn CryptoProvider, txs: &[Transaction]) -> Result<PreparedBatch> {
        let mut batch = PreparedBatch {
            hashes: Vec::with_capacity(txs.len()),
            sizes: Vec::with_capacity(txs.len()),
        };
        let mut prev = self.head();
        for tx in txs {
            let bytes = tx.canonical_bytes()?;
            prev = crypto.chain_hash(&prev, &bytes);
            batch.hashes.push(prev);
            batch.sizes.push(bytes.len());
        }
        Ok(batch)
    }

    /// Append a batch. With a signature the batch (and any unsigned
    /// transactions before it) join the trusted prefix; the caller must have
    /// verified it against the batch head.
    pub fn extend(
        &mut self,
        txs: Vec<Transaction>,
        batch: PreparedBatch,
        signature: Option<Signature>,
    ) {
        self.transactions.extend(txs);
        self.hashes.extend(batch.hashes);
        self.sizes.extend(batch.sizes);

        if let Some(signature) = signature {
            let newly_signed: usize = self.sizes[self.signed_len..].iter().sum();
            self.signed_len = self.transactions.len();
            self.last_signature = Some(signature);
            self.bytes_since_checkpoint += newly_signed;
            if self.bytes_since_checkpoint > MAX_RECOMMENDED_TX_SIZE {
                self.signature_after.insert(self.signed_len - 1, signature);
                self.bytes_since_checkpoint = 0;
            }
        }
    }

    /// Verify `signature` over the head that `batch` would produce and append.
    pub fn verify_and_extend(
        &mut self,
        crypto: &dyn CryptoProvider,
        co_id: &CoID,
        session: &SessionID,
        txs: Vec<Transaction>,
        signature: Option<Signature>,
    ) -> Result<()> {
        let batch = self.prepare(crypto, &txs)?;
        if let Some(signature) = &signature {
            let head = batch.head().copied().unwrap_or_else(|| self.head());
            let msg = signed_message(co_id, session, self.len() + txs.len(), &head);
            crypto
                .verify(&session.agent.signer, &msg, signature)
                .map_err(|e| CoreError::CryptoFailure(format!("{session}: {e}")))?;
        }
        self.extend(txs, batch, signature);
        Ok(())
    }

    /// Split the signed transactions from `from` onward at checkpoints.
    ///
    /// Each segment is `(start, end_exclusive, signature)`.
    pub fn signed_segments(&self, from: usize) -> Vec<(usize, usize, Signature)> {
        let mut segments = Vec::new();
        let Some(last) = self.last_signature else {
            return segments;
        };
        let mut start = from;
        for (&idx, sig) in self.signature_after.range(from..) {
            if idx + 1 >= self.signed_len {
                break;
            }
            segments.push((start, idx + 1, *sig));
            start = idx + 1;
        }
        if start < self.signed_len {
            segments.push((start, self.signed_len, last));
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AgentSecret, SoftwareCrypto};
    use bytes::Bytes;

    fn tx(n: u8, size: usize) -> Transaction {
        Transaction::Trusting {
            made_at: n as u64,
            changes: Bytes::from(vec![n; size]),
        }
    }

    fn setup() -> (SoftwareCrypto, AgentSecret, SessionID, CoID) {
        let crypto = SoftwareCrypto;
        let secret = crypto.agent_secret_from_seed(&[1; 32]);
        let session = SessionID::new(crypto.agent_id(&secret), 1);
        (crypto, secret, session, CoID::from_bytes([9; 32]))
    }

    fn sign_batch(
        crypto: &SoftwareCrypto,
        secret: &AgentSecret,
        log: &SessionLog,
        co_id: &CoID,
        session: &SessionID,
        txs: &[Transaction],
    ) -> Signature {
        let batch = log.prepare(crypto, txs).unwrap();
        let head = *batch.head().unwrap();
        crypto.sign(
            &secret.signer,
            &signed_message(co_id, session, log.len() + txs.len(), &head),
        )
    }

    #[test]
    fn test_signed_append() {
        let (crypto, secret, session, co_id) = setup();
        let mut log = SessionLog::new();
        let txs = vec![tx(1, 4), tx(2, 4)];
        let sig = sign_batch(&crypto, &secret, &log, &co_id, &session, &txs);

        log.verify_and_extend(&crypto, &co_id, &session, txs, Some(sig)).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.signed_len(), 2);
        assert_eq!(log.last_signature(), Some(&sig));
    }

    #[test]
    fn test_bad_signature_appends_nothing() {
        let (crypto, _, session, co_id) = setup();
        let other = crypto.agent_secret_from_seed(&[2; 32]);
        let mut log = SessionLog::new();
        let txs = vec![tx(1, 4)];
        let sig = sign_batch(&crypto, &other, &log, &co_id, &session, &txs);

        let err = log
            .verify_and_extend(&crypto, &co_id, &session, txs, Some(sig))
            .unwrap_err();
        assert!(err.is_crypto_failure());
        assert!(log.is_empty());
    }

    #[test]
    fn test_unsigned_tail_not_trusted_until_covered() {
        let (crypto, secret, session, co_id) = setup();
        let mut log = SessionLog::new();

        log.verify_and_extend(&crypto, &co_id, &session, vec![tx(1, 4)], None)
            .unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.signed_len(), 0);
        assert!(log.signed_transactions().is_empty());

        let more = vec![tx(2, 4)];
        let sig = sign_batch(&crypto, &secret, &log, &co_id, &session, &more);
        log.verify_and_extend(&crypto, &co_id, &session, more, Some(sig)).unwrap();
        assert_eq!(log.signed_len(), 2);
    }

    #[test]
    fn test_checkpoints_split_segments() {
        let (crypto, secret, session, co_id) = setup();
        let mut log = SessionLog::new();
        for i in 0..5u8 {
            let txs = vec![tx(i, MAX_RECOMMENDED_TX_SIZE / 2 + 10)];
            let sig = sign_batch(&crypto, &secret, &log, &co_id, &session, &txs);
            log.verify_and_extend(&crypto, &co_id, &session, txs, Some(sig)).unwrap();
        }
        // Checkpoint after every second transaction.
        assert_eq!(log.signature_after().keys().copied().collect::<Vec<_>>(), vec![1, 3]);

        let segments = log.signed_segments(0);
        let bounds: Vec<_> = segments.iter().map(|(s, e, _)| (*s, *e)).collect();
        assert_eq!(bounds, vec![(0, 2), (2, 4), (4, 5)]);

        let tail: Vec<_> = log.signed_segments(3).iter().map(|(s, e, _)| (*s, *e)).collect();
        assert_eq!(tail, vec![(3, 4), (4, 5)]);
    }
}
