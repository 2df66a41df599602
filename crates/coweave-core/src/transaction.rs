//! Transactions and the changes they carry.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::canonical::{from_cbor_bytes, to_canonical_bytes};
use crate::crypto::{KeyID, ReadKey};
use crate::error::Result;
use crate::types::{CoID, OpID, TransactionID};

/// A single mutation. Each content type interprets its own kinds and ignores
/// the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    MapSet {
        key: String,
        value: serde_json::Value,
    },
    MapDel {
        key: String,
    },
    /// Insert after `after`, or at the start when `None`.
    ListApp {
        value: serde_json::Value,
        after: Option<OpID>,
    },
    /// Insert before `before`, or at the end when `None`.
    ListPre {
        value: serde_json::Value,
        before: Option<OpID>,
    },
    ListDel {
        insertion: OpID,
    },
    StreamItem {
        value: serde_json::Value,
    },
    BinaryStart {
        mime_type: String,
        file_name: Option<String>,
        total_size: Option<u64>,
    },
    BinaryChunk {
        chunk: Bytes,
    },
    BinaryEnd,
}

impl Change {
    pub fn encode_all(changes: &[Change]) -> Result<Vec<u8>> {
        to_canonical_bytes(changes)
    }

    pub fn decode_all(bytes: &[u8]) -> Result<Vec<Change>> {
        from_cbor_bytes(bytes)
    }
}

/// A transaction as stored in a session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transaction {
    /// Changes stored in the clear.
    Trusting { made_at: u64, changes: Bytes },
    /// Changes encrypted under the read key `key_id`.
    Private {
        made_at: u64,
        key_id: KeyID,
        encrypted_changes: Bytes,
    },
}

impl Transaction {
    pub fn made_at(&self) -> u64 {
        match self {
            Transaction::Trusting { made_at, .. } | Transaction::Private { made_at, .. } => *made_at,
        }
    }

    pub fn key_id(&self) -> Option<KeyID> {
        match self {
            Transaction::Private { key_id, .. } => Some(*key_id),
            Transaction::Trusting { .. } => None,
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Transaction::Private { .. })
    }

    /// Bytes fed into the session hash chain.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        to_canonical_bytes(self)
    }
}

/// Whether a new transaction is encrypted.
#[derive(Debug, Clone, Copy)]
pub enum Privacy<'a> {
    Trusting,
    Private(&'a ReadKey),
}

/// A verified transaction with its changes decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedTransaction {
    pub tx_id: TransactionID,
    pub made_at: u64,
    pub changes: Vec<Change>,
    pub private: bool,
}

impl DecryptedTransaction {
    pub fn op_id(&self, change: usize) -> OpID {
        OpID::new(self.tx_id, change as u32)
    }
}

/// Nonce material for the private transaction at `tx_id` of `co_id`.
pub fn tx_nonce_material(co_id: &CoID, tx_id: &TransactionID) -> Vec<u8> {
    let mut material = Vec::with_capacity(160);
    material.extend_from_slice(co_id.as_bytes());
    material.extend_from_slice(tx_id.session.to_string().as_bytes());
    material.extend_from_slice(&tx_id.index.to_be_bytes());
    material
}
