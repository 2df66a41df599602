//! Content-type interpreters.
//!
//! Each interpreter is a pure projection over verified, decrypted
//! transactions in total order. Nothing here is persisted; state is
//! recomputed from the log.

pub mod binary;
pub mod list;
pub mod map;
pub mod stream;

pub use binary::{BinaryChunks, BinaryCoStream};
pub use list::CoList;
pub use map::{CoMap, MapEdit};
pub use stream::{CoStream, StreamItem};

use crate::header::ContentType;
use crate::transaction::DecryptedTransaction;

/// Projected state of a CoValue.
#[derive(Debug, Clone, PartialEq)]
pub enum CoValueContent {
    Map(CoMap),
    List(CoList),
    Stream(CoStream),
    BinaryStream(BinaryCoStream),
    Group(CoMap),
    Account(CoMap),
}

impl CoValueContent {
    pub fn project(content_type: ContentType, txs: &[DecryptedTransaction]) -> Self {
        match content_type {
            ContentType::Map => CoValueContent::Map(CoMap::from_transactions(txs)),
            ContentType::List => CoValueContent::List(CoList::from_transactions(txs)),
            ContentType::Stream => CoValueContent::Stream(CoStream::from_transactions(txs)),
            ContentType::BinaryStream => {
                CoValueContent::BinaryStream(BinaryCoStream::from_transactions(txs))
            }
            ContentType::Group => CoValueContent::Group(CoMap::from_transactions(txs)),
            ContentType::Account => CoValueContent::Account(CoMap::from_transactions(txs)),
        }
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            CoValueContent::Map(_) => ContentType::Map,
            CoValueContent::List(_) => ContentType::List,
            CoValueContent::Stream(_) => ContentType::Stream,
            CoValueContent::BinaryStream(_) => ContentType::BinaryStream,
            CoValueContent::Group(_) => ContentType::Group,
            CoValueContent::Account(_) => ContentType::Account,
        }
    }

    /// The map view for maps, groups and accounts.
    pub fn as_map(&self) -> Option<&CoMap> {
        match self {
            CoValueContent::Map(m) | CoValueContent::Group(m) | CoValueContent::Account(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&CoList> {
        match self {
            CoValueContent::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&CoStream> {
        match self {
            CoValueContent::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&BinaryCoStream> {
        match self {
            CoValueContent::BinaryStream(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::crypto::{CryptoProvider, SoftwareCrypto};
    use crate::transaction::{Change, DecryptedTransaction};
    use crate::types::{SessionID, TransactionID};

    /// Deterministic session for agent `n`.
    pub fn agent(n: u8) -> SessionID {
        let crypto = SoftwareCrypto;
        SessionID::new(crypto.agent_id(&crypto.agent_secret_from_seed(&[n; 32])), 0)
    }

    pub fn tx(session: SessionID, index: u64, made_at: u64, changes: Vec<Change>) -> DecryptedTransaction {
        DecryptedTransaction {
            tx_id: TransactionID::new(session, index),
            made_at,
            changes,
            private: false,
        }
    }
}
