//! Typed handles for collaborative values.
//!
//! Handles are cheap: they hold the node, the CoValue id and the privacy
//! mode new writes use. Reads always project the current content.

use std::fmt;

use bytes::Bytes;
use serde_json::Value;

use coweave_core::{
    BinaryChunks, BinaryCoStream, Change, CoID, CoList, CoMap, CoStream, CoValueContent, MapEdit,
    StreamItem, TransactionID,
};

use crate::error::{NodeError, Result};
use crate::node::{LocalNode, PrivacyMode};
use crate::subscription::Subscription;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident, $content:ty, $as:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            node: LocalNode,
            id: CoID,
            privacy: PrivacyMode,
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("id", &self.id)
                    .field("privacy", &self.privacy)
                    .finish()
            }
        }

        impl $name {
            pub(crate) fn new(node: LocalNode, id: CoID) -> Self {
                Self {
                    node,
                    id,
                    privacy: PrivacyMode::default(),
                }
            }

            pub fn id(&self) -> CoID {
                self.id
            }

            pub fn node(&self) -> &LocalNode {
                &self.node
            }

            /// The same handle writing with `privacy`.
            pub fn with_privacy(mut self, privacy: PrivacyMode) -> Self {
                self.privacy = privacy;
                self
            }

            /// The same handle writing in the clear.
            pub fn trusting(self) -> Self {
                self.with_privacy(PrivacyMode::Trusting)
            }

            /// Current content as this node may see it.
            pub fn content(&self) -> Result<$content> {
                match self.node.content(&self.id)? {
                    CoValueContent::$as(content) => Ok(content),
                    other => Err(NodeError::WrongContentType {
                        id: self.id,
                        expected: CoValueContent::$as(Default::default()).content_type(),
                        found: other.content_type(),
                    }),
                }
            }

            pub fn subscribe(&self) -> Subscription {
                self.node.subscribe(&self.id)
            }

            fn write(&self, changes: &[Change]) -> Result<TransactionID> {
                self.node.transact(&self.id, changes, self.privacy)
            }
        }
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// CoMap
// ─────────────────────────────────────────────────────────────────────────────

handle!(
    /// A last-writer-wins map.
    CoMapHandle,
    CoMap,
    Map
);

impl CoMapHandle {
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.content()?.get(key).cloned())
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<TransactionID> {
        self.write(&[Change::MapSet {
            key: key.to_string(),
            value: value.into(),
        }])
    }

    /// Set several keys in one transaction.
    pub fn set_all<'a>(&self, entries: impl IntoIterator<Item = (&'a str, Value)>) -> Result<TransactionID> {
        let changes: Vec<_> = entries
            .into_iter()
            .map(|(key, value)| Change::MapSet {
                key: key.to_string(),
                value,
            })
            .collect();
        self.write(&changes)
    }

    pub fn delete(&self, key: &str) -> Result<TransactionID> {
        self.write(&[Change::MapDel {
            key: key.to_string(),
        }])
    }

    /// Every edit of `key`, oldest first.
    pub fn history(&self, key: &str) -> Result<Vec<MapEdit>> {
        Ok(self.content()?.history(key).to_vec())
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(self.content()?.to_json())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CoList
// ─────────────────────────────────────────────────────────────────────────────

handle!(
    /// An ordered list that merges concurrent inserts.
    CoListHandle,
    CoList,
    List
);

impl CoListHandle {
    pub fn items(&self) -> Result<Vec<Value>> {
        Ok(self.content()?.items().into_iter().cloned().collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.content()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.content()?.is_empty())
    }

    pub fn get(&self, idx: usize) -> Result<Option<Value>> {
        Ok(self.content()?.get(idx).cloned())
    }

    pub fn append(&self, value: impl Into<Value>) -> Result<TransactionID> {
        let change = self.content()?.append_change(value.into());
        self.write(&[change])
    }

    pub fn prepend(&self, value: impl Into<Value>) -> Result<TransactionID> {
        let change = self.content()?.prepend_change(value.into());
        self.write(&[change])
    }

    /// Insert so that the value ends up at `idx`.
    pub fn insert(&self, idx: usize, value: impl Into<Value>) -> Result<TransactionID> {
        let list = self.content()?;
        if idx > list.len() {
            return Err(NodeError::InvalidOperation(format!(
                "insert at {idx} in list of {}",
                list.len()
            )));
        }
        let change = list.insert_change(idx, value.into());
        self.write(&[change])
    }

    pub fn delete(&self, idx: usize) -> Result<TransactionID> {
        let list = self.content()?;
        let change = list.delete_change(idx).ok_or_else(|| {
            NodeError::InvalidOperation(format!("delete at {idx} in list of {}", list.len()))
        })?;
        self.write(&[change])
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(self.content()?.to_json())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CoStream
// ─────────────────────────────────────────────────────────────────────────────

handle!(
    /// Per-session append-only item feeds.
    CoStreamHandle,
    CoStream,
    Stream
);

impl CoStreamHandle {
    pub fn push(&self, value: impl Into<Value>) -> Result<TransactionID> {
        self.write(&[Change::StreamItem {
            value: value.into(),
        }])
    }

    /// Items pushed from this node's session.
    pub fn my_items(&self) -> Result<Vec<StreamItem>> {
        Ok(self
            .content()?
            .items_by_session(&self.node.session())
            .to_vec())
    }

    /// The newest item from any session of `account`'s agent.
    pub fn last_item_by_account(&self, account: &CoID) -> Result<Option<StreamItem>> {
        Ok(self
            .content()?
            .last_item_by_account(account, self.node.crypto().as_ref())
            .cloned())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BinaryCoStream
// ─────────────────────────────────────────────────────────────────────────────

handle!(
    /// A chunked binary blob with a MIME type.
    BinaryStreamHandle,
    BinaryCoStream,
    BinaryStream
);

impl BinaryStreamHandle {
    pub fn start(
        &self,
        mime_type: &str,
        file_name: Option<&str>,
        total_size: Option<u64>,
    ) -> Result<TransactionID> {
        self.write(&[Change::BinaryStart {
            mime_type: mime_type.to_string(),
            file_name: file_name.map(str::to_string),
            total_size,
        }])
    }

    pub fn push_chunk(&self, chunk: impl Into<Bytes>) -> Result<TransactionID> {
        self.write(&[Change::BinaryChunk {
            chunk: chunk.into(),
        }])
    }

    pub fn end(&self) -> Result<TransactionID> {
        self.write(&[Change::BinaryEnd])
    }

    /// The blob, or `None` if it has not started (or not finished, unless
    /// `allow_unfinished`).
    pub fn chunks(&self, allow_unfinished: bool) -> Result<Option<BinaryChunks>> {
        Ok(self.content()?.binary_chunks(allow_unfinished).cloned())
    }

    /// Write a whole blob as start, chunks of `chunk_size` bytes, and end.
    pub fn write_all(
        &self,
        mime_type: &str,
        file_name: Option<&str>,
        data: &[u8],
        chunk_size: usize,
    ) -> Result<()> {
        if chunk_size == 0 {
            return Err(NodeError::InvalidOperation("chunk size must be positive".into()));
        }
        self.start(mime_type, file_name, Some(data.len() as u64))?;
        for chunk in data.chunks(chunk_size) {
            self.push_chunk(Bytes::copy_from_slice(chunk))?;
        }
        self.end()?;
        Ok(())
    }
}
