//! CoStream: per-session append-only item feeds.

use std::collections::BTreeMap;

use crate::crypto::CryptoProvider;
use crate::header::account_id_of;
use crate::transaction::{Change, DecryptedTransaction};
use crate::types::{CoID, SessionID, TransactionID};

#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub tx_id: TransactionID,
    pub made_at: u64,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoStream {
    items: BTreeMap<SessionID, Vec<StreamItem>>,
}

impl CoStream {
    pub fn from_transactions(txs: &[DecryptedTransaction]) -> Self {
        let mut items: BTreeMap<SessionID, Vec<StreamItem>> = BTreeMap::new();
        for tx in txs {
            for change in &tx.changes {
                if let Change::StreamItem { value } = change {
                    items.entry(tx.tx_id.session).or_default().push(StreamItem {
                        tx_id: tx.tx_id,
                        made_at: tx.made_at,
                        value: value.clone(),
                    });
                }
            }
        }
        // Within a session, log order wins over timestamps.
        for session_items in items.values_mut() {
            session_items.sort_by_key(|item| item.tx_id.index);
        }
        Self { items }
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionID> {
        self.items.keys()
    }

    pub fn items_by_session(&self, session: &SessionID) -> &[StreamItem] {
        self.items.get(session).map_or(&[], Vec::as_slice)
    }

    /// Items grouped by the account of each session's agent, in time order.
    pub fn items_by_account(&self, crypto: &dyn CryptoProvider) -> BTreeMap<CoID, Vec<&StreamItem>> {
        let mut out: BTreeMap<CoID, Vec<&StreamItem>> = BTreeMap::new();
        for (session, items) in &self.items {
            let Ok(account) = account_id_of(&session.agent, crypto) else {
                continue;
            };
            out.entry(account).or_default().extend(items.iter());
        }
        for items in out.values_mut() {
            items.sort_by_key(|item| (item.made_at, item.tx_id));
        }
        out
    }

    pub fn last_item_by_account(
        &self,
        account: &CoID,
        crypto: &dyn CryptoProvider,
    ) -> Option<&StreamItem> {
        self.items_by_account(crypto).remove(account)?.pop()
    }

    pub fn len(&self) -> usize {
        self.items.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
