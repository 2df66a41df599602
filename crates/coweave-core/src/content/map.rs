//! CoMap: last-writer-wins key/value map with full edit history.

use std::collections::BTreeMap;

use crate::crypto::AgentID;
use crate::transaction::{Change, DecryptedTransaction};
use crate::types::TransactionID;

/// One edit of a key. `value` is `None` for deletions.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEdit {
    pub tx_id: TransactionID,
    pub made_at: u64,
    pub value: Option<serde_json::Value>,
}

impl MapEdit {
    pub fn author(&self) -> AgentID {
        self.tx_id.session.agent
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoMap {
    edits: BTreeMap<String, Vec<MapEdit>>,
}

impl CoMap {
    /// Project transactions, which must already be in total order.
    pub fn from_transactions(txs: &[DecryptedTransaction]) -> Self {
        let mut map = Self::default();
        for tx in txs {
            map.apply(tx);
        }
        map
    }

    /// Apply one more transaction on top of the current state.
    pub fn apply(&mut self, tx: &DecryptedTransaction) {
        for change in &tx.changes {
            let (key, value) = match change {
                Change::MapSet { key, value } => (key, Some(value.clone())),
                Change::MapDel { key } => (key, None),
                _ => continue,
            };
            self.edits.entry(key.clone()).or_default().push(MapEdit {
                tx_id: tx.tx_id,
                made_at: tx.made_at,
                value,
            });
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.last_edit(key)?.value.as_ref()
    }

    /// Value of `key` as of `time` (inclusive).
    pub fn get_at(&self, key: &str, time: u64) -> Option<&serde_json::Value> {
        self.last_edit_at(key, time)?.value.as_ref()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Keys with a current (non-deleted) value.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.edits
            .iter()
            .filter(|(_, edits)| edits.last().map_or(false, |e| e.value.is_some()))
            .map(|(k, _)| k.as_str())
    }

    pub fn entries(&self) -> BTreeMap<&str, &serde_json::Value> {
        self.edits
            .iter()
            .filter_map(|(k, edits)| Some((k.as_str(), edits.last()?.value.as_ref()?)))
            .collect()
    }

    /// Every edit of `key`, oldest first.
    pub fn history(&self, key: &str) -> &[MapEdit] {
        self.edits.get(key).map_or(&[], Vec::as_slice)
    }

    pub fn last_edit(&self, key: &str) -> Option<&MapEdit> {
        self.edits.get(key)?.last()
    }

    pub fn last_edit_at(&self, key: &str, time: u64) -> Option<&MapEdit> {
        self.edits.get(key)?.iter().rev().find(|e| e.made_at <= time)
    }

    /// Every key ever written, deleted ones included.
    pub fn all_keys(&self) -> impl Iterator<Item = &str> {
        self.edits.keys().map(String::as_str)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.entries()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::test_support::{agent, tx};
    use serde_json::json;

    #[test]
    fn test_last_writer_wins() {
        let a = agent(1);
        let b = agent(2);
        let map = CoMap::from_transactions(&[
            tx(a, 0, 10, vec![Change::MapSet { key: "k".into(), value: json!(1) }]),
            tx(b, 0, 20, vec![Change::MapSet { key: "k".into(), value: json!(2) }]),
        ]);
        assert_eq!(map.get("k"), Some(&json!(2)));
        assert_eq!(map.last_edit("k").unwrap().author(), b.agent);
        assert_eq!(map.history("k").len(), 2);
        assert_eq!(map.get_at("k", 15), Some(&json!(1)));
        assert_eq!(map.get_at("k", 5), None);
    }

    #[test]
    fn test_delete_hides_key() {
        let a = agent(1);
        let map = CoMap::from_transactions(&[
            tx(a, 0, 10, vec![
                Change::MapSet { key: "k".into(), value: json!("v") },
                Change::MapSet { key: "other".into(), value: json!(true) },
            ]),
            tx(a, 1, 11, vec![Change::MapDel { key: "k".into() }]),
        ]);
        assert_eq!(map.get("k"), None);
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["other"]);
        assert_eq!(map.all_keys().count(), 2);
        assert_eq!(map.to_json(), json!({ "other": true }));
    }

    #[test]
    fn test_ignores_foreign_changes() {
        let a = agent(1);
        let map = CoMap::from_transactions(&[tx(a, 0, 10, vec![Change::StreamItem { value: json!(1) }])]);
        assert_eq!(map.entries().len(), 0);
    }
}
