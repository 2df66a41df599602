//! CoList: an ordered list built from anchored insertions.
//!
//! `app` inserts after an existing insertion (or at the start), `pre` inserts
//! before one (or at the end), and `del` tombstones an insertion. When
//! several insertions share an anchor, the newer one ends up closer to it;
//! equal timestamps fall back to transaction order.

use std::collections::HashMap;

use crate::transaction::{Change, DecryptedTransaction};
use crate::types::OpID;

#[derive(Debug, Clone, PartialEq)]
struct Node {
    value: serde_json::Value,
    deleted: bool,
}

enum Frame {
    Visit(OpID),
    Emit(OpID),
    After(Option<OpID>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoList {
    nodes: HashMap<OpID, Node>,
    /// Insertions anchored after a node (`None` = list start), oldest first.
    after: HashMap<Option<OpID>, Vec<OpID>>,
    /// Insertions anchored before a node (`None` = list end), oldest first.
    before: HashMap<Option<OpID>, Vec<OpID>>,
    order: Vec<OpID>,
}

impl CoList {
    pub fn from_transactions(txs: &[DecryptedTransaction]) -> Self {
        let mut list = Self::default();
        for tx in txs {
            for (i, change) in tx.changes.iter().enumerate() {
                let op = tx.op_id(i);
                match change {
                    Change::ListApp { value, after } => {
                        list.insert(op, value.clone());
                        list.after.entry(*after).or_default().push(op);
                    }
                    Change::ListPre { value, before } => {
                        list.insert(op, value.clone());
                        list.before.entry(*before).or_default().push(op);
                    }
                    Change::ListDel { insertion } => {
                        if let Some(node) = list.nodes.get_mut(insertion) {
                            node.deleted = true;
                        }
                    }
                    _ => {}
                }
            }
        }
        list.order = list.linearize();
        list
    }

    fn insert(&mut self, op: OpID, value: serde_json::Value) {
        self.nodes.insert(
            op,
            Node {
                value,
                deleted: false,
            },
        );
    }

    /// Depth-first walk, iterative so long chains don't exhaust the stack.
    fn linearize(&self) -> Vec<OpID> {
        let mut out = Vec::new();
        let mut stack = Vec::new();

        if let Some(tail) = self.before.get(&None) {
            stack.extend(tail.iter().rev().map(|op| Frame::Visit(*op)));
        }
        stack.push(Frame::After(None));

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Visit(op) => {
                    stack.push(Frame::After(Some(op)));
                    stack.push(Frame::Emit(op));
                    if let Some(children) = self.before.get(&Some(op)) {
                        stack.extend(children.iter().rev().map(|c| Frame::Visit(*c)));
                    }
                }
                Frame::Emit(op) => {
                    if self.nodes.get(&op).map_or(false, |n| !n.deleted) {
                        out.push(op);
                    }
                }
                Frame::After(anchor) => {
                    if let Some(children) = self.after.get(&anchor) {
                        // Pushed oldest first, so the newest is visited first.
                        stack.extend(children.iter().map(|c| Frame::Visit(*c)));
                    }
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&serde_json::Value> {
        let op = self.order.get(idx)?;
        self.nodes.get(op).map(|n| &n.value)
    }

    /// The insertion currently at `idx`.
    pub fn op_id_at(&self, idx: usize) -> Option<OpID> {
        self.order.get(idx).copied()
    }

    pub fn items(&self) -> Vec<&serde_json::Value> {
        self.order
            .iter()
            .filter_map(|op| self.nodes.get(op).map(|n| &n.value))
            .collect()
    }

    pub fn entries(&self) -> Vec<(OpID, &serde_json::Value)> {
        self.order
            .iter()
            .filter_map(|op| self.nodes.get(op).map(|n| (*op, &n.value)))
            .collect()
    }

    /// Change that appends `value` at the end.
    pub fn append_change(&self, value: serde_json::Value) -> Change {
        Change::ListPre {
            value,
            before: None,
        }
    }

    /// Change that prepends `value` at the start.
    pub fn prepend_change(&self, value: serde_json::Value) -> Change {
        Change::ListApp { value, after: None }
    }

    /// Change inserting `value` so it lands at `idx` (clamped to the end).
    pub fn insert_change(&self, idx: usize, value: serde_json::Value) -> Change {
        if idx == 0 {
            return self.prepend_change(value);
        }
        match self.op_id_at(idx - 1) {
            Some(prev) => Change::ListApp {
                value,
                after: Some(prev),
            },
            None => self.append_change(value),
        }
    }

    pub fn delete_change(&self, idx: usize) -> Option<Change> {
        Some(Change::ListDel {
            insertion: self.op_id_at(idx)?,
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.items().into_iter().cloned().collect())
    }
}
