//! Proptest generators for property-based testing.

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::Value;

use coweave_core::{
    AgentSecret, Change, CoValueCore, ContentType, CryptoProvider, Header, Privacy, Ruleset,
    SessionID, SoftwareCrypto,
};

/// A random agent.
pub fn agent() -> impl Strategy<Value = AgentSecret> {
    any::<[u8; 32]>().prop_map(|seed| SoftwareCrypto.agent_secret_from_seed(&seed))
}

/// A short map key.
pub fn map_key() -> impl Strategy<Value = String> {
    "[a-z]{1,4}".prop_map(String::from)
}

/// A JSON scalar value.
pub fn json_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,16}".prop_map(Value::from),
    ]
}

/// A map edit: a set or a delete.
pub fn map_change() -> impl Strategy<Value = Change> {
    prop_oneof![
        3 => (map_key(), json_scalar()).prop_map(|(key, value)| Change::MapSet { key, value }),
        1 => map_key().prop_map(|key| Change::MapDel { key }),
    ]
}

/// Transactions of one to four map edits each.
pub fn map_transactions(max: usize) -> impl Strategy<Value = Vec<Vec<Change>>> {
    prop::collection::vec(prop::collection::vec(map_change(), 1..=4), 1..=max)
}

/// Which of `writers` authors each transaction, by index.
pub fn authorship(writers: usize, len: usize) -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(0..writers, len)
}

/// An empty map CoValue that anyone may write, distinguished by `tag`.
pub fn open_map(tag: &str) -> CoValueCore {
    let crypto: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);
    let header = Header {
        content_type: ContentType::Map,
        ruleset: Ruleset::UnsafeAllowAll,
        meta: None,
        created_at: None,
        uniqueness: Some(tag.into()),
    };
    match CoValueCore::new(header, crypto) {
        Ok(core) => core,
        Err(e) => panic!("creating map: {e}"),
    }
}

/// Write `txs` into `core`, transaction `i` authored by `writers[authors[i]]`
/// in that writer's session.
pub fn write_all(
    core: &mut CoValueCore,
    writers: &[(AgentSecret, SessionID)],
    authors: &[usize],
    txs: &[Vec<Change>],
) {
    for (changes, &author) in txs.iter().zip(authors.iter().cycle()) {
        let (agent, session) = &writers[author % writers.len()];
        if let Err(e) = core.make_transaction(agent, *session, changes, Privacy::Trusting) {
            panic!("writing transaction: {e}");
        }
    }
}
