//! A node against a hand-driven peer speaking the sync protocol.

use std::time::Duration;

use serde_json::json;

use coweave::core::{
    Change, CoValueCore, CryptoProvider, KnownState, NewContentPiece, Privacy, SessionID,
    SoftwareCrypto,
};
use coweave::sync::{connected_pair, Peer, PeerID, PeerRole, SyncMessage};
use coweave::{CoValueContent, LocalNode};
use coweave_testkit::fixtures::{eventually, init_tracing, relay_server};
use coweave_testkit::generators::open_map;

/// A peer whose messages the test writes and reads itself.
struct RawPeer {
    link: Peer,
    core: CoValueCore,
}

impl RawPeer {
    /// Connect to `node` as a client holding a copy of `tag`'s map with
    /// `n` transactions of its own.
    fn connect(node: &LocalNode, tag: &str, n: usize) -> Self {
        let (to_raw, link) = connected_pair("node", PeerRole::Server, "raw", PeerRole::Client, 64);
        node.add_peer(to_raw).unwrap();

        let crypto = SoftwareCrypto;
        let agent = crypto.new_agent_secret();
        let session = SessionID::new(crypto.agent_id(&agent), 7);
        let mut core = open_map(tag);
        for i in 0..n {
            core.make_transaction(
                &agent,
                session,
                &[Change::MapSet {
                    key: "n".into(),
                    value: json!(i),
                }],
                Privacy::Trusting,
            )
            .unwrap();
        }
        Self { link, core }
    }

    async fn send(&self, message: SyncMessage) {
        self.link.outgoing.send(message).await.unwrap();
    }

    /// The next message matching `pred`, skipping others.
    async fn expect(&mut self, mut pred: impl FnMut(&SyncMessage) -> bool) -> SyncMessage {
        let wait = async {
            loop {
                let message = self.link.incoming.recv().await.unwrap();
                if pred(&message) {
                    return message;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("expected message did not arrive")
    }

    fn full_piece(&self) -> NewContentPiece {
        let mut pieces = self.core.new_content_since(None);
        assert_eq!(pieces.len(), 1);
        pieces.remove(0)
    }
}

fn map_len(node: &LocalNode, id: &coweave::CoID) -> usize {
    match node.content(id) {
        Ok(CoValueContent::Map(map)) => map.history("n").len(),
        _ => 0,
    }
}

#[tokio::test]
async fn test_stale_content_is_corrected_and_resend_converges() {
    init_tracing();
    let node = relay_server();
    let mut raw = RawPeer::connect(&node, "stale", 3);
    let id = raw.core.id();

    // Claim the node already has the first two transactions.
    let mut piece = raw.full_piece();
    let (_, content) = piece.new.iter_mut().next().unwrap();
    content.new_transactions.drain(..2);
    content.after = 2;
    raw.send(SyncMessage::Content { piece }).await;

    let correction = raw
        .expect(|m| matches!(m, SyncMessage::Known { is_correction: true, .. }))
        .await;
    let SyncMessage::Known { known, .. } = correction else {
        unreachable!()
    };
    assert!(known.header);
    assert!(known.sessions.is_empty());

    for piece in raw.core.new_content_since(Some(&known)) {
        raw.send(SyncMessage::Content { piece }).await;
    }
    assert!(
        eventually(Duration::from_secs(5), || {
            node.registry().known_state(&id) == Some(raw.core.known_state())
        })
        .await
    );
    assert_eq!(map_len(&node, &id), 3);
}

#[tokio::test]
async fn test_same_content_twice_is_ingested_once() {
    let node = relay_server();
    let raw = RawPeer::connect(&node, "twice", 4);
    let id = raw.core.id();
    let from = PeerID::from("raw");

    let piece = raw.full_piece();
    node.sync().handle_message(&from, SyncMessage::Content { piece: piece.clone() });
    let first = node.registry().known_state(&id).unwrap();
    node.sync().handle_message(&from, SyncMessage::Content { piece });

    assert_eq!(node.registry().known_state(&id).unwrap(), first);
    assert_eq!(map_len(&node, &id), 4);
}

#[tokio::test]
async fn test_tampered_signature_is_corrected_and_resend_converges() {
    let node = relay_server();
    let mut raw = RawPeer::connect(&node, "tampered", 2);
    let id = raw.core.id();

    let mut piece = raw.full_piece();
    for content in piece.new.values_mut() {
        content.last_signature.0[0] ^= 0xff;
    }
    raw.send(SyncMessage::Content { piece }).await;

    let correction = raw
        .expect(|m| matches!(m, SyncMessage::Known { is_correction: true, .. }))
        .await;
    let SyncMessage::Known { known, .. } = correction else {
        unreachable!()
    };
    assert!(known.header);
    assert!(known.sessions.is_empty());
    assert_eq!(map_len(&node, &id), 0);

    // Resending from what the node says it holds converges.
    for piece in raw.core.new_content_since(Some(&known)) {
        raw.send(SyncMessage::Content { piece }).await;
    }
    assert!(
        eventually(Duration::from_secs(5), || {
            node.registry().known_state(&id) == Some(raw.core.known_state())
        })
        .await
    );
    assert_eq!(map_len(&node, &id), 2);
}

#[tokio::test]
async fn test_load_is_answered_with_dependencies_first() {
    let owner = coweave_testkit::fixtures::account_node("owner");
    let group = owner.create_group().unwrap();
    let map = group.create_map().unwrap();
    map.set("k", 1).unwrap();

    let mut raw = RawPeer::connect(&owner, "unused", 0);
    raw.send(SyncMessage::Load {
        known: KnownState::empty(map.id()),
    })
    .await;

    let mut order = Vec::new();
    loop {
        let message = raw.expect(|m| matches!(m, SyncMessage::Known { .. })).await;
        let id = message.id();
        order.push(id);
        if id == map.id() {
            break;
        }
    }
    let group_at = order.iter().position(|id| *id == group.id()).unwrap();
    assert!(group_at < order.len() - 1);
    assert!(order.contains(&owner.account_id().unwrap()));
}

#[tokio::test]
async fn test_known_without_header_prompts_push() {
    let node = relay_server();
    let mut raw = RawPeer::connect(&node, "push", 0);

    let mut core = open_map("pushed");
    let crypto = SoftwareCrypto;
    let agent = crypto.new_agent_secret();
    let session = SessionID::new(crypto.agent_id(&agent), 1);
    core.make_transaction(&agent, session, &[Change::MapDel { key: "x".into() }], Privacy::Trusting)
        .unwrap();
    let id = core.id();
    node.registry().insert(core);

    raw.send(SyncMessage::known(KnownState::empty(id))).await;
    let message = raw.expect(|m| matches!(m, SyncMessage::Content { .. })).await;
    let SyncMessage::Content { piece } = message else {
        unreachable!()
    };
    assert_eq!(piece.id, id);
    assert!(piece.header.is_some());
    assert_eq!(piece.transaction_count(), 1);
}
