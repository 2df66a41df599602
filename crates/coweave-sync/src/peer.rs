//! Peers: ordered bidirectional message links.
//!
//! A [`Peer`] is the local handle on a link to one remote party: a channel
//! of messages coming from it and a channel for messages going to it. Links
//! are either in-memory pairs or framed byte streams.

use std::fmt;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::messages::{decode_frame, encode_frame, SyncMessage};

/// Name of a peer, unique within one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerID(pub String);

impl fmt::Display for PeerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerID {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerID {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What the remote party is to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// Upstream node: we load from it and push everything to it.
    Server,
    /// Downstream node: we answer it and push what it showed interest in.
    Client,
    /// Local persistence speaking the sync protocol.
    Storage,
}

impl PeerRole {
    /// Whether we load from and push everything to peers of this role.
    pub fn is_upstream(self) -> bool {
        matches!(self, PeerRole::Server | PeerRole::Storage)
    }
}

/// Local handle on a link to a remote peer.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerID,
    pub role: PeerRole,
    pub incoming: mpsc::Receiver<SyncMessage>,
    pub outgoing: mpsc::Sender<SyncMessage>,
}

/// Create an in-memory link between two parties.
///
/// Each side is described by its name and the role it plays for the
/// other. The first returned handle belongs to `a` (it points at `b`), the
/// second to `b`.
pub fn connected_pair(
    a: impl Into<PeerID>,
    a_role: PeerRole,
    b: impl Into<PeerID>,
    b_role: PeerRole,
    buffer: usize,
) -> (Peer, Peer) {
    let (a_to_b, from_a) = mpsc::channel(buffer);
    let (b_to_a, from_b) = mpsc::channel(buffer);
    (
        Peer {
            id: b.into(),
            role: b_role,
            incoming: from_b,
            outgoing: a_to_b,
        },
        Peer {
            id: a.into(),
            role: a_role,
            incoming: from_a,
            outgoing: b_to_a,
        },
    )
}

/// Wrap a byte stream as a peer, framing messages as length-prefixed CBOR.
///
/// Spawns a reader and a writer task; both stop when the stream closes or
/// the handle is dropped.
pub fn framed<S>(id: impl Into<PeerID>, role: PeerRole, stream: S, buffer: usize) -> Peer
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = id.into();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (in_tx, in_rx) = mpsc::channel(buffer);
    let (out_tx, mut out_rx) = mpsc::channel::<SyncMessage>(buffer);

    let reader_id = id.clone();
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            loop {
                match decode_frame(&mut buf) {
                    Ok(Some(message)) => {
                        if in_tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %reader_id, error = %e, "dropping link after bad frame");
                        return;
                    }
                }
            }
            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!(peer = %reader_id, "stream closed");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(peer = %reader_id, error = %e, "read failed");
                    return;
                }
            }
        }
    });

    let writer_id = id.clone();
    tokio::spawn(async move {
        let mut buf = BytesMut::new();
        while let Some(message) = out_rx.recv().await {
            if let Err(e) = encode_frame(&message, &mut buf) {
                warn!(peer = %writer_id, error = %e, "cannot encode message");
                continue;
            }
            if let Err(e) = writer.write_all(&buf).await {
                warn!(peer = %writer_id, error = %e, "write failed");
                return;
            }
            buf.clear();
        }
        let _ = writer.shutdown().await;
    });

    Peer {
        id,
        role,
        incoming: in_rx,
        outgoing: out_tx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coweave_core::{CoID, KnownState};

    #[tokio::test]
    async fn test_connected_pair_delivers_both_ways() {
        let (mut to_server, mut to_client) =
            connected_pair("client", PeerRole::Client, "server", PeerRole::Server, 8);
        assert_eq!(to_server.id, PeerID::from("server"));
        assert_eq!(to_server.role, PeerRole::Server);
        assert_eq!(to_client.role, PeerRole::Client);

        let id = CoID::from_bytes([1; 32]);
        to_server
            .outgoing
            .send(SyncMessage::Load {
                known: KnownState::empty(id),
            })
            .await
            .unwrap();
        assert_eq!(to_client.incoming.recv().await.unwrap().id(), id);

        to_client.outgoing.send(SyncMessage::Done { id }).await.unwrap();
        assert!(matches!(
            to_server.incoming.recv().await,
            Some(SyncMessage::Done { .. })
        ));
    }

    #[tokio::test]
    async fn test_framed_peers_over_duplex() {
        let (left, right) = tokio::io::duplex(64);
        let mut a = framed("b", PeerRole::Server, left, 8);
        let mut b = framed("a", PeerRole::Client, right, 8);

        let id = CoID::from_bytes([2; 32]);
        for _ in 0..3 {
            a.outgoing
                .send(SyncMessage::known(KnownState::empty(id)))
                .await
                .unwrap();
        }
        for _ in 0..3 {
            assert_eq!(b.incoming.recv().await.unwrap().action(), "known");
        }

        b.outgoing.send(SyncMessage::Done { id }).await.unwrap();
        assert_eq!(a.incoming.recv().await.unwrap(), SyncMessage::Done { id });
    }

    #[test]
    fn test_upstream_roles() {
        assert!(PeerRole::Server.is_upstream());
        assert!(PeerRole::Storage.is_upstream());
        assert!(!PeerRole::Client.is_upstream());
    }
}
