//! Test fixtures and helpers.
//!
//! Common setup for multi-node tests: nodes with accounts, a relay server
//! they sync through, and polling helpers for eventual convergence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coweave::{LocalNode, NodeConfig};
use coweave_core::{AgentSecret, CoID, CryptoProvider, SoftwareCrypto};
use coweave_sync::{connected_pair, PeerRole};

static NEXT_PEER: AtomicUsize = AtomicUsize::new(0);

/// The crypto provider every fixture uses.
pub fn crypto() -> Arc<dyn CryptoProvider> {
    Arc::new(SoftwareCrypto)
}

/// A 32-byte seed with `n` in the first byte.
pub fn seed(n: u8) -> [u8; 32] {
    let mut seed = [0u8; 32];
    seed[0] = n;
    seed
}

/// The same agent for the same `n`, across runs.
pub fn deterministic_agent(n: u8) -> AgentSecret {
    crypto().agent_secret_from_seed(&seed(n))
}

/// Node config with timeouts short enough for tests.
pub fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.load_timeout = Duration::from_secs(3);
    config.sync.forward_timeout = Duration::from_secs(2);
    config
}

/// A node with a fresh account named `name`.
pub fn account_node(name: &str) -> LocalNode {
    LocalNode::with_new_account(crypto(), test_config(), name, None)
        .unwrap_or_else(|e| panic!("creating account {name}: {e}"))
}

/// An anonymous node that relays between clients.
pub fn relay_server() -> LocalNode {
    LocalNode::anonymous(crypto(), test_config())
}

/// Link `client` to `server`, with `server` as the client's upstream.
pub fn connect(client: &LocalNode, server: &LocalNode) {
    let n = NEXT_PEER.fetch_add(1, Ordering::Relaxed);
    let (to_server, to_client) = connected_pair(
        format!("client-{n}"),
        PeerRole::Client,
        format!("server-{n}"),
        PeerRole::Server,
        client.config().sync.outgoing_buffer,
    );
    client
        .add_peer(to_server)
        .unwrap_or_else(|e| panic!("adding server peer: {e}"));
    server
        .add_peer(to_client)
        .unwrap_or_else(|e| panic!("adding client peer: {e}"));
}

/// Link `client` to `server` and wait until the server holds everything the
/// client had at that point.
pub async fn connect_and_sync(client: &LocalNode, server: &LocalNode) {
    connect(client, server);
    let ids: Vec<CoID> = client
        .registry()
        .available()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    for id in ids {
        wait_synced(client, server, &id).await;
    }
}

/// Wait until `b` has everything `a` has of `id`.
pub async fn wait_synced(a: &LocalNode, b: &LocalNode, id: &CoID) {
    let reached = eventually(Duration::from_secs(5), || {
        match (a.registry().known_state(id), b.registry().known_state(id)) {
            (Some(ours), Some(theirs)) => theirs.covers(&ours),
            _ => false,
        }
    })
    .await;
    assert!(reached, "{id} did not sync");
}

/// Poll `check` until it holds or `timeout` passes. Returns whether it held.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Log to the test writer. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .try_init();
}
