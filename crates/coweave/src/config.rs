//! Node configuration.

use std::time::Duration;

use coweave_sync::SyncConfig;

/// Configuration for a [`LocalNode`](crate::LocalNode).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// How long a load waits for peers before reporting the CoValue as
    /// unavailable.
    pub load_timeout: Duration,
    /// Sync configuration.
    pub sync: SyncConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(10),
            sync: SyncConfig::default(),
        }
    }
}
