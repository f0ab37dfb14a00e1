// Raftstore configuration
// Tunables for the replicated engine, loaded as the `raftstore` config section

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the replicated storage engine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Leader heartbeat interval in milliseconds (default: 500ms)
    pub heartbeat_interval_ms: u64,

    /// Minimum election timeout in milliseconds (default: 1500ms).
    /// The maximum is twice this value.
    pub election_timeout_ms: u64,

    /// Number of applied log entries between snapshots
    pub snapshot_threshold: u64,

    /// Maximum entries per append request (default: 300)
    pub max_payload_entries: u64,

    /// Period of the membership reconciler in milliseconds (default: 1000ms)
    pub scheduler_heartbeat_interval_ms: u64,

    /// Peer and scheduler RPC timeout in milliseconds (default: 5000ms)
    pub rpc_timeout_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 500,
            election_timeout_ms: 1500,
            snapshot_threshold: 10000,
            max_payload_entries: 300,
            scheduler_heartbeat_interval_ms: 1000,
            rpc_timeout_ms: 5000,
        }
    }
}

impl RaftConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Convert to openraft Config
    pub fn to_openraft_config(&self) -> openraft::Config {
        openraft::Config {
            cluster_name: "tinykv".to_string(),
            election_timeout_min: self.election_timeout_ms,
            election_timeout_max: self.election_timeout_ms * 2,
            heartbeat_interval: self.heartbeat_interval_ms,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_payload_entries: self.max_payload_entries,
            ..Default::default()
        }
    }
}
