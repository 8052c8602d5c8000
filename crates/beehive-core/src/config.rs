//! Configuration for Beehive
//!
//! TigerStyle: Explicit defaults, validation, reasonable limits.
//!
//! One [`HiveConfig`] is handed to every constructor of a hive. There are no
//! process-wide settings.

use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration of a hive
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HiveConfig {
    /// Node identity and channels
    #[serde(default)]
    pub node: NodeConfig,

    /// Consensus configuration
    #[serde(default)]
    pub raft: RaftConfig,

    /// Transport and batching configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Dispatch and bee configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl HiveConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;
        self.raft.validate()?;
        self.transport.validate()?;
        self.runtime.validate()?;
        Ok(())
    }

    /// Configuration with fast ticks, short timeouts and in-memory raft state
    pub fn for_testing(addr: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                addr: addr.into(),
                ..NodeConfig::default()
            },
            raft: RaftConfig {
                tick_ms: 10,
                election_ticks: 5,
                heartbeat_ticks: 1,
                barrier_timeout_ticks: 500,
                snapshot_entries_count: 64,
                storage: RaftStorageKind::Memory,
                registry_backoff_ms: 5,
            },
            transport: TransportConfig {
                connection_timeout_ms: 1000,
                backoff_base_ms: 2,
                backoff_max_ms: 50,
                retry_count_max: 3,
                ..TransportConfig::default()
            },
            runtime: RuntimeConfig {
                dispatch_backoff_ms: 5,
                qee_stop_wait_ms: 50,
                replication_query_timeout_ms: 1000,
                ..RuntimeConfig::default()
            },
        }
    }

    /// Path of the persisted hive metadata file
    pub fn meta_path(&self) -> PathBuf {
        self.node.state_path.join("meta.json")
    }

    /// Path of the persisted raft state file
    pub fn raft_path(&self) -> PathBuf {
        self.node.state_path.join("raft.json")
    }
}

// =============================================================================
// Node
// =============================================================================

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address this hive listens on and advertises (default: localhost:7767)
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Addresses of existing hives to join; empty bootstraps a new cluster
    #[serde(default)]
    pub peer_addrs: Vec<String>,

    /// Directory for persisted metadata and raft state
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Capacity of the data channel
    #[serde(default = "default_data_channel_size")]
    pub data_channel_size: usize,

    /// Capacity of the control command channel
    #[serde(default = "default_cmd_channel_size")]
    pub cmd_channel_size: usize,
}

fn default_addr() -> String {
    HIVE_ADDR_DEFAULT.to_string()
}

fn default_state_path() -> PathBuf {
    PathBuf::from(HIVE_STATE_PATH_DEFAULT)
}

fn default_data_channel_size() -> usize {
    HIVE_DATA_CHANNEL_SIZE_DEFAULT
}

fn default_cmd_channel_size() -> usize {
    HIVE_CMD_CHANNEL_SIZE_DEFAULT
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            peer_addrs: Vec::new(),
            state_path: default_state_path(),
            data_channel_size: default_data_channel_size(),
            cmd_channel_size: default_cmd_channel_size(),
        }
    }
}

impl NodeConfig {
    fn validate(&self) -> Result<()> {
        if !self.addr.contains(':') {
            return Err(Error::InvalidConfiguration {
                field: "node.addr".into(),
                reason: "must be in host:port format".into(),
            });
        }
        if self.peer_addrs.iter().any(|p| p == &self.addr) {
            return Err(Error::InvalidConfiguration {
                field: "node.peer_addrs".into(),
                reason: "must not contain the hive's own address".into(),
            });
        }
        if self.data_channel_size == 0 || self.cmd_channel_size == 0 {
            return Err(Error::InvalidConfiguration {
                field: "node.channel_size".into(),
                reason: "channels must have non-zero capacity".into(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Raft
// =============================================================================

/// Where the consensus log is persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftStorageKind {
    /// `{state_path}/raft.json`
    #[default]
    File,
    /// Lost on restart (for testing)
    Memory,
}

/// Consensus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Tick interval (milliseconds)
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Base election timeout in ticks
    #[serde(default = "default_election_ticks")]
    pub election_ticks: u64,

    /// Heartbeat interval in ticks
    #[serde(default = "default_heartbeat_ticks")]
    pub heartbeat_ticks: u64,

    /// Ticks a barrier may wait for commit
    #[serde(default = "default_barrier_timeout_ticks")]
    pub barrier_timeout_ticks: u64,

    /// Applied entries between snapshots
    #[serde(default = "default_snapshot_entries_count")]
    pub snapshot_entries_count: u64,

    /// Raft storage backend
    #[serde(default)]
    pub storage: RaftStorageKind,

    /// Backoff between registry proposal retries (milliseconds)
    #[serde(default = "default_registry_backoff_ms")]
    pub registry_backoff_ms: u64,
}

fn default_tick_ms() -> u64 {
    RAFT_TICK_MS_DEFAULT
}

fn default_election_ticks() -> u64 {
    RAFT_ELECTION_TICKS_DEFAULT
}

fn default_heartbeat_ticks() -> u64 {
    RAFT_HEARTBEAT_TICKS_DEFAULT
}

fn default_barrier_timeout_ticks() -> u64 {
    RAFT_BARRIER_TIMEOUT_TICKS_DEFAULT
}

fn default_snapshot_entries_count() -> u64 {
    RAFT_SNAPSHOT_ENTRIES_COUNT_DEFAULT
}

fn default_registry_backoff_ms() -> u64 {
    BACKOFF_BASE_MS_DEFAULT
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            election_ticks: default_election_ticks(),
            heartbeat_ticks: default_heartbeat_ticks(),
            barrier_timeout_ticks: default_barrier_timeout_ticks(),
            snapshot_entries_count: default_snapshot_entries_count(),
            storage: RaftStorageKind::default(),
            registry_backoff_ms: default_registry_backoff_ms(),
        }
    }
}

impl RaftConfig {
    fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 {
            return Err(Error::InvalidConfiguration {
                field: "raft.tick_ms".into(),
                reason: "must be positive".into(),
            });
        }
        if self.heartbeat_ticks == 0 || self.election_ticks <= self.heartbeat_ticks {
            return Err(Error::InvalidConfiguration {
                field: "raft.election_ticks".into(),
                reason: "must be greater than heartbeat_ticks".into(),
            });
        }
        if self.snapshot_entries_count == 0 {
            return Err(Error::InvalidConfiguration {
                field: "raft.snapshot_entries_count".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    /// Barrier timeout in milliseconds
    pub fn barrier_timeout_ms(&self) -> u64 {
        self.barrier_timeout_ticks * self.tick_ms
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Transport and batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Maximum items per outbound batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum pooled connections per remote host
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,

    /// Connect and read timeout (milliseconds)
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Data batchers per remote host
    #[serde(default = "default_batchers_per_host")]
    pub batchers_per_host: usize,

    /// Batch flush timeout (milliseconds)
    #[serde(default = "default_batcher_timeout_ms")]
    pub batcher_timeout_ms: u64,

    /// Base retry backoff (milliseconds)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Retry backoff cap (milliseconds)
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Send attempts before an item fails
    #[serde(default = "default_retry_count_max")]
    pub retry_count_max: u32,

    /// Maximum wire frame size (bytes)
    #[serde(default = "default_frame_size_bytes_max")]
    pub frame_size_bytes_max: usize,
}

fn default_batch_size() -> usize {
    BATCH_SIZE_COUNT_DEFAULT
}

fn default_max_connections_per_host() -> usize {
    CONNECTIONS_PER_HOST_COUNT_DEFAULT
}

fn default_connection_timeout_ms() -> u64 {
    CONNECTION_TIMEOUT_MS_DEFAULT
}

fn default_batchers_per_host() -> usize {
    BATCHERS_PER_HOST_COUNT_DEFAULT
}

fn default_batcher_timeout_ms() -> u64 {
    BATCHER_TIMEOUT_MS_DEFAULT
}

fn default_backoff_base_ms() -> u64 {
    BACKOFF_BASE_MS_DEFAULT
}

fn default_backoff_max_ms() -> u64 {
    BACKOFF_MAX_MS_DEFAULT
}

fn default_retry_count_max() -> u32 {
    RETRY_COUNT_MAX_DEFAULT
}

fn default_frame_size_bytes_max() -> usize {
    WIRE_FRAME_SIZE_BYTES_MAX
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_connections_per_host: default_max_connections_per_host(),
            connection_timeout_ms: default_connection_timeout_ms(),
            batchers_per_host: default_batchers_per_host(),
            batcher_timeout_ms: default_batcher_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            retry_count_max: default_retry_count_max(),
            frame_size_bytes_max: default_frame_size_bytes_max(),
        }
    }
}

impl TransportConfig {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfiguration {
                field: "transport.batch_size".into(),
                reason: "must be positive".into(),
            });
        }
        if self.max_connections_per_host == 0 || self.batchers_per_host == 0 {
            return Err(Error::InvalidConfiguration {
                field: "transport.max_connections_per_host".into(),
                reason: "connections and batchers per host must be positive".into(),
            });
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(Error::InvalidConfiguration {
                field: "transport.backoff_max_ms".into(),
                reason: "must not be less than backoff_base_ms".into(),
            });
        }
        if self.retry_count_max == 0 {
            return Err(Error::InvalidConfiguration {
                field: "transport.retry_count_max".into(),
                reason: "must allow at least one attempt".into(),
            });
        }
        if self.frame_size_bytes_max > WIRE_FRAME_SIZE_BYTES_MAX {
            return Err(Error::InvalidConfiguration {
                field: "transport.frame_size_bytes_max".into(),
                reason: format!(
                    "{} exceeds limit {}",
                    self.frame_size_bytes_max, WIRE_FRAME_SIZE_BYTES_MAX
                ),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// Dispatch engine and bee configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Depth of each bee inbox
    #[serde(default = "default_bee_inbox_depth")]
    pub bee_inbox_depth: usize,

    /// Depth of the pending mailbox while an assignment is in flight
    #[serde(default = "default_pending_mailbox_depth")]
    pub pending_mailbox_depth: usize,

    /// Retries of a retriable proposal error
    #[serde(default = "default_dispatch_retry_count_max")]
    pub dispatch_retry_count_max: u32,

    /// Backoff between dispatch retries (milliseconds)
    #[serde(default = "default_dispatch_backoff_ms")]
    pub dispatch_backoff_ms: u64,

    /// Attempts to stop a dispatch engine during shutdown
    #[serde(default = "default_qee_stop_retry_count")]
    pub qee_stop_retry_count: u32,

    /// Wait per stop attempt (milliseconds)
    #[serde(default = "default_qee_stop_wait_ms")]
    pub qee_stop_wait_ms: u64,

    /// Bounded wait of a replication query (milliseconds)
    #[serde(default = "default_replication_query_timeout_ms")]
    pub replication_query_timeout_ms: u64,

    /// Seed for the hive's RNG; unseeded uses entropy
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

fn default_bee_inbox_depth() -> usize {
    BEE_INBOX_DEPTH_DEFAULT
}

fn default_pending_mailbox_depth() -> usize {
    PENDING_MAILBOX_DEPTH_DEFAULT
}

fn default_dispatch_retry_count_max() -> u32 {
    DISPATCH_RETRY_COUNT_MAX_DEFAULT
}

fn default_dispatch_backoff_ms() -> u64 {
    DISPATCH_BACKOFF_MS_DEFAULT
}

fn default_qee_stop_retry_count() -> u32 {
    QEE_STOP_RETRY_COUNT_DEFAULT
}

fn default_qee_stop_wait_ms() -> u64 {
    QEE_STOP_WAIT_MS_DEFAULT
}

fn default_replication_query_timeout_ms() -> u64 {
    REPLICATION_QUERY_TIMEOUT_MS_DEFAULT
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bee_inbox_depth: default_bee_inbox_depth(),
            pending_mailbox_depth: default_pending_mailbox_depth(),
            dispatch_retry_count_max: default_dispatch_retry_count_max(),
            dispatch_backoff_ms: default_dispatch_backoff_ms(),
            qee_stop_retry_count: default_qee_stop_retry_count(),
            qee_stop_wait_ms: default_qee_stop_wait_ms(),
            replication_query_timeout_ms: default_replication_query_timeout_ms(),
            rng_seed: None,
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.bee_inbox_depth == 0 || self.pending_mailbox_depth == 0 {
            return Err(Error::InvalidConfiguration {
                field: "runtime.bee_inbox_depth".into(),
                reason: "inbox and pending mailbox depths must be positive".into(),
            });
        }
        if self.qee_stop_retry_count == 0 {
            return Err(Error::InvalidConfiguration {
                field: "runtime.qee_stop_retry_count".into(),
                reason: "must allow at least one attempt".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = HiveConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.node.addr, "localhost:7767");
        assert_eq!(config.raft.tick_ms, 100);
        assert_eq!(config.transport.max_connections_per_host, 32);
    }

    #[test]
    fn test_testing_config_is_valid() {
        let config = HiveConfig::for_testing("h1:1");
        assert!(config.validate().is_ok());
        assert_eq!(config.raft.storage, RaftStorageKind::Memory);
    }

    #[test]
    fn test_invalid_election_config() {
        let mut config = HiveConfig::default();
        config.raft.election_ticks = 1;
        config.raft.heartbeat_ticks = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_own_addr_in_peers_is_rejected() {
        let mut config = HiveConfig::for_testing("h1:1");
        config.node.peer_addrs = vec!["h1:1".into()];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: HiveConfig =
            serde_json::from_str(r#"{"node": {"addr": "10.0.0.1:9000"}}"#).unwrap();
        assert_eq!(config.node.addr, "10.0.0.1:9000");
        assert_eq!(config.node.cmd_channel_size, 128);
        assert_eq!(config.transport.batcher_timeout_ms, 1);
    }

    #[test]
    fn test_state_paths() {
        let mut config = HiveConfig::default();
        config.node.state_path = PathBuf::from("/var/lib/hive");
        assert_eq!(config.meta_path(), PathBuf::from("/var/lib/hive/meta.json"));
        assert_eq!(config.raft_path(), PathBuf::from("/var/lib/hive/raft.json"));
    }
}
