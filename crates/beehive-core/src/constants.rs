//! TigerStyle constants for Beehive
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Identifier Limits
// =============================================================================

/// Maximum length of an application name in bytes
pub const APP_NAME_LENGTH_BYTES_MAX: usize = 128;

/// Maximum length of a dictionary name in bytes
pub const DICT_NAME_LENGTH_BYTES_MAX: usize = 256;

/// Maximum size of a dictionary key in bytes (10 KB)
pub const DICT_KEY_SIZE_BYTES_MAX: usize = 10 * 1024;

/// Maximum size of a dictionary value in bytes (1 MB)
pub const DICT_VALUE_SIZE_BYTES_MAX: usize = 1024 * 1024;

/// Number of bits of a local bee id reserved for the creating hive
pub const BEE_LOCAL_ID_HIVE_BITS: u32 = 32;

/// Name of the built-in replication bookkeeping application
pub const REPLICATION_APP_NAME: &str = "beehive.replication";

// =============================================================================
// Node Defaults
// =============================================================================

/// Default listen address of a hive
pub const HIVE_ADDR_DEFAULT: &str = "localhost:7767";

/// Default directory for persisted hive state
pub const HIVE_STATE_PATH_DEFAULT: &str = "/tmp/beehive";

/// Default capacity of a hive's data channel
pub const HIVE_DATA_CHANNEL_SIZE_DEFAULT: usize = 1024;

/// Default capacity of a hive's control command channel
pub const HIVE_CMD_CHANNEL_SIZE_DEFAULT: usize = 128;

/// Default maximum number of items in one outbound batch
pub const BATCH_SIZE_COUNT_DEFAULT: usize = 1024;

// =============================================================================
// Consensus Defaults
// =============================================================================

/// Default Raft tick interval in milliseconds
pub const RAFT_TICK_MS_DEFAULT: u64 = 100;

/// Default election timeout in ticks (randomized in [n, 2n))
pub const RAFT_ELECTION_TICKS_DEFAULT: u64 = 5;

/// Default heartbeat interval in ticks
pub const RAFT_HEARTBEAT_TICKS_DEFAULT: u64 = 1;

/// Default number of ticks a barrier waits before timing out
pub const RAFT_BARRIER_TIMEOUT_TICKS_DEFAULT: u64 = 300;

/// Default number of applied entries between snapshots
pub const RAFT_SNAPSHOT_ENTRIES_COUNT_DEFAULT: u64 = 1024;

/// Maximum number of entries shipped in one AppendEntries message
pub const RAFT_APPEND_ENTRIES_COUNT_MAX: usize = 512;

/// Maximum number of in-flight proposals per node
pub const RAFT_PROPOSALS_PENDING_COUNT_MAX: usize = 10_000;

/// Capacity of the channel feeding the consensus driver
pub const RAFT_INBOX_SIZE_DEFAULT: usize = 4096;

// =============================================================================
// Transport Defaults
// =============================================================================

/// Default maximum number of pooled connections per remote host
pub const CONNECTIONS_PER_HOST_COUNT_DEFAULT: usize = 32;

/// Default connect/read timeout in milliseconds (60 sec)
pub const CONNECTION_TIMEOUT_MS_DEFAULT: u64 = 60 * 1000;

/// Default number of data batchers per remote host
pub const BATCHERS_PER_HOST_COUNT_DEFAULT: usize = 1;

/// Default batcher flush timeout in milliseconds
pub const BATCHER_TIMEOUT_MS_DEFAULT: u64 = 1;

/// Default base backoff between send retries in milliseconds
pub const BACKOFF_BASE_MS_DEFAULT: u64 = 10;

/// Default cap on send retry backoff in milliseconds (1 sec)
pub const BACKOFF_MAX_MS_DEFAULT: u64 = 1000;

/// Default number of send attempts before giving up
pub const RETRY_COUNT_MAX_DEFAULT: u32 = 5;

/// Maximum size of a single wire frame in bytes (16 MB)
pub const WIRE_FRAME_SIZE_BYTES_MAX: usize = 16 * 1024 * 1024;

// =============================================================================
// Runtime Defaults
// =============================================================================

/// Default depth of a bee inbox
pub const BEE_INBOX_DEPTH_DEFAULT: usize = 1024;

/// Default depth of the pending mailbox used while ownership is proposed
pub const PENDING_MAILBOX_DEPTH_DEFAULT: usize = 1024;

/// Default number of dispatch retries for retriable proposal errors
pub const DISPATCH_RETRY_COUNT_MAX_DEFAULT: u32 = 10;

/// Default backoff between dispatch retries in milliseconds
pub const DISPATCH_BACKOFF_MS_DEFAULT: u64 = 10;

/// Default number of attempts to stop a dispatch engine
pub const QEE_STOP_RETRY_COUNT_DEFAULT: u32 = 3;

/// Default wait between dispatch engine stop attempts in milliseconds
pub const QEE_STOP_WAIT_MS_DEFAULT: u64 = 1000;

/// Default bounded wait of a replication query in milliseconds
pub const REPLICATION_QUERY_TIMEOUT_MS_DEFAULT: u64 = 5 * 1000;

/// Default replication factor of an application
pub const REPLICATION_FACTOR_DEFAULT: usize = 1;

/// Maximum replication factor of an application
pub const REPLICATION_FACTOR_MAX: usize = 16;

/// Maximum number of hives in a cluster
pub const CLUSTER_HIVES_COUNT_MAX: usize = 1000;

// Compile-time assertions for constant validity
const _: () = {
    assert!(BEE_LOCAL_ID_HIVE_BITS < 64);
    assert!(RAFT_ELECTION_TICKS_DEFAULT > RAFT_HEARTBEAT_TICKS_DEFAULT);
    assert!(RAFT_BARRIER_TIMEOUT_TICKS_DEFAULT > 2 * RAFT_ELECTION_TICKS_DEFAULT);
    assert!(BACKOFF_MAX_MS_DEFAULT >= BACKOFF_BASE_MS_DEFAULT);
    assert!(REPLICATION_FACTOR_DEFAULT >= 1);
    assert!(REPLICATION_FACTOR_MAX <= CLUSTER_HIVES_COUNT_MAX);
    assert!(DICT_VALUE_SIZE_BYTES_MAX < WIRE_FRAME_SIZE_BYTES_MAX);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_have_units_in_names() {
        // All byte limits end in _BYTES_, time limits in _MS_, counts in _COUNT_
        let _: usize = DICT_KEY_SIZE_BYTES_MAX;
        let _: u64 = RAFT_TICK_MS_DEFAULT;
        let _: usize = CLUSTER_HIVES_COUNT_MAX;
    }

    #[test]
    fn test_hive_defaults() {
        assert_eq!(HIVE_ADDR_DEFAULT, "localhost:7767");
        assert_eq!(HIVE_DATA_CHANNEL_SIZE_DEFAULT, 1024);
        assert_eq!(HIVE_CMD_CHANNEL_SIZE_DEFAULT, 128);
    }
}
