//! State store trait and operations
//!
//! TigerStyle: Explicit operations, bounded sizes.

use async_trait::async_trait;
use beehive_core::{BeeId, Error, Result, DICT_KEY_SIZE_BYTES_MAX, DICT_NAME_LENGTH_BYTES_MAX, DICT_VALUE_SIZE_BYTES_MAX};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A committed write to one dictionary
///
/// Masters ship these to their slaves after every commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DictOp {
    /// Set a key
    Put { dict: String, key: Bytes, value: Bytes },
    /// Remove a key; removing a missing key is a no-op
    Delete { dict: String, key: Bytes },
}

impl DictOp {
    /// Dictionary this op writes to
    pub fn dict(&self) -> &str {
        match self {
            Self::Put { dict, .. } | Self::Delete { dict, .. } => dict,
        }
    }

    /// Key this op writes to
    pub fn key(&self) -> &Bytes {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } => key,
        }
    }
}

/// Every entry of one bee, used to move a bee between hives
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub entries: Vec<SnapshotEntry>,
}

/// One entry of a [`StateSnapshot`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub dict: String,
    pub key: Bytes,
    pub value: Bytes,
}

impl StateSnapshot {
    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-bee dictionary storage
///
/// Only the task running a bee writes that bee's state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Get a value
    async fn get(&self, bee: &BeeId, dict: &str, key: &[u8]) -> Result<Option<Bytes>>;

    /// Set a value
    async fn put(&self, bee: &BeeId, dict: &str, key: Bytes, value: Bytes) -> Result<()>;

    /// Remove a key; missing keys are ignored
    async fn delete(&self, bee: &BeeId, dict: &str, key: &[u8]) -> Result<()>;

    /// All entries of one dictionary, ordered by key
    async fn scan(&self, bee: &BeeId, dict: &str) -> Result<Vec<(Bytes, Bytes)>>;

    /// Apply a batch of ops atomically
    async fn commit(&self, bee: &BeeId, ops: &[DictOp]) -> Result<()>;

    /// Copy out every entry of a bee
    async fn export(&self, bee: &BeeId) -> Result<StateSnapshot>;

    /// Replace a bee's state with a snapshot
    async fn import(&self, bee: &BeeId, snapshot: StateSnapshot) -> Result<()>;

    /// Remove every entry of a bee
    async fn drop_state(&self, bee: &BeeId) -> Result<()>;
}

/// Check dictionary name and key bounds
pub(crate) fn check_key(dict: &str, key: &[u8]) -> Result<()> {
    if dict.is_empty() || dict.len() > DICT_NAME_LENGTH_BYTES_MAX {
        return Err(Error::InvalidId {
            id: dict.to_string(),
            reason: format!(
                "dictionary name length must be in 1..={}",
                DICT_NAME_LENGTH_BYTES_MAX
            ),
        });
    }
    if key.len() > DICT_KEY_SIZE_BYTES_MAX {
        return Err(Error::MessageTooLarge {
            size: key.len(),
            limit: DICT_KEY_SIZE_BYTES_MAX,
        });
    }
    Ok(())
}

/// Check value bounds
pub(crate) fn check_value(value: &[u8]) -> Result<()> {
    if value.len() > DICT_VALUE_SIZE_BYTES_MAX {
        return Err(Error::MessageTooLarge {
            size: value.len(),
            limit: DICT_VALUE_SIZE_BYTES_MAX,
        });
    }
    Ok(())
}
