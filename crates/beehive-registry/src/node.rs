//! Hive membership types
//!
//! TigerStyle: Explicit identity, stable across restarts.

use beehive_core::constants::CLUSTER_HIVES_COUNT_MAX;
use beehive_core::HiveId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity and address of a hive
///
/// Persisted in `meta.json` and replicated through the registry, so a hive
/// keeps its id across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HiveInfo {
    /// Registry-assigned id
    pub id: HiveId,
    /// Address other hives dial
    pub addr: String,
}

impl HiveInfo {
    /// Create hive info
    pub fn new(id: HiveId, addr: impl Into<String>) -> Self {
        let addr = addr.into();
        debug_assert!(id.is_assigned());
        debug_assert!(!addr.is_empty());
        Self { id, addr }
    }
}

impl fmt::Display for HiveInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Change to the set of voting hives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MembershipChange {
    /// A hive joined
    AddNode { hive: HiveId, addr: String },
    /// A hive left
    RemoveNode { hive: HiveId },
}

impl MembershipChange {
    /// The hive this change is about
    pub fn hive(&self) -> HiveId {
        match self {
            Self::AddNode { hive, .. } | Self::RemoveNode { hive } => *hive,
        }
    }
}

/// Compile-time assertion for cluster limit
const _: () = {
    assert!(CLUSTER_HIVES_COUNT_MAX >= 1);
    assert!(CLUSTER_HIVES_COUNT_MAX <= 10_000);
};
