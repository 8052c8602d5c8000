//! Identifiers for hives, applications and bees

use crate::constants::{APP_NAME_LENGTH_BYTES_MAX, BEE_LOCAL_ID_HIVE_BITS};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a hive (node)
///
/// Assigned by the registry; zero is never a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HiveId(pub u64);

impl HiveId {
    /// Placeholder for "not yet assigned"
    pub const NONE: HiveId = HiveId(0);

    /// The id of the hive that bootstraps a new cluster
    pub const BOOTSTRAP: HiveId = HiveId(1);

    /// Whether the id was assigned by the registry
    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for HiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated application name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppName(String);

impl AppName {
    /// Create an application name
    ///
    /// # Errors
    /// Returns `InvalidId` if the name is empty, too long, or contains
    /// characters other than alphanumerics, `-`, `_` and `.`.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(Error::InvalidId {
                id: name,
                reason: "application name must not be empty".into(),
            });
        }

        if name.len() > APP_NAME_LENGTH_BYTES_MAX {
            return Err(Error::InvalidId {
                reason: format!(
                    "length {} exceeds limit {}",
                    name.len(),
                    APP_NAME_LENGTH_BYTES_MAX
                ),
                id: name,
            });
        }

        let valid = name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid {
            return Err(Error::InvalidId {
                id: name,
                reason: "application name contains invalid characters".into(),
            });
        }

        Ok(Self(name))
    }

    /// Borrow as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AppName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<AppName> for String {
    fn from(value: AppName) -> Self {
        value.0
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique identifier of a bee
///
/// `hive` is the hive currently hosting the bee. The upper bits of `local`
/// hold the hive that created it, so ids minted on different hives never
/// collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BeeId {
    pub hive: HiveId,
    pub app: AppName,
    pub local: u64,
}

impl BeeId {
    /// Create a bee id
    pub fn new(hive: HiveId, app: AppName, local: u64) -> Self {
        Self { hive, app, local }
    }

    /// Compose a local id from the creating hive and a per-hive sequence
    pub fn compose_local(creator: HiveId, seq: u64) -> u64 {
        debug_assert!(creator.0 < (1u64 << (64 - BEE_LOCAL_ID_HIVE_BITS)));
        debug_assert!(seq < (1u64 << BEE_LOCAL_ID_HIVE_BITS));
        (creator.0 << BEE_LOCAL_ID_HIVE_BITS) | (seq & ((1u64 << BEE_LOCAL_ID_HIVE_BITS) - 1))
    }

    /// The hive that minted this id
    pub fn creator(&self) -> HiveId {
        HiveId(self.local >> BEE_LOCAL_ID_HIVE_BITS)
    }

    /// The same bee hosted on another hive
    pub fn moved_to(&self, hive: HiveId) -> Self {
        Self {
            hive,
            app: self.app.clone(),
            local: self.local,
        }
    }
}

impl fmt::Display for BeeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.app, self.hive, self.local)
    }
}

/// Mints bee local ids for one hive
#[derive(Debug)]
pub struct BeeIdGen {
    hive: HiveId,
    seq: AtomicU64,
}

impl BeeIdGen {
    /// Create a generator whose sequence starts after `start`
    pub fn new(hive: HiveId, start: u64) -> Self {
        Self {
            hive,
            seq: AtomicU64::new(start),
        }
    }

    /// Mint the next bee id for `app`
    pub fn next(&self, app: &AppName) -> BeeId {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        BeeId::new(self.hive, app.clone(), BeeId::compose_local(self.hive, seq))
    }

    /// Make sure future ids do not collide with an id restored from the registry
    pub fn observe(&self, id: &BeeId) {
        if id.creator() != self.hive {
            return;
        }
        let seq = id.local & ((1u64 << BEE_LOCAL_ID_HIVE_BITS) - 1);
        self.seq.fetch_max(seq, Ordering::Relaxed);
    }
}
