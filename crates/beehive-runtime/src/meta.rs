//! Persisted hive identity
//!
//! `meta.json` records the id the registry gave this hive and the peers it
//! last knew about. A restarted hive reads it to come back under the same
//! id instead of joining as a new member.

use beehive_core::{Error, HiveId, Result};
use beehive_registry::HiveInfo;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

/// Contents of `meta.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiveMeta {
    pub hive: HiveInfo,
    #[serde(default)]
    pub peers: Vec<HiveInfo>,
}

impl HiveMeta {
    /// Metadata of the first hive of a new cluster
    pub fn bootstrap(addr: impl Into<String>) -> Self {
        let hive = HiveInfo::new(HiveId::BOOTSTRAP, addr);
        Self {
            peers: vec![hive.clone()],
            hive,
        }
    }

    /// Read `path`; `None` when the file does not exist
    ///
    /// # Errors
    /// `StateCorrupted` when the file exists but does not parse.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: Self = serde_json::from_slice(&data).map_err(|e| Error::StateCorrupted {
            reason: format!("{}: {}", path.display(), e),
        })?;
        if !meta.hive.id.is_assigned() {
            return Err(Error::StateCorrupted {
                reason: format!("{}: hive id is not assigned", path.display()),
            });
        }
        Ok(Some(meta))
    }

    /// Write atomically to `path`, creating its directory
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_vec_pretty(self).map_err(Error::serialization)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), hive = %self.hive, peers = self.peers.len(), "Saved hive meta");
        Ok(())
    }

    /// Peer addresses other than this hive's
    pub fn peer_addrs(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|p| p.id != self.hive.id)
            .map(|p| p.addr.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_meta_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(HiveMeta::load(&dir.path().join("meta.json")).unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("meta.json");

        let mut meta = HiveMeta::bootstrap("h1:7767");
        meta.peers.push(HiveInfo::new(HiveId(2), "h2:7767"));
        meta.save(&path).unwrap();

        let loaded = HiveMeta::load(&path).unwrap().unwrap();
        assert_eq!(loaded, meta);
        assert_eq!(loaded.peer_addrs(), vec!["h2:7767".to_string()]);
    }

    #[test]
    fn test_corrupted_meta_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            HiveMeta::load(&path),
            Err(Error::StateCorrupted { .. })
        ));
    }
}
