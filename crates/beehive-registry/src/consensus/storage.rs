//! Durable Raft state
//!
//! The whole state is small: the log is compacted every
//! `snapshot_entries_count` applied entries. Each save rewrites it.

use super::message::{Entry, HardState, Snapshot};
use crate::error::{RegistryError, RegistryResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Everything a consensus node needs to resume after a restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub hard_state: HardState,
    #[serde(default)]
    pub snapshot: Option<Snapshot>,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

/// Storage backend for consensus state
pub trait RaftStorage: Send + Sync + std::fmt::Debug {
    /// Load the last saved state; `None` when nothing was ever saved
    fn load(&self) -> RegistryResult<Option<PersistentState>>;

    /// Replace the saved state
    fn save(&self, state: &PersistentState) -> RegistryResult<()>;
}

// =============================================================================
// MemoryRaftStorage
// =============================================================================

/// In-memory storage; clones share the same state
#[derive(Debug, Clone, Default)]
pub struct MemoryRaftStorage {
    state: Arc<Mutex<Option<PersistentState>>>,
}

impl MemoryRaftStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftStorage for MemoryRaftStorage {
    fn load(&self) -> RegistryResult<Option<PersistentState>> {
        let state = self
            .state
            .lock()
            .map_err(|_| RegistryError::storage("memory storage lock poisoned"))?;
        Ok(state.clone())
    }

    fn save(&self, state: &PersistentState) -> RegistryResult<()> {
        let mut slot = self
            .state
            .lock()
            .map_err(|_| RegistryError::storage("memory storage lock poisoned"))?;
        *slot = Some(state.clone());
        Ok(())
    }
}

// =============================================================================
// FileRaftStorage
// =============================================================================

/// JSON file storage with atomic replacement
#[derive(Debug, Clone)]
pub struct FileRaftStorage {
    path: PathBuf,
}

impl FileRaftStorage {
    /// Storage at `path`; parent directories are created on first save
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

impl RaftStorage for FileRaftStorage {
    fn load(&self) -> RegistryResult<Option<PersistentState>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RegistryError::storage(e)),
        };
        let state = serde_json::from_slice(&bytes).map_err(RegistryError::corrupted)?;
        debug!(path = %self.path.display(), "Loaded raft state");
        Ok(Some(state))
    }

    fn save(&self, state: &PersistentState) -> RegistryResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(RegistryError::storage)?;
        }
        let bytes = serde_json::to_vec(state).map_err(RegistryError::storage)?;
        let tmp = self.tmp_path();
        fs::write(&tmp, bytes).map_err(RegistryError::storage)?;
        fs::rename(&tmp, &self.path).map_err(RegistryError::storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::message::EntryPayload;
    use beehive_core::HiveId;

    fn sample() -> PersistentState {
        PersistentState {
            hard_state: HardState {
                term: 2,
                voted_for: Some(HiveId(1)),
                commit: 1,
            },
            snapshot: None,
            entries: vec![Entry {
                index: 1,
                term: 1,
                payload: EntryPayload::Empty,
                tag: None,
            }],
        }
    }

    #[test]
    fn test_memory_storage_shared_between_clones() {
        let storage = MemoryRaftStorage::new();
        assert!(storage.load().unwrap().is_none());
        let clone = storage.clone();
        clone.save(&sample()).unwrap();
        assert_eq!(storage.load().unwrap(), Some(sample()));
    }

    #[test]
    fn test_file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("raft.json");

        let storage = FileRaftStorage::new(&path);
        assert!(storage.load().unwrap().is_none());
        storage.save(&sample()).unwrap();

        let reopened = FileRaftStorage::new(&path);
        assert_eq!(reopened.load().unwrap(), Some(sample()));
        assert!(!storage.tmp_path().exists());
    }

    #[test]
    fn test_file_storage_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.json");
        fs::write(&path, b"{not json").unwrap();
        let err = FileRaftStorage::new(&path).load().unwrap_err();
        assert!(matches!(err, RegistryError::Corrupted { .. }));
    }
}
