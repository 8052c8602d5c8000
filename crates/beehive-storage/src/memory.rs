//! In-memory state store
//!
//! TigerStyle: Simple in-memory implementation with atomic commits.

use crate::kv::{check_key, check_value, DictOp, SnapshotEntry, StateSnapshot, StateStore};
use async_trait::async_trait;
use beehive_core::{BeeId, Result};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::instrument;

/// Per-bee data: dict -> (key -> value)
type BeeData = HashMap<String, BTreeMap<Bytes, Bytes>>;

/// Store data: bee -> bee data
type StoreData = HashMap<BeeId, BeeData>;

/// In-memory state store
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<StoreData>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bees with any state
    pub async fn bee_count(&self) -> usize {
        self.data.read().await.len()
    }
}

fn apply(data: &mut StoreData, bee: &BeeId, op: &DictOp) {
    match op {
        DictOp::Put { dict, key, value } => {
            data.entry(bee.clone())
                .or_default()
                .entry(dict.clone())
                .or_default()
                .insert(key.clone(), value.clone());
        }
        DictOp::Delete { dict, key } => {
            if let Some(entries) = data.get_mut(bee).and_then(|d| d.get_mut(dict)) {
                entries.remove(key);
            }
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    #[instrument(skip(self, key), fields(bee = %bee, key_len = key.len()))]
    async fn get(&self, bee: &BeeId, dict: &str, key: &[u8]) -> Result<Option<Bytes>> {
        check_key(dict, key)?;
        let data = self.data.read().await;
        Ok(data
            .get(bee)
            .and_then(|d| d.get(dict))
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    #[instrument(skip(self, key, value), fields(bee = %bee, key_len = key.len(), value_len = value.len()))]
    async fn put(&self, bee: &BeeId, dict: &str, key: Bytes, value: Bytes) -> Result<()> {
        check_key(dict, &key)?;
        check_value(&value)?;
        let mut data = self.data.write().await;
        apply(
            &mut data,
            bee,
            &DictOp::Put {
                dict: dict.to_string(),
                key,
                value,
            },
        );
        Ok(())
    }

    #[instrument(skip(self, key), fields(bee = %bee, key_len = key.len()))]
    async fn delete(&self, bee: &BeeId, dict: &str, key: &[u8]) -> Result<()> {
        check_key(dict, key)?;
        let mut data = self.data.write().await;
        apply(
            &mut data,
            bee,
            &DictOp::Delete {
                dict: dict.to_string(),
                key: Bytes::copy_from_slice(key),
            },
        );
        Ok(())
    }

    async fn scan(&self, bee: &BeeId, dict: &str) -> Result<Vec<(Bytes, Bytes)>> {
        let data = self.data.read().await;
        Ok(data
            .get(bee)
            .and_then(|d| d.get(dict))
            .map(|entries| {
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    #[instrument(skip(self, ops), fields(bee = %bee, ops = ops.len()))]
    async fn commit(&self, bee: &BeeId, ops: &[DictOp]) -> Result<()> {
        // Validate everything before touching state so the batch is all-or-nothing
        for op in ops {
            check_key(op.dict(), op.key())?;
            if let DictOp::Put { value, .. } = op {
                check_value(value)?;
            }
        }

        let mut data = self.data.write().await;
        for op in ops {
            apply(&mut data, bee, op);
        }
        Ok(())
    }

    async fn export(&self, bee: &BeeId) -> Result<StateSnapshot> {
        let data = self.data.read().await;
        let mut entries = Vec::new();
        if let Some(dicts) = data.get(bee) {
            let mut names: Vec<&String> = dicts.keys().collect();
            names.sort();
            for name in names {
                for (key, value) in &dicts[name] {
                    entries.push(SnapshotEntry {
                        dict: name.clone(),
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        Ok(StateSnapshot { entries })
    }

    #[instrument(skip(self, snapshot), fields(bee = %bee, entries = snapshot.len()))]
    async fn import(&self, bee: &BeeId, snapshot: StateSnapshot) -> Result<()> {
        let mut fresh = BeeData::new();
        for entry in snapshot.entries {
            check_key(&entry.dict, &entry.key)?;
            fresh
                .entry(entry.dict)
                .or_default()
                .insert(entry.key, entry.value);
        }

        let mut data = self.data.write().await;
        data.insert(bee.clone(), fresh);
        Ok(())
    }

    async fn drop_state(&self, bee: &BeeId) -> Result<()> {
        self.data.write().await.remove(bee);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beehive_core::{AppName, HiveId};

    fn bee(local: u64) -> BeeId {
        BeeId::new(HiveId(1), AppName::new("test").unwrap(), local)
    }

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStore::new();
        let b = bee(1);

        store
            .put(&b, "d", Bytes::from("key1"), Bytes::from("value1"))
            .await
            .unwrap();
        let value = store.get(&b, "d", b"key1").await.unwrap();
        assert_eq!(value, Some(Bytes::from("value1")));

        store.delete(&b, "d", b"key1").await.unwrap();
        assert!(store.get(&b, "d", b"key1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        let b = bee(1);
        store.delete(&b, "d", b"never").await.unwrap();
        store.delete(&b, "d", b"never").await.unwrap();
        assert!(store.get(&b, "d", b"never").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_isolation() {
        let store = MemoryStore::new();
        let b1 = bee(1);
        let b2 = bee(2);

        store
            .put(&b1, "d", Bytes::from("key"), Bytes::from("value1"))
            .await
            .unwrap();
        store
            .put(&b2, "d", Bytes::from("key"), Bytes::from("value2"))
            .await
            .unwrap();

        assert_eq!(
            store.get(&b1, "d", b"key").await.unwrap(),
            Some(Bytes::from("value1"))
        );
        assert_eq!(
            store.get(&b2, "d", b"key").await.unwrap(),
            Some(Bytes::from("value2"))
        );
        assert!(store.get(&b1, "other", b"key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_rejects_whole_batch() {
        let store = MemoryStore::new();
        let b = bee(1);
        let ops = vec![
            DictOp::Put {
                dict: "d".into(),
                key: Bytes::from("ok"),
                value: Bytes::from("v"),
            },
            DictOp::Put {
                dict: String::new(),
                key: Bytes::from("bad"),
                value: Bytes::from("v"),
            },
        ];
        assert!(store.commit(&b, &ops).await.is_err());
        assert!(store.get(&b, "d", b"ok").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_export_import_moves_state() {
        let store = MemoryStore::new();
        let old = bee(1);
        let new = old.moved_to(HiveId(2));

        store
            .put(&old, "a", Bytes::from("k1"), Bytes::from("v1"))
            .await
            .unwrap();
        store
            .put(&old, "b", Bytes::from("k2"), Bytes::from("v2"))
            .await
            .unwrap();

        let snapshot = store.export(&old).await.unwrap();
        assert_eq!(snapshot.len(), 2);

        store.import(&new, snapshot).await.unwrap();
        store.drop_state(&old).await.unwrap();

        assert_eq!(
            store.get(&new, "b", b"k2").await.unwrap(),
            Some(Bytes::from("v2"))
        );
        assert!(store.get(&old, "a", b"k1").await.unwrap().is_none());
        assert_eq!(store.bee_count().await, 1);
    }

    #[tokio::test]
    async fn test_scan_is_ordered() {
        let store = MemoryStore::new();
        let b = bee(1);
        for key in ["c", "a", "b"] {
            store
                .put(&b, "d", Bytes::from(key), Bytes::from(key))
                .await
                .unwrap();
        }
        let keys: Vec<Bytes> = store
            .scan(&b, "d")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
    }
}
