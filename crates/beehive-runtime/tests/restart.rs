//! A hive restarted on the same state directory keeps its id, its bees and
//! their dictionaries.

mod common;

use beehive_core::{AppName, BeeId, HiveConfig, HiveId, MappedCells, RaftStorageKind};
use beehive_runtime::HiveMeta;
use beehive_storage::{MemoryStore, StateStore};
use beehive_transport::MemoryNetwork;
use common::*;
use std::sync::Arc;
use tempfile::TempDir;

fn persistent_config(n: usize, peers: &[String], dir: &TempDir) -> HiveConfig {
    let mut config = test_config(n, peers);
    config.raft.storage = RaftStorageKind::File;
    config.node.state_path = dir.path().to_path_buf();
    config
}

fn owner(hive: &beehive_runtime::Hive, key: &str) -> BeeId {
    let app = AppName::new(KV_APP).unwrap();
    let (owners, unowned) = hive
        .registry()
        .owners(&app, &MappedCells::single(KV_DICT, key.to_string()));
    assert!(unowned.is_empty());
    assert_eq!(owners.len(), 1);
    owners[0].clone()
}

#[tokio::test]
async fn test_restart_keeps_identity_and_state() {
    let dir = TempDir::new().unwrap();
    let config = persistent_config(1, &[], &dir);
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());

    let first = {
        let network = MemoryNetwork::new();
        let shared: Arc<dyn StateStore> = store.clone();
        let hive = start_hive(&network, config.clone(), Some(shared), vec![kv_app()]).await;
        assert_eq!(hive.id(), HiveId::BOOTSTRAP);

        let a = put(&hive, "a", "1").await;
        put(&hive, "b", "2").await;
        let owner_a = owner(&hive, "a");
        assert_eq!(a.bee, owner_a.to_string());
        hive.stop().await.unwrap();
        owner_a
    };

    let meta = HiveMeta::load(&config.meta_path()).unwrap().unwrap();
    assert_eq!(meta.hive.id, HiveId::BOOTSTRAP);
    assert_eq!(meta.hive.addr, addr(1));

    let network = MemoryNetwork::new();
    let shared: Arc<dyn StateStore> = store.clone();
    let hive = start_hive(&network, config, Some(shared), vec![kv_app()]).await;
    assert_eq!(hive.id(), HiveId::BOOTSTRAP);
    assert_eq!(owner(&hive, "a"), first);

    let read = get(&hive, "a").await;
    assert_eq!(read.value.as_deref(), Some("1"));
    assert_eq!(read.bee, first.to_string());
    assert_eq!(get(&hive, "b").await.value.as_deref(), Some("2"));

    // New bees do not reuse ids handed out before the restart.
    put(&hive, "c", "3").await;
    let fresh = owner(&hive, "c");
    assert_ne!(fresh, first);
    assert_ne!(fresh, owner(&hive, "b"));

    hive.stop().await.unwrap();
}

#[tokio::test]
async fn test_memory_raft_storage_writes_no_meta() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(1, &[]);
    config.node.state_path = dir.path().to_path_buf();

    let network = MemoryNetwork::new();
    let hive = start_hive(&network, config.clone(), None, vec![kv_app()]).await;
    put(&hive, "a", "1").await;
    hive.stop().await.unwrap();

    assert!(HiveMeta::load(&config.meta_path()).unwrap().is_none());
}

#[tokio::test]
async fn test_restarted_member_resumes_only_its_own_bees() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let stores: Vec<Arc<MemoryStore>> = (0..3).map(|_| Arc::new(MemoryStore::new())).collect();
    let configs: Vec<HiveConfig> = (1..=3)
        .map(|n| {
            let peers = if n == 1 { Vec::new() } else { vec![addr(1)] };
            persistent_config(n, &peers, &dirs[n - 1])
        })
        .collect();

    let network = MemoryNetwork::new();
    let mut hives = Vec::new();
    for (config, store) in configs.iter().zip(&stores) {
        let shared: Arc<dyn StateStore> = store.clone();
        hives.push(start_hive(&network, config.clone(), Some(shared), vec![kv_app()]).await);
    }
    for hive in &hives {
        eventually(|| async move { hive.live_hives().await.map(|h| h.len() == 3).unwrap_or(false) }).await;
    }

    put(&hives[0], "one", "1").await;
    put(&hives[1], "two", "2").await;
    put(&hives[2], "three", "3").await;
    let owner_one = owner(&hives[0], "one");
    let owner_two = owner(&hives[1], "two");
    assert_eq!(owner_one.hive, hives[0].id());
    assert_eq!(owner_two.hive, hives[1].id());

    let restarted_id = hives[1].id();
    hives[1].stop().await.unwrap();

    let shared: Arc<dyn StateStore> = stores[1].clone();
    let restarted = start_hive(&network, configs[1].clone(), Some(shared), vec![kv_app()]).await;
    assert_eq!(restarted.id(), restarted_id);
    hives[1] = restarted.clone();

    let app = AppName::new(KV_APP).unwrap();
    let mut expected: Vec<BeeId> = restarted
        .registry()
        .bees_on_hive(restarted_id)
        .into_iter()
        .filter(|b| b.app == app && !b.detached)
        .map(|b| b.id)
        .collect();
    expected.sort_by_key(|b| b.local);
    assert_eq!(expected, vec![owner_two.clone()]);

    let running: Vec<BeeId> = restarted
        .local_bees(&app)
        .await
        .unwrap()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(running, expected);

    let two = get(&restarted, "two").await;
    assert_eq!(two.value.as_deref(), Some("2"));
    assert_eq!(two.bee, owner_two.to_string());

    // Cells of the other hives still route to their bees.
    let one = get(&restarted, "one").await;
    assert_eq!(one.value.as_deref(), Some("1"));
    assert_eq!(one.bee, owner_one.to_string());
    assert_eq!(owner(&restarted, "three").hive, hives[2].id());
    assert!(restarted
        .local_bees(&app)
        .await
        .unwrap()
        .iter()
        .all(|(id, _)| id.hive == restarted_id));

    stop_all(&hives).await;
}
