//! Multi-hive behavior: membership, routing, cell ownership, migration and
//! replication over an in-memory network.

mod common;

use async_trait::async_trait;
use beehive_core::{AppName, Error, ErrorKind, HiveId, MappedCells, Message, Msg, Result};
use beehive_runtime::{
    App, BeeState, Handler, MapContext, RcvContext, ReplicationQuery, ReplicationReply,
};
use beehive_storage::{MemoryStore, StateStore};
use beehive_transport::MemoryNetwork;
use common::*;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn kv_only() -> Vec<App> {
    vec![kv_app()]
}

fn owners_of(hive: &beehive_runtime::Hive, key: &str) -> Vec<beehive_core::BeeId> {
    let app = AppName::new(KV_APP).unwrap();
    hive.registry()
        .owners(&app, &MappedCells::single(KV_DICT, key.to_string()))
        .0
}

#[test]
fn test_fixture_configs_are_valid() {
    for n in 1..=3 {
        let config = test_config(n, &[addr(1)]);
        config.validate().unwrap();
        assert!(config.node.addr.contains(':'));
    }
}

#[tokio::test]
async fn test_single_hive_put_get() {
    let network = MemoryNetwork::new();
    let hives = start_cluster(&network, 1, kv_only).await;
    let hive = &hives[0];
    assert_eq!(hive.id(), HiveId::BOOTSTRAP);

    let written = put(hive, "a", "1").await;
    assert_eq!(written.value.as_deref(), Some("1"));

    let read = get(hive, "a").await;
    assert_eq!(read.value.as_deref(), Some("1"));
    assert_eq!(read.bee, written.bee);

    let missing = get(hive, "b").await;
    assert_eq!(missing.value, None);
    assert_ne!(missing.bee, written.bee);

    stop_all(&hives).await;
}

#[tokio::test]
async fn test_hives_join_with_distinct_ids() {
    let network = MemoryNetwork::new();
    let hives = start_cluster(&network, 3, kv_only).await;

    let mut ids: Vec<HiveId> = hives.iter().map(|h| h.id()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);

    for hive in &hives {
        hive.sync().await.unwrap();
        hive.ping().await.unwrap();
        let live = hive.live_hives().await.unwrap();
        assert_eq!(live.len(), 3);
    }

    let leaders: Vec<Option<HiveId>> = hives.iter().map(|h| h.status().leader).collect();
    assert!(leaders[0].is_some());
    assert!(leaders.iter().all(|l| *l == leaders[0]));

    stop_all(&hives).await;
}

#[tokio::test]
async fn test_any_hive_reaches_the_owner() {
    let network = MemoryNetwork::new();
    let hives = start_cluster(&network, 3, kv_only).await;

    let written = put(&hives[1], "shared", "x").await;
    for hive in &hives {
        let read = get(hive, "shared").await;
        assert_eq!(read.value.as_deref(), Some("x"));
        assert_eq!(read.bee, written.bee);
    }

    stop_all(&hives).await;
}

#[tokio::test]
async fn test_concurrent_claims_end_with_one_owner() {
    let network = MemoryNetwork::new();
    let hives = start_cluster(&network, 3, kv_only).await;

    let writes = hives.iter().enumerate().map(|(i, hive)| {
        let hive = hive.clone();
        async move { put(&hive, "contended", &format!("v{}", i)).await }
    });
    let replies = join_all(writes).await;

    let bee = &replies[0].bee;
    assert!(replies.iter().all(|r| &r.bee == bee), "replies: {:?}", replies);

    for hive in &hives {
        hive.sync().await.unwrap();
        let owners = owners_of(hive, "contended");
        assert_eq!(owners.len(), 1);
        assert_eq!(&owners[0].to_string(), bee);
    }

    // Losing bees never became active and left no trace.
    let app = AppName::new(KV_APP).unwrap();
    let mut running = Vec::new();
    for hive in &hives {
        let bees = hive.local_bees(&app).await.unwrap();
        assert!(
            bees.iter().all(|(_, state)| *state == BeeState::Active),
            "bees: {:?}",
            bees
        );
        running.extend(bees.into_iter().map(|(id, _)| id.to_string()));
        let registered = hive.registry().bees().into_iter().filter(|b| b.app == app).count();
        assert_eq!(registered, 1);
    }
    assert_eq!(&running, &[bee.clone()]);

    stop_all(&hives).await;
}

#[tokio::test]
async fn test_migration_keeps_state() {
    let network = MemoryNetwork::new();
    let hives = start_cluster(&network, 3, kv_only).await;

    put(&hives[0], "m", "moving").await;
    let owner = owners_of(&hives[0], "m").remove(0);
    assert_eq!(owner.hive, hives[0].id());

    let target = hives[1].id();
    let moved = hives[0].migrate_bee(&owner, target).await.unwrap();
    assert_eq!(moved.hive, target);
    assert_eq!(moved.local, owner.local);

    for hive in &hives {
        hive.sync().await.unwrap();
        assert_eq!(owners_of(hive, "m"), vec![moved.clone()]);
    }

    let read = get(&hives[2], "m").await;
    assert_eq!(read.value.as_deref(), Some("moving"));
    assert_eq!(read.bee, moved.to_string());

    // The source hive routes to the new owner too.
    let again = get(&hives[0], "m").await;
    assert_eq!(again.bee, moved.to_string());

    stop_all(&hives).await;
}

#[tokio::test]
async fn test_migration_to_unknown_hive_fails() {
    let network = MemoryNetwork::new();
    let hives = start_cluster(&network, 1, kv_only).await;

    put(&hives[0], "k", "v").await;
    let owner = owners_of(&hives[0], "k").remove(0);
    let result = hives[0].migrate_bee(&owner, HiveId(42)).await;
    assert!(result.is_err());

    let read = get(&hives[0], "k").await;
    assert_eq!(read.value.as_deref(), Some("v"));

    stop_all(&hives).await;
}

fn replicated_kv() -> Vec<App> {
    vec![kv_app().with_replication_factor(2)]
}

#[tokio::test]
async fn test_writes_reach_the_slave() {
    let network = MemoryNetwork::new();
    let store1: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let store2: Arc<MemoryStore> = Arc::new(MemoryStore::new());

    let s1: Arc<dyn StateStore> = store1.clone();
    let s2: Arc<dyn StateStore> = store2.clone();
    let h1 = start_hive(&network, test_config(1, &[]), Some(s1), replicated_kv()).await;
    let h2 = start_hive(&network, test_config(2, &[addr(1)]), Some(s2), replicated_kv()).await;
    let h2_id = h2.id();

    // Wait until the replication app on hive 1 knows about hive 2.
    eventually(|| {
        let h1 = h1.clone();
        async move {
            let query = ReplicationQuery {
                count: 1,
                exclude: Vec::new(),
            };
            h1.process_as::<ReplicationReply, _>(&ctx(), query)
                .await
                .map(|r| r.hives == vec![h2_id])
                .unwrap_or(false)
        }
    })
    .await;

    put(&h1, "r", "replicated").await;
    let owner = owners_of(&h1, "r").remove(0);
    let info = h1.registry().bee(&owner).unwrap();
    assert_eq!(info.colony.slaves.len(), 1);
    let slave = info.colony.slaves[0].clone();
    assert_eq!(slave.hive, h2.id());

    eventually(|| {
        let store2 = store2.clone();
        let slave = slave.clone();
        async move {
            matches!(
                store2.get(&slave, KV_DICT, b"r").await,
                Ok(Some(v)) if v.as_ref() == b"replicated"
            )
        }
    })
    .await;

    h2.stop().await.unwrap();
    h1.stop().await.unwrap();
}

#[tokio::test]
async fn test_removed_hive_hands_bees_to_slaves() {
    let network = MemoryNetwork::new();
    let hives = start_cluster(&network, 3, replicated_kv).await;
    let doomed = hives[2].clone();

    eventually(|| {
        let doomed = doomed.clone();
        async move {
            let query = ReplicationQuery {
                count: 2,
                exclude: Vec::new(),
            };
            doomed
                .process_as::<ReplicationReply, _>(&ctx(), query)
                .await
                .map(|r| r.hives.len() == 2)
                .unwrap_or(false)
        }
    })
    .await;

    put(&doomed, "f", "survives").await;
    let owner = owners_of(&doomed, "f").remove(0);
    assert_eq!(owner.hive, doomed.id());
    let slave = doomed.registry().bee(&owner).unwrap().colony.slaves[0].clone();

    // Give the slave time to apply the write.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    doomed.stop().await.unwrap();
    hives[0].remove_hive(doomed.id()).await.unwrap();
    assert!(hives[0].remove_hive(hives[0].id()).await.is_err());

    for hive in &hives[..2] {
        hive.sync().await.unwrap();
        assert_eq!(hive.live_hives().await.unwrap().len(), 2);
        assert_eq!(owners_of(hive, "f"), vec![slave.clone()]);
    }

    let read = get(&hives[0], "f").await;
    assert_eq!(read.value.as_deref(), Some("survives"));
    assert_eq!(read.bee, slave.to_string());

    stop_all(&hives[..2]).await;
}

/// Shares the `kv.put` tag with [`Put`] but carries a number
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NumericPut {
    key: String,
    value: u64,
}

impl Message for NumericPut {
    const TYPE_NAME: &'static str = "kv.put";
}

struct NumericKv;

#[async_trait]
impl Handler for NumericKv {
    fn map(&self, msg: &Msg, _ctx: &MapContext<'_>) -> MappedCells {
        match msg.data::<NumericPut>() {
            Ok(put) => MappedCells::single(KV_DICT, put.key),
            Err(_) => MappedCells::local(),
        }
    }

    async fn rcv(&self, _msg: &Msg, _ctx: &mut RcvContext) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_undecodable_remote_message_fails_the_caller() {
    let network = MemoryNetwork::new();
    let h1 = start_hive(&network, test_config(1, &[]), None, kv_only()).await;
    let numeric = vec![App::new(KV_APP).unwrap().handle::<NumericPut>(NumericKv)];
    let h2 = start_hive(&network, test_config(2, &[addr(1)]), None, numeric).await;

    put(&h1, "n", "text").await;
    h2.sync().await.unwrap();
    assert_eq!(owners_of(&h2, "n")[0].hive, h1.id());

    // Hive 1 decodes `kv.put` as text and rejects the number.
    let number = NumericPut {
        key: "n".into(),
        value: 5,
    };
    let err = h2.process(&ctx(), number).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{:?}", err);
    assert!(!matches!(err, Error::Timeout { .. }));

    assert_eq!(get(&h1, "n").await.value.as_deref(), Some("text"));

    h2.stop().await.unwrap();
    h1.stop().await.unwrap();
}
