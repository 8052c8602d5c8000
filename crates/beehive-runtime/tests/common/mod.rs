//! Shared fixtures for runtime integration tests
//!
//! Hives run over a [`MemoryNetwork`] with the fast test configuration. The
//! key-value app maps every key to its own cell.

#![allow(dead_code)]

use async_trait::async_trait;
use beehive_core::{
    init_telemetry, CallContext, Error, HiveConfig, MappedCells, Message, Msg, Result,
    TelemetryConfig,
};
use beehive_runtime::{App, Handler, Hive, HiveBuilder, MapContext, RcvContext};
use beehive_storage::StateStore;
use beehive_transport::MemoryNetwork;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const KV_APP: &str = "kv";
pub const KV_DICT: &str = "kv";

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Put {
    pub key: String,
    pub value: String,
}

impl Message for Put {
    const TYPE_NAME: &'static str = "kv.put";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Get {
    pub key: String,
}

impl Message for Get {
    const TYPE_NAME: &'static str = "kv.get";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub key: String,
    pub value: Option<String>,
    /// Bee that served the request
    pub bee: String,
}

impl Message for Value {
    const TYPE_NAME: &'static str = "kv.value";
}

// =============================================================================
// Key-value app
// =============================================================================

pub struct KvHandler;

#[async_trait]
impl Handler for KvHandler {
    fn map(&self, msg: &Msg, _ctx: &MapContext<'_>) -> MappedCells {
        if let Ok(put) = msg.data::<Put>() {
            return MappedCells::single(KV_DICT, put.key);
        }
        match msg.data::<Get>() {
            Ok(get) => MappedCells::single(KV_DICT, get.key),
            Err(_) => MappedCells::local(),
        }
    }

    async fn rcv(&self, msg: &Msg, ctx: &mut RcvContext) -> Result<()> {
        let bee = ctx.id().to_string();
        if let Ok(put) = msg.data::<Put>() {
            ctx.dict(KV_DICT).put(put.key.clone(), put.value.clone())?;
            let reply = Value {
                key: put.key,
                value: Some(put.value),
                bee,
            };
            return reply_if_possible(ctx, msg, reply);
        }

        let get = msg.data::<Get>()?;
        let value = ctx
            .dict(KV_DICT)
            .try_get(&get.key)
            .await?
            .map(|v| String::from_utf8_lossy(&v).into_owned());
        let reply = Value {
            key: get.key,
            value,
            bee,
        };
        reply_if_possible(ctx, msg, reply)
    }
}

fn reply_if_possible(ctx: &mut RcvContext, msg: &Msg, reply: Value) -> Result<()> {
    match ctx.reply_to(msg, reply) {
        Err(Error::NoReply { .. }) => Ok(()),
        other => other,
    }
}

pub fn kv_app() -> App {
    App::new(KV_APP)
        .unwrap()
        .handle::<Put>(KvHandler)
        .handle::<Get>(KvHandler)
}

// =============================================================================
// Cluster
// =============================================================================

/// Listen address of the `n`th test hive; configs require `host:port`
pub fn addr(n: usize) -> String {
    format!("hive-{}:{}", n, 7766 + n)
}

pub fn test_config(n: usize, peers: &[String]) -> HiveConfig {
    let mut config = HiveConfig::for_testing(addr(n));
    config.node.peer_addrs = peers.to_vec();
    config.runtime.rng_seed = Some(n as u64);
    config
}

pub async fn start_hive(
    network: &MemoryNetwork,
    config: HiveConfig,
    store: Option<Arc<dyn StateStore>>,
    apps: Vec<App>,
) -> Hive {
    // Only the first test in the binary installs the subscriber.
    let _ = init_telemetry(TelemetryConfig::for_tests());
    let transport = Arc::new(network.transport(config.node.addr.clone()));
    let mut builder = HiveBuilder::new(config).with_transport(transport);
    if let Some(store) = store {
        builder = builder.with_store(store);
    }
    for app in apps {
        builder = builder.register_app(app);
    }
    builder.start().await.unwrap()
}

/// Start `count` hives running the apps from `apps`; the first bootstraps
pub async fn start_cluster(network: &MemoryNetwork, count: usize, apps: fn() -> Vec<App>) -> Vec<Hive> {
    assert!(count > 0);
    let mut hives = Vec::with_capacity(count);
    hives.push(start_hive(network, test_config(1, &[]), None, apps()).await);
    for n in 2..=count {
        let hive = start_hive(network, test_config(n, &[addr(1)]), None, apps()).await;
        hives.push(hive);
    }

    for hive in &hives {
        eventually(|| async move { hive.live_hives().await.map(|h| h.len() == count).unwrap_or(false) }).await;
    }
    hives
}

pub async fn stop_all(hives: &[Hive]) {
    for hive in hives.iter().rev() {
        hive.stop().await.unwrap();
    }
}

pub fn ctx() -> CallContext {
    CallContext::with_timeout(Duration::from_secs(5))
}

pub async fn put(hive: &Hive, key: &str, value: &str) -> Value {
    let put = Put {
        key: key.to_string(),
        value: value.to_string(),
    };
    hive.process_as::<Value, _>(&ctx(), put).await.unwrap()
}

pub async fn get(hive: &Hive, key: &str) -> Value {
    let get = Get {
        key: key.to_string(),
    };
    hive.process_as::<Value, _>(&ctx(), get).await.unwrap()
}

/// Poll `check` until it holds, panicking after five seconds
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
