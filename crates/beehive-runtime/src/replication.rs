//! Slave placement for replicated bees
//!
//! Every hive runs the built-in replication app. Its bee keeps the set of
//! live hives in a dictionary, fed by [`HiveJoined`] and [`HiveLeft`]
//! emitted from registry changes, and answers [`ReplicationQuery`] with a
//! random pick. The app is sticky: each hive's replication bee stays on the
//! hive whose id names its cell.

use crate::app::{App, Handler, MapContext};
use crate::context::RcvContext;
use crate::hive::Hive;
use async_trait::async_trait;
use beehive_core::constants::REPLICATION_APP_NAME;
use beehive_core::{CallContext, Error, HiveId, MappedCells, Message, Msg, Result};
use beehive_registry::select_replica_nodes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

const HIVES_DICT: &str = "hives";
const PLACEMENT_DICT: &str = "D";

// =============================================================================
// Messages
// =============================================================================

/// A hive joined the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiveJoined {
    pub hive: HiveId,
}

impl Message for HiveJoined {
    const TYPE_NAME: &'static str = "beehive.hive_joined";
}

/// A hive left the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiveLeft {
    pub hive: HiveId,
}

impl Message for HiveLeft {
    const TYPE_NAME: &'static str = "beehive.hive_left";
}

/// Ask for up to `count` live hives, none of them in `exclude`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationQuery {
    pub count: usize,
    #[serde(default)]
    pub exclude: Vec<HiveId>,
}

impl Message for ReplicationQuery {
    const TYPE_NAME: &'static str = "beehive.replication_query";
}

/// Answer to a [`ReplicationQuery`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationReply {
    pub hives: Vec<HiveId>,
}

impl Message for ReplicationReply {
    const TYPE_NAME: &'static str = "beehive.replication_reply";
}

// =============================================================================
// Replication App
// =============================================================================

/// Handler for every replication message
struct LiveHives;

#[async_trait]
impl Handler for LiveHives {
    fn map(&self, _msg: &Msg, ctx: &MapContext<'_>) -> MappedCells {
        MappedCells::single(PLACEMENT_DICT, ctx.hive_id().0.to_string())
    }

    async fn rcv(&self, msg: &Msg, ctx: &mut RcvContext) -> Result<()> {
        if let Ok(HiveJoined { hive }) = msg.data::<HiveJoined>() {
            ctx.dict(HIVES_DICT).put(hive.0.to_string(), Vec::new())?;
            return Ok(());
        }
        if let Ok(HiveLeft { hive }) = msg.data::<HiveLeft>() {
            ctx.dict(HIVES_DICT).delete(hive.0.to_string())?;
            return Ok(());
        }

        let query = msg.data::<ReplicationQuery>()?;
        let mut live = Vec::new();
        ctx.dict(HIVES_DICT)
            .for_each(|key, _| {
                let id = std::str::from_utf8(key)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| Error::StateCorrupted {
                        reason: format!("bad hive id in {} dictionary", HIVES_DICT),
                    })?;
                live.push(HiveId(id));
                Ok(())
            })
            .await?;

        let hives = select_replica_nodes(&live, ctx.hive_id(), &query.exclude, query.count, ctx.rng());
        debug!(
            hive = %ctx.hive_id(),
            live = live.len(),
            picked = hives.len(),
            "Answered replication query"
        );
        ctx.reply_to(msg, ReplicationReply { hives })
    }
}

/// The built-in app tracking live hives
pub(crate) fn replication_app() -> Result<App> {
    Ok(App::new(REPLICATION_APP_NAME)?
        .handle::<HiveJoined>(LiveHives)
        .handle::<HiveLeft>(LiveHives)
        .handle::<ReplicationQuery>(LiveHives)
        .sticky())
}

// =============================================================================
// Strategy
// =============================================================================

/// Chooses the hives that host the slaves of a new bee
#[async_trait]
pub trait ReplicationStrategy: Send + Sync + fmt::Debug {
    /// Up to `count` hives, none of them in `exclude`
    async fn select_slave_hives(
        &self,
        hive: &Hive,
        exclude: &[HiveId],
        count: usize,
    ) -> Result<Vec<HiveId>>;
}

/// Uniform random pick among the live hives, asked of the replication app
#[derive(Debug, Clone, Copy)]
pub struct RandomReplication {
    timeout_ms: u64,
}

impl RandomReplication {
    pub fn new(timeout_ms: u64) -> Self {
        Self { timeout_ms }
    }
}

#[async_trait]
impl ReplicationStrategy for RandomReplication {
    async fn select_slave_hives(
        &self,
        hive: &Hive,
        exclude: &[HiveId],
        count: usize,
    ) -> Result<Vec<HiveId>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let ctx = CallContext::with_timeout(Duration::from_millis(self.timeout_ms));
        let query = ReplicationQuery {
            count,
            exclude: exclude.to_vec(),
        };
        let reply: ReplicationReply = hive.process_as(&ctx, query).await?;
        Ok(reply.hives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_app_is_sticky() {
        let app = replication_app().unwrap();
        assert!(app.is_sticky());
        assert_eq!(app.slave_count(), 0);
        assert!(app.handles(ReplicationQuery::TYPE_NAME));
        assert!(!app.handles(ReplicationReply::TYPE_NAME));
    }

    #[test]
    fn test_query_serde_defaults_exclude() {
        let query: ReplicationQuery = serde_json::from_str(r#"{"count":2}"#).unwrap();
        assert_eq!(query.count, 2);
        assert!(query.exclude.is_empty());
    }
}
