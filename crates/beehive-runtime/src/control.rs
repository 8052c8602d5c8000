//! The hive control loop
//!
//! One task owns the hive's two inboxes: control commands and application
//! messages. Both are polled fairly so a flood of messages cannot starve
//! a stop request. Commands that wait on the registry or on another hive
//! run in their own tasks.

use crate::hive::HiveInner;
use beehive_core::{BeeId, Error, HiveId, Msg, Result};
use beehive_registry::{Colony, HiveInfo, RegistryCommand, RegistryResponse};
use beehive_storage::StateSnapshot;
use beehive_transport::{JoinAccepted, WireMessage};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Requests handled by the control loop
#[derive(Debug)]
pub(crate) enum ControlCommand {
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    Ping {
        reply: oneshot::Sender<Result<()>>,
    },
    /// Wait until the local registry caught up with the cluster
    Sync {
        reply: oneshot::Sender<Result<()>>,
    },
    NewHiveId {
        addr: String,
        reply: oneshot::Sender<Result<HiveId>>,
    },
    AddHive {
        info: HiveInfo,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Drop a hive from the voters and the hive table
    RemoveHive {
        id: HiveId,
        reply: oneshot::Sender<Result<()>>,
    },
    LiveHives {
        reply: oneshot::Sender<Result<Vec<HiveInfo>>>,
    },
    ReloadState {
        reply: oneshot::Sender<Result<()>>,
    },
    MigrateBee {
        bee: BeeId,
        to: HiveId,
        reply: oneshot::Sender<Result<BeeId>>,
    },
    /// Admit a new hive on behalf of `addr`
    Join {
        req: u64,
        addr: String,
        reply_addr: String,
    },
    /// Take over the state of a bee moving here
    MigrateState {
        req: u64,
        bee: BeeId,
        colony: Colony,
        snapshot: StateSnapshot,
        reply_addr: String,
    },
}

/// Run until a stop command has been handled or both inboxes close
pub(crate) async fn run(
    hive: Arc<HiveInner>,
    mut commands: mpsc::Receiver<ControlCommand>,
    mut data: mpsc::Receiver<Msg>,
) {
    info!(hive = %hive.id, "Control loop started");
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                if let ControlCommand::Stop { reply } = command {
                    let result = hive.shutdown().await;
                    let _ = reply.send(result);
                    break;
                }
                handle_command(&hive, command);
            }
            msg = data.recv() => {
                let Some(msg) = msg else { break };
                hive.route(msg).await;
            }
        }
    }
    info!(hive = %hive.id, "Control loop stopped");
}

fn handle_command(hive: &Arc<HiveInner>, command: ControlCommand) {
    match command {
        ControlCommand::Stop { .. } => {}
        ControlCommand::Ping { reply } => {
            let _ = reply.send(Ok(()));
        }
        ControlCommand::LiveHives { reply } => {
            let _ = reply.send(Ok(hive.registry.hives()));
        }
        ControlCommand::Sync { reply } => {
            let hive = Arc::clone(hive);
            tokio::spawn(async move {
                let result = hive.consensus.barrier().await.map_err(Error::from);
                let _ = reply.send(result);
            });
        }
        ControlCommand::NewHiveId { addr, reply } => {
            let hive = Arc::clone(hive);
            tokio::spawn(async move {
                let _ = reply.send(new_hive_id(&hive, addr).await);
            });
        }
        ControlCommand::AddHive { info, reply } => {
            let hive = Arc::clone(hive);
            tokio::spawn(async move {
                let result = hive
                    .propose(&RegistryCommand::AddHive { info })
                    .await
                    .map(|_| ());
                let _ = reply.send(result);
            });
        }
        ControlCommand::RemoveHive { id, reply } => {
            let hive = Arc::clone(hive);
            tokio::spawn(async move {
                let result = if id == hive.id {
                    Err(Error::invalid_message("a hive cannot remove itself"))
                } else {
                    hive.consensus.remove_node(id).await.map_err(Error::from)
                };
                if result.is_ok() {
                    info!(hive = %hive.id, removed = %id, "Removed hive");
                }
                let _ = reply.send(result);
            });
        }
        ControlCommand::ReloadState { reply } => {
            let hive = Arc::clone(hive);
            tokio::spawn(async move {
                let _ = reply.send(hive.reload_state().await);
            });
        }
        ControlCommand::MigrateBee { bee, to, reply } => {
            let hive = Arc::clone(hive);
            tokio::spawn(async move {
                let _ = reply.send(hive.migrate_bee(bee, to).await);
            });
        }
        ControlCommand::Join {
            req,
            addr,
            reply_addr,
        } => {
            let hive = Arc::clone(hive);
            tokio::spawn(async move { admit(hive, req, addr, reply_addr).await });
        }
        ControlCommand::MigrateState {
            req,
            bee,
            colony,
            snapshot,
            reply_addr,
        } => {
            let hive = Arc::clone(hive);
            tokio::spawn(async move {
                accept_state(hive, req, bee, colony, snapshot, reply_addr).await
            });
        }
    }
}

async fn new_hive_id(hive: &HiveInner, addr: String) -> Result<HiveId> {
    match hive.propose(&RegistryCommand::NewHiveId { addr }).await? {
        RegistryResponse::HiveId { id } => Ok(id),
        other => Err(Error::fatal(format!(
            "unexpected registry response {:?}",
            other
        ))),
    }
}

/// Reserve an id for `addr`, add it as a voter, and tell it who its peers are
async fn admit(hive: Arc<HiveInner>, req: u64, addr: String, reply_addr: String) {
    let result = async {
        let id = new_hive_id(&hive, addr.clone()).await?;
        hive.addresses.insert(id, addr.clone());
        hive.consensus.add_node(id, addr.clone()).await?;
        let peers = hive.consensus.peers().await?;
        Ok::<_, Error>(JoinAccepted { hive: id, peers })
    }
    .await;

    match &result {
        Ok(accepted) => info!(hive = %hive.id, joined = %accepted.hive, addr = %addr, "Admitted hive"),
        Err(e) => warn!(hive = %hive.id, addr = %addr, error = %e, "Join failed"),
    }

    let response = WireMessage::JoinResponse {
        req,
        result: result.map_err(|e| e.to_remote()),
    };
    if let Err(e) = hive.streamer.send_and_wait(&reply_addr, response).await {
        warn!(to = %reply_addr, error = %e, "Failed to answer join request");
    }
}

/// Import the state of a bee moving to this hive and acknowledge it
async fn accept_state(
    hive: Arc<HiveInner>,
    req: u64,
    bee: BeeId,
    colony: Colony,
    snapshot: StateSnapshot,
    reply_addr: String,
) {
    let result = if colony.master != bee || bee.hive != hive.id {
        Err(Error::invalid_message(format!(
            "bee {} is not mastered on hive {}",
            bee, hive.id
        )))
    } else {
        let entries = snapshot.len();
        let result = hive.store.import(&bee, snapshot).await;
        if result.is_ok() {
            debug!(bee = %bee, entries, "Imported migrated state");
        }
        result
    };

    let ack = WireMessage::MigrateAck {
        req,
        result: result.map_err(|e| e.to_remote()),
    };
    if let Err(e) = hive.streamer.send_and_wait(&reply_addr, ack).await {
        warn!(to = %reply_addr, bee = %bee, error = %e, "Failed to acknowledge migration");
    }
}
