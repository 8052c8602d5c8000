//! Hive side of the transport
//!
//! [`Inbound`] is the transport's [`WireHandler`]: it exists before the hive
//! knows its own id, so it is wired up in stages. Consensus traffic flows
//! once the consensus node is set; everything else waits for the hive.

use crate::control::ControlCommand;
use crate::hive::HiveInner;
use crate::sync::Waiters;
use async_trait::async_trait;
use beehive_core::{Error, HiveId, Msg, MsgSource};
use beehive_registry::{RaftMessage, RaftSender, Registry, RegistryConsensus};
use beehive_transport::{JoinAccepted, Streamer, WireBatch, WireHandler, WireMessage};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, Weak};
use tracing::{debug, warn};

// =============================================================================
// AddressBook
// =============================================================================

/// Last known address of every hive
#[derive(Debug, Default)]
pub(crate) struct AddressBook {
    addrs: RwLock<HashMap<HiveId, String>>,
}

impl AddressBook {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, hive: HiveId, addr: impl Into<String>) {
        let mut addrs = self.addrs.write().unwrap_or_else(|p| p.into_inner());
        addrs.insert(hive, addr.into());
    }

    pub(crate) fn remove(&self, hive: HiveId) {
        let mut addrs = self.addrs.write().unwrap_or_else(|p| p.into_inner());
        addrs.remove(&hive);
    }

    pub(crate) fn get(&self, hive: HiveId) -> Option<String> {
        let addrs = self.addrs.read().unwrap_or_else(|p| p.into_inner());
        addrs.get(&hive).cloned()
    }
}

// =============================================================================
// RaftOutbox
// =============================================================================

/// Sends consensus messages through the streamer's raft lane
pub(crate) struct RaftOutbox {
    streamer: Arc<Streamer>,
    addresses: Arc<AddressBook>,
    registry: Registry,
}

impl RaftOutbox {
    pub(crate) fn new(streamer: Arc<Streamer>, addresses: Arc<AddressBook>, registry: Registry) -> Self {
        Self {
            streamer,
            addresses,
            registry,
        }
    }
}

impl RaftSender for RaftOutbox {
    fn send(&self, msg: RaftMessage) {
        let to = msg.to;
        let addr = self
            .addresses
            .get(to)
            .or_else(|| self.registry.hive(to).map(|h| h.addr));
        match addr {
            Some(addr) => self.streamer.send_raft(&addr, msg),
            None => debug!(to = %to, kind = msg.body.name(), "No address for raft peer"),
        }
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Entry point of every batch received from other hives
pub(crate) struct Inbound {
    consensus: OnceLock<RegistryConsensus>,
    hive: OnceLock<Weak<HiveInner>>,
    joins: Arc<Waiters<JoinAccepted>>,
}

impl Inbound {
    pub(crate) fn new(joins: Arc<Waiters<JoinAccepted>>) -> Self {
        Self {
            consensus: OnceLock::new(),
            hive: OnceLock::new(),
            joins,
        }
    }

    pub(crate) fn set_consensus(&self, consensus: RegistryConsensus) {
        let _ = self.consensus.set(consensus);
    }

    pub(crate) fn set_hive(&self, hive: &Arc<HiveInner>) {
        let _ = self.hive.set(Arc::downgrade(hive));
    }

    fn hive(&self) -> Option<Arc<HiveInner>> {
        self.hive.get().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl WireHandler for Inbound {
    async fn handle(&self, batch: WireBatch) {
        let from_addr = batch.from_addr;
        for message in batch.messages {
            match message {
                WireMessage::Raft { msg } => match self.consensus.get() {
                    Some(consensus) => consensus.step(msg),
                    None => debug!(from = %msg.from, "Raft message before consensus started"),
                },
                WireMessage::JoinResponse { req, result } => {
                    self.joins.resolve(req, result.map_err(Error::from));
                }
                other => match self.hive() {
                    Some(hive) => hive.on_wire(other, &from_addr).await,
                    None => debug!(from = %from_addr, kind = other.name(), "Message before hive started"),
                },
            }
        }
    }
}

impl HiveInner {
    /// Handle one non-consensus message from `from_addr`
    pub(crate) async fn on_wire(self: &Arc<Self>, message: WireMessage, from_addr: &str) {
        match message {
            WireMessage::Data { from, frames } => {
                for frame in frames {
                    let source = frame.from.clone();
                    let result = match Msg::from_frame(frame).decoded(&self.codecs) {
                        Ok(msg) => self.enqueue_data(msg).await,
                        Err(e) => Err(e),
                    };
                    let Err(e) = result else {
                        continue;
                    };
                    // Remote callers get the error back.
                    match source {
                        MsgSource::Waiter { hive, waiter } => self.answer(hive, waiter, Err(e)),
                        _ => warn!(from = %from, error = %e, "Inbound message dropped"),
                    }
                }
            }
            WireMessage::Reply { waiter, result } => {
                let result = result
                    .map_err(Error::from)
                    .and_then(|frame| Msg::from_frame(frame).decoded(&self.codecs));
                self.replies.resolve(waiter, result);
            }
            WireMessage::JoinRequest { req, addr } => {
                let command = ControlCommand::Join {
                    req,
                    addr,
                    reply_addr: from_addr.to_string(),
                };
                if self.cmd_tx.send(command).await.is_err() {
                    debug!(from = %from_addr, "Join request while stopping");
                }
            }
            WireMessage::MigrateState {
                req,
                bee,
                colony,
                snapshot,
            } => {
                let command = ControlCommand::MigrateState {
                    req,
                    bee,
                    colony,
                    snapshot,
                    reply_addr: from_addr.to_string(),
                };
                if self.cmd_tx.send(command).await.is_err() {
                    debug!(from = %from_addr, "Migration while stopping");
                }
            }
            WireMessage::MigrateAck { req, result } => {
                self.migrations.resolve(req, result.map_err(Error::from));
            }
            WireMessage::Replicate { bee, ops } => {
                if let Err(e) = self.store.commit(&bee, &ops).await {
                    warn!(bee = %bee, ops = ops.len(), error = %e, "Failed to apply replicated writes");
                }
            }
            WireMessage::Raft { .. } | WireMessage::JoinResponse { .. } => {}
        }
    }
}
