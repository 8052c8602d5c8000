//! Consensus driver task
//!
//! Owns the [`RaftCore`], ticks it on a fixed interval, persists its state,
//! hands outbound messages to a [`RaftSender`], and resolves proposal
//! waiters when their entries apply.

use super::message::{EntryPayload, ProposalTag, RaftMessage};
use super::raft::{RaftCore, RaftStatus, StateMachine};
use super::storage::RaftStorage;
use crate::error::{RegistryError, RegistryResult};
use crate::node::{HiveInfo, MembershipChange};
use beehive_core::constants::{RAFT_INBOX_SIZE_DEFAULT, RAFT_PROPOSALS_PENDING_COUNT_MAX};
use beehive_core::{HiveId, IoContext, RaftConfig};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Outbound path for consensus messages
///
/// Sends are best-effort and must not block: Raft retransmits.
pub trait RaftSender: Send + Sync + 'static {
    fn send(&self, msg: RaftMessage);
}

type ProposalReply<R> = oneshot::Sender<RegistryResult<Option<R>>>;

enum DriverCommand<M: StateMachine> {
    Propose {
        payload: EntryPayload,
        reply: ProposalReply<M::Response>,
    },
    Step(RaftMessage),
    Peers(oneshot::Sender<Vec<HiveInfo>>),
    Shutdown,
}

// =============================================================================
// ConsensusHandle
// =============================================================================

/// Client side of a running consensus node
pub struct ConsensusHandle<M: StateMachine> {
    id: HiveId,
    tx: mpsc::Sender<DriverCommand<M>>,
    status: watch::Receiver<RaftStatus>,
    tick_ms: u64,
    barrier_timeout_ms: u64,
}

impl<M: StateMachine> Clone for ConsensusHandle<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
            status: self.status.clone(),
            tick_ms: self.tick_ms,
            barrier_timeout_ms: self.barrier_timeout_ms,
        }
    }
}

impl<M: StateMachine> fmt::Debug for ConsensusHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusHandle")
            .field("id", &self.id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl<M: StateMachine> ConsensusHandle<M> {
    pub fn id(&self) -> HiveId {
        self.id
    }

    /// Latest published status
    pub fn status(&self) -> RaftStatus {
        *self.status.borrow()
    }

    /// Watch leader and term changes
    pub fn subscribe(&self) -> watch::Receiver<RaftStatus> {
        self.status.clone()
    }

    /// Propose a command and wait until it applies on this node
    ///
    /// # Errors
    /// `NoLeader` or `LeaderChanged` (both retriable), `Timeout` after the
    /// barrier timeout. A timed-out proposal may still commit later.
    pub async fn propose(&self, command: &M::Command) -> RegistryResult<M::Response> {
        let data = serde_json::to_vec(command).map_err(|e| RegistryError::internal(e.to_string()))?;
        let payload = EntryPayload::Command { data: data.into() };
        self.propose_payload(payload)
            .await?
            .ok_or_else(|| RegistryError::internal("command applied without a response"))
    }

    /// Add a voter and wait for the change to apply
    pub async fn add_node(&self, hive: HiveId, addr: impl Into<String>) -> RegistryResult<()> {
        let change = MembershipChange::AddNode {
            hive,
            addr: addr.into(),
        };
        self.propose_payload(EntryPayload::Membership { change })
            .await
            .map(|_| ())
    }

    /// Remove a voter and wait for the change to apply
    pub async fn remove_node(&self, hive: HiveId) -> RegistryResult<()> {
        let change = MembershipChange::RemoveNode { hive };
        self.propose_payload(EntryPayload::Membership { change })
            .await
            .map(|_| ())
    }

    /// Wait until this node has applied everything committed before the call
    ///
    /// Retries every tick while no leader is known.
    pub async fn barrier(&self) -> RegistryResult<()> {
        self.barrier_with_timeout(Duration::from_millis(self.barrier_timeout_ms))
            .await
    }

    /// [`ConsensusHandle::barrier`] with an explicit timeout
    pub async fn barrier_with_timeout(&self, timeout: Duration) -> RegistryResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RegistryError::Timeout {
                    operation: "barrier".into(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            match tokio::time::timeout(remaining, self.propose_payload(EntryPayload::Empty)).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) if e.is_retriable() => {
                    debug!(hive = %self.id, error = %e, "Barrier retrying");
                    tokio::time::sleep(Duration::from_millis(self.tick_ms)).await;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(RegistryError::Timeout {
                        operation: "barrier".into(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            }
        }
    }

    /// Deliver a message from a peer; dropped when the inbox is full
    pub fn step(&self, msg: RaftMessage) {
        if let Err(e) = self.tx.try_send(DriverCommand::Step(msg)) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "inbox full",
                mpsc::error::TrySendError::Closed(_) => "driver stopped",
            };
            debug!(hive = %self.id, reason, "Dropping raft message");
        }
    }

    /// Current voters
    pub async fn peers(&self) -> RegistryResult<Vec<HiveInfo>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DriverCommand::Peers(reply))
            .await
            .map_err(|_| RegistryError::Stopped)?;
        rx.await.map_err(|_| RegistryError::Stopped)
    }

    /// Stop the driver; pending proposals fail with `Stopped`
    pub async fn shutdown(&self) {
        let _ = self.tx.send(DriverCommand::Shutdown).await;
    }

    async fn propose_payload(&self, payload: EntryPayload) -> RegistryResult<Option<M::Response>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DriverCommand::Propose { payload, reply })
            .await
            .map_err(|_| RegistryError::Stopped)?;

        let timeout = Duration::from_millis(self.barrier_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RegistryError::Stopped),
            Err(_) => Err(RegistryError::Timeout {
                operation: "propose".into(),
                timeout_ms: self.barrier_timeout_ms,
            }),
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Spawn the driver task for `core`
pub fn spawn_consensus<M: StateMachine>(
    core: RaftCore<M>,
    storage: Arc<dyn RaftStorage>,
    sender: Arc<dyn RaftSender>,
    config: &RaftConfig,
    io: &IoContext,
) -> (ConsensusHandle<M>, JoinHandle<()>) {
    let id = core.id();
    let (tx, rx) = mpsc::channel(RAFT_INBOX_SIZE_DEFAULT);
    let (status_tx, status_rx) = watch::channel(RaftStatus::initial(id));

    let driver = Driver {
        core,
        storage,
        sender,
        rx,
        status_tx,
        waiters: HashMap::new(),
        incarnation: io.rng.next_u64() ^ io.now_ms(),
        seq: 0,
        leader: None,
        tick: Duration::from_millis(config.tick_ms),
    };
    let task = tokio::spawn(driver.run());

    let handle = ConsensusHandle {
        id,
        tx,
        status: status_rx,
        tick_ms: config.tick_ms,
        barrier_timeout_ms: config.barrier_timeout_ms(),
    };
    (handle, task)
}

struct Driver<M: StateMachine> {
    core: RaftCore<M>,
    storage: Arc<dyn RaftStorage>,
    sender: Arc<dyn RaftSender>,
    rx: mpsc::Receiver<DriverCommand<M>>,
    status_tx: watch::Sender<RaftStatus>,
    waiters: HashMap<u64, ProposalReply<M::Response>>,
    incarnation: u64,
    seq: u64,
    leader: Option<HiveId>,
    tick: Duration,
}

impl<M: StateMachine> Driver<M> {
    async fn run(mut self) {
        let id = self.core.id();
        info!(hive = %id, "Consensus driver started");

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut stopped_by = RegistryError::Stopped;
        loop {
            if let Err(e) = self.drain() {
                error!(hive = %id, error = %e, "Consensus storage failed");
                stopped_by = e;
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    self.core.tick();
                    self.waiters.retain(|_, waiter| !waiter.is_closed());
                }
                command = self.rx.recv() => match command {
                    Some(DriverCommand::Propose { payload, reply }) => self.propose(payload, reply),
                    Some(DriverCommand::Step(msg)) => self.core.step(msg),
                    Some(DriverCommand::Peers(reply)) => {
                        let _ = reply.send(self.core.peers());
                    }
                    Some(DriverCommand::Shutdown) | None => break,
                },
            }
        }

        self.fail_waiters(&stopped_by);
        info!(hive = %id, "Consensus driver stopped");
    }

    fn propose(&mut self, payload: EntryPayload, reply: ProposalReply<M::Response>) {
        if self.waiters.len() >= RAFT_PROPOSALS_PENDING_COUNT_MAX {
            let _ = reply.send(Err(RegistryError::ProposalDropped {
                reason: format!("{} proposals pending", self.waiters.len()),
            }));
            return;
        }

        self.seq += 1;
        let tag = ProposalTag {
            origin: self.core.id(),
            incarnation: self.incarnation,
            seq: self.seq,
        };
        match self.core.propose(payload, tag) {
            Ok(()) => {
                self.waiters.insert(tag.seq, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Persist, then send, then resolve waiters
    fn drain(&mut self) -> RegistryResult<()> {
        let ready = self.core.ready();
        if ready.is_empty() {
            return Ok(());
        }

        if let Some(state) = &ready.persist {
            self.storage.save(state)?;
        }

        for msg in ready.messages {
            self.sender.send(msg);
        }

        let id = self.core.id();
        for applied in ready.applied {
            let Some(tag) = applied.tag else {
                continue;
            };
            if tag.origin != id || tag.incarnation != self.incarnation {
                continue;
            }
            if let Some(waiter) = self.waiters.remove(&tag.seq) {
                let _ = waiter.send(applied.result);
            }
        }

        if let Some(status) = ready.status {
            if self.leader.is_some() && status.leader != self.leader {
                warn!(
                    hive = %id,
                    term = status.term,
                    pending = self.waiters.len(),
                    "Leader changed, failing pending proposals"
                );
                let waiters = std::mem::take(&mut self.waiters);
                for (seq, waiter) in waiters {
                    let _ = waiter.send(Err(RegistryError::LeaderChanged {
                        proposal: format!("{}:{}", id, seq),
                    }));
                }
            }
            self.leader = status.leader;
            self.status_tx.send_replace(status);
        }
        Ok(())
    }

    fn fail_waiters(&mut self, error: &RegistryError) {
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}
