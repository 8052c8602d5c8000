//! Qee: the per-application dispatch engine
//!
//! TigerStyle: One owner per cell, decided before the first message runs.
//!
//! Every app installed on a hive gets one qee task. It maps each broadcast
//! message to its cells, finds (or creates) the bee owning those cells, and
//! hands the message over. Unicast messages go straight to their bee,
//! wherever the registry says it lives now.
//!
//! Cell ownership is decided through the registry. While an assignment is
//! in flight, messages touching the same cells wait in the assignment's
//! mailbox so they keep their arrival order.

use crate::app::{App, MapContext};
use crate::bee::{BeeCommand, BeeHandle, BeeLoop, BeeState, DetachedReceiver, MappedReceiver};
use crate::context::BeeContext;
use crate::hive::{Hive, HiveInner};
use crate::mailbox::Mailbox;
use beehive_core::{BeeId, Error, HiveId, MappedCells, Msg, MsgTarget, Result};
use beehive_registry::{BeeInfo, Colony, RegistryCommand, RegistryResponse};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Commands handled by a qee task
#[derive(Debug)]
pub(crate) enum QeeCommand {
    /// Route an application message
    Dispatch(Msg),
    /// An assignment started by this qee finished
    Assigned {
        job: u64,
        result: Result<RegistryResponse>,
    },
    /// Run a bee the registry places on this hive
    StartBee(BeeInfo),
    /// A bee task exited
    BeeStopped(BeeId),
    /// Move a bee to another hive; answers with its new id
    Migrate {
        bee: BeeId,
        to: HiveId,
        reply: oneshot::Sender<Result<BeeId>>,
    },
    /// List the bees of this qee with their states
    Bees {
        reply: oneshot::Sender<Vec<(BeeId, BeeState)>>,
    },
    /// Stop every bee and exit
    Stop { reply: oneshot::Sender<()> },
}

/// Hive-side handle of a qee task
#[derive(Debug)]
pub(crate) struct QeeHandle {
    pub(crate) tx: mpsc::Sender<QeeCommand>,
    pub(crate) task: JoinHandle<()>,
}

/// Cells waiting for the registry to name their owner
#[derive(Debug)]
struct PendingAssignment {
    job: u64,
    bee: BeeId,
    cells: MappedCells,
    /// A new bee, waiting in `Joining` until the assignment commits
    joining: Option<BeeHandle>,
    mailbox: Mailbox,
}

impl PendingAssignment {
    fn overlaps(&self, cells: &MappedCells) -> bool {
        cells.iter().any(|c| self.cells.contains(c))
    }
}

pub(crate) struct Qee {
    app: Arc<App>,
    hive: Arc<HiveInner>,
    rx: mpsc::Receiver<QeeCommand>,
    tx: mpsc::Sender<QeeCommand>,
    bees: HashMap<BeeId, BeeHandle>,
    local_bee: Option<BeeId>,
    pending: Vec<PendingAssignment>,
    /// Messages to route again, ahead of new commands
    backlog: VecDeque<Msg>,
    next_job: u64,
}

impl Qee {
    pub(crate) fn spawn(app: Arc<App>, hive: Arc<HiveInner>) -> QeeHandle {
        let (tx, rx) = mpsc::channel(hive.config.node.cmd_channel_size);
        let qee = Self {
            app,
            hive,
            rx,
            tx: tx.clone(),
            bees: HashMap::new(),
            local_bee: None,
            pending: Vec::new(),
            backlog: VecDeque::new(),
            next_job: 0,
        };
        let task = tokio::spawn(qee.run());
        QeeHandle { tx, task }
    }

    async fn run(mut self) {
        let app = self.app.name().clone();
        debug!(hive = %self.hive.id, app = %app, "Qee started");
        self.start_detached();

        while let Some(command) = self.rx.recv().await {
            match command {
                QeeCommand::Dispatch(msg) => self.dispatch(msg).await,
                QeeCommand::Assigned { job, result } => self.on_assigned(job, result),
                QeeCommand::StartBee(info) => self.start_bee(info),
                QeeCommand::BeeStopped(id) => self.on_bee_stopped(&id),
                QeeCommand::Migrate { bee, to, reply } => self.migrate(bee, to, reply),
                QeeCommand::Bees { reply } => {
                    let _ = reply.send(self.bee_states());
                }
                QeeCommand::Stop { reply } => {
                    self.stop().await;
                    let _ = reply.send(());
                    break;
                }
            }

            while let Some(msg) = self.backlog.pop_front() {
                self.dispatch(msg).await;
            }
        }

        debug!(hive = %self.hive.id, app = %app, "Qee stopped");
    }

    // =========================================================================
    // Routing
    // =========================================================================

    async fn dispatch(&mut self, msg: Msg) {
        match msg.target_bee().cloned() {
            Some(target) => self.unicast(msg, target).await,
            None => self.broadcast(msg).await,
        }
    }

    async fn unicast(&mut self, msg: Msg, target: BeeId) {
        if let Some(pending) = self.pending.iter_mut().find(|p| p.bee == target) {
            if let Err((msg, e)) = pending.mailbox.push(msg) {
                self.hive.fail_msg(&msg, e);
            }
            return;
        }
        if self.bees.contains_key(&target) {
            self.enqueue(&target, msg);
            return;
        }

        match self.hive.registry.resolve(&target.app, target.local) {
            Some(info) if info.id.hive == self.hive.id => {
                if info.detached {
                    self.hive.fail_msg(&msg, Error::bee_not_found(&target));
                    return;
                }
                let id = info.id.clone();
                if !self.bees.contains_key(&id) {
                    self.start_bee(info);
                }
                self.enqueue(&id, msg.retarget(MsgTarget::Bee { id: id.clone() }));
            }
            Some(info) => {
                let to = info.id.hive;
                self.hive
                    .forward(msg.retarget(MsgTarget::Bee { id: info.id }), to)
                    .await;
            }
            None if target.hive != self.hive.id => {
                // Our registry may lag behind the hive that named this bee.
                self.hive.forward(msg, target.hive).await;
            }
            None => self.hive.fail_msg(&msg, Error::bee_not_found(&target)),
        }
    }

    async fn broadcast(&mut self, msg: Msg) {
        let Some(handler) = self.app.handler(msg.type_name()).cloned() else {
            let reason = format!("{} has no handler for {}", self.app.name(), msg.type_name());
            self.hive.fail_msg(&msg, Error::invalid_message(reason));
            return;
        };
        let cells = handler.map(&msg, &MapContext::new(&self.hive, self.app.name()));

        if cells.is_local() {
            self.local(msg);
            return;
        }

        if let Some(pending) = self.pending.iter_mut().find(|p| p.overlaps(&cells)) {
            if let Err((msg, e)) = pending.mailbox.push(msg) {
                self.hive.fail_msg(&msg, e);
            }
            return;
        }

        let (owners, unowned) = self.hive.registry.owners(self.app.name(), &cells);
        match owners.as_slice() {
            [] => self.assign(msg, cells, None),
            [owner] if unowned.is_empty() => self.route_to(msg, owner.clone()).await,
            [owner] => {
                debug!(
                    app = %self.app.name(),
                    bee = %owner,
                    cells = unowned.len(),
                    "Extending bee with new cells"
                );
                self.assign(msg, cells, Some(owner.clone()));
            }
            _ => {
                let err = conflict(&cells, &owners);
                warn!(app = %self.app.name(), error = %err, "Message maps to cells of different bees");
                self.hive.fail_msg(&msg, err);
            }
        }
    }

    /// Hand a mapped message to the bee owning all of its cells
    async fn route_to(&mut self, msg: Msg, owner: BeeId) {
        if owner.hive != self.hive.id {
            let to = owner.hive;
            self.hive
                .forward(msg.retarget(MsgTarget::Bee { id: owner }), to)
                .await;
            return;
        }
        if !self.bees.contains_key(&owner) {
            match self.hive.registry.bee(&owner) {
                Some(info) => self.start_bee(info),
                None => {
                    // Deleted since we read the owner table; route from scratch.
                    self.backlog.push_back(msg);
                    return;
                }
            }
        }
        self.enqueue(&owner, msg);
    }

    /// Messages mapped to no cells go to this hive's local bee
    fn local(&mut self, msg: Msg) {
        let id = match &self.local_bee {
            Some(id) if self.bees.contains_key(id) => id.clone(),
            _ => self.create_local_bee(),
        };
        self.enqueue(&id, msg);
    }

    fn create_local_bee(&mut self) -> BeeId {
        let id = self.hive.bee_ids.next(self.app.name());
        self.spawn_bee(id.clone());
        self.local_bee = Some(id.clone());
        debug!(app = %self.app.name(), bee = %id, "Local bee created");

        let hive = Arc::clone(&self.hive);
        let info = BeeInfo::new(id.clone());
        tokio::spawn(async move {
            let bee = info.id.clone();
            if let Err(e) = hive.propose(&RegistryCommand::AddBee { info }).await {
                warn!(bee = %bee, error = %e, "Failed to register local bee");
            }
        });
        id
    }

    fn enqueue(&mut self, id: &BeeId, msg: Msg) {
        let Some(handle) = self.bees.get(id) else {
            self.backlog.push_back(msg);
            return;
        };
        match handle.try_send(BeeCommand::Msg(msg)) {
            Ok(()) => {}
            Err(TrySendError::Full(BeeCommand::Msg(msg))) => {
                let err = Error::MailboxFull {
                    id: id.to_string(),
                    depth: handle.capacity(),
                    max: handle.capacity(),
                };
                self.hive.fail_msg(&msg, err);
            }
            Err(TrySendError::Closed(BeeCommand::Msg(msg))) => {
                // Migrated or stopped; the registry knows where it went.
                debug!(bee = %id, "Bee inbox closed, rerouting");
                self.bees.remove(id);
                if self.local_bee.as_ref() == Some(id) {
                    self.local_bee = None;
                }
                self.backlog.push_back(msg);
            }
            Err(_) => {}
        }
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    /// Ask the registry to give `cells` to `owner`, or to a new bee
    fn assign(&mut self, msg: Msg, cells: MappedCells, owner: Option<BeeId>) {
        self.next_job += 1;
        let job = self.next_job;
        let fresh = owner.is_none();
        let bee = owner.unwrap_or_else(|| self.hive.bee_ids.next(self.app.name()));

        let mut mailbox = Mailbox::with_capacity(
            bee.to_string(),
            self.hive.config.runtime.pending_mailbox_depth,
        );
        if let Err((msg, e)) = mailbox.push(msg) {
            self.hive.fail_msg(&msg, e);
            return;
        }
        let joining = fresh.then(|| {
            let ctx = BeeContext::new(bee.clone(), Arc::clone(&self.hive));
            let depth = self.hive.config.runtime.bee_inbox_depth;
            let receiver = MappedReceiver::new(Arc::clone(&self.app));
            BeeLoop::spawn_joining(ctx, receiver, depth, self.tx.clone())
        });
        self.pending.push(PendingAssignment {
            job,
            bee: bee.clone(),
            cells: cells.clone(),
            joining,
            mailbox,
        });

        let hive = Arc::clone(&self.hive);
        let slaves = if fresh { self.app.slave_count() } else { 0 };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = if fresh {
                claim_cells(&hive, bee, cells, slaves).await
            } else {
                hive.propose(&RegistryCommand::AssignBee { cells, bee }).await
            };
            let _ = tx.send(QeeCommand::Assigned { job, result }).await;
        });
    }

    fn on_assigned(&mut self, job: u64, result: Result<RegistryResponse>) {
        let Some(pos) = self.pending.iter().position(|p| p.job == job) else {
            return;
        };
        let mut pending = self.pending.remove(pos);
        let queued = pending.mailbox.drain();
        let fresh = pending.joining.is_some();

        if let Some(handle) = pending.joining.take() {
            if matches!(result, Ok(RegistryResponse::Assigned)) {
                let _ = handle.try_send(BeeCommand::Activate);
                self.bees.insert(pending.bee.clone(), handle);
            } else {
                debug!(bee = %pending.bee, "Stopping bee that did not get its cells");
                handle.abandon();
            }
        }

        match result {
            Ok(RegistryResponse::Assigned) => {
                debug!(bee = %pending.bee, queued = queued.len(), "Cells assigned");
                self.backlog.extend(queued);
            }
            Ok(RegistryResponse::AlreadyOwned { winner }) => {
                debug!(bee = %pending.bee, winner = %winner, "Lost cell race, rerouting");
                self.backlog.extend(queued);
            }
            Ok(RegistryResponse::NotFound) if !fresh => {
                // The owner disappeared meanwhile.
                self.backlog.extend(queued);
            }
            Ok(RegistryResponse::Conflict { bees }) => {
                let err = || conflict(&pending.cells, &bees);
                for msg in queued {
                    self.hive.fail_msg(&msg, err());
                }
            }
            Ok(other) => {
                for msg in queued {
                    let err = Error::fatal(format!("unexpected registry response {:?}", other));
                    self.hive.fail_msg(&msg, err);
                }
            }
            Err(e) => {
                warn!(bee = %pending.bee, error = %e, "Cell assignment failed");
                let remote = e.to_remote();
                for msg in queued {
                    self.hive.fail_msg(&msg, Error::from(remote.clone()));
                }
            }
        }
    }

    // =========================================================================
    // Bees
    // =========================================================================

    fn spawn_bee(&mut self, id: BeeId) {
        let ctx = BeeContext::new(id.clone(), Arc::clone(&self.hive));
        let depth = self.hive.config.runtime.bee_inbox_depth;
        let receiver = MappedReceiver::new(Arc::clone(&self.app));
        let handle = BeeLoop::spawn(ctx, receiver, depth, false, self.tx.clone());
        self.bees.insert(id, handle);
    }

    fn start_bee(&mut self, info: BeeInfo) {
        if info.detached || info.id.hive != self.hive.id || self.bees.contains_key(&info.id) {
            return;
        }
        if self.pending.iter().any(|p| p.joining.is_some() && p.bee == info.id) {
            // Starts when its assignment commits.
            return;
        }
        if info.cells.is_local() && self.local_bee.is_none() {
            self.local_bee = Some(info.id.clone());
        }
        debug!(bee = %info.id, cells = info.cells.len(), "Starting bee");
        self.spawn_bee(info.id);
    }

    fn start_detached(&mut self) {
        for handler in self.app.detached_handlers() {
            let id = self.hive.bee_ids.next(self.app.name());
            let ctx = BeeContext::new(id.clone(), Arc::clone(&self.hive));
            let depth = self.hive.config.runtime.bee_inbox_depth;
            let receiver = DetachedReceiver::new(Arc::clone(handler));
            let handle = BeeLoop::spawn(ctx, receiver, depth, true, self.tx.clone());
            self.bees.insert(id.clone(), handle);
            self.hive.track_detached(&id);

            let hive = Arc::clone(&self.hive);
            tokio::spawn(async move {
                let info = BeeInfo::detached(id.clone());
                if let Err(e) = hive.propose(&RegistryCommand::AddBee { info }).await {
                    warn!(bee = %id, error = %e, "Failed to register detached bee");
                }
            });
        }
    }

    /// Running bees, then bees still waiting for their cells
    fn bee_states(&self) -> Vec<(BeeId, BeeState)> {
        let mut states: Vec<(BeeId, BeeState)> = self
            .bees
            .iter()
            .map(|(id, handle)| (id.clone(), handle.state()))
            .collect();
        states.sort_by_key(|(id, _)| id.local);
        for pending in &self.pending {
            if let Some(handle) = &pending.joining {
                states.push((pending.bee.clone(), handle.state()));
            }
        }
        states
    }

    fn on_bee_stopped(&mut self, id: &BeeId) {
        let stopped = self
            .bees
            .get(id)
            .map_or(false, |h| h.state() == BeeState::Stopped);
        if stopped {
            self.bees.remove(id);
            if self.local_bee.as_ref() == Some(id) {
                self.local_bee = None;
            }
        }
    }

    fn migrate(&mut self, bee: BeeId, to: HiveId, reply: oneshot::Sender<Result<BeeId>>) {
        if self.app.is_sticky() {
            let reason = format!("{} is sticky and its bees do not move", self.app.name());
            let _ = reply.send(Err(Error::invalid_message(reason)));
            return;
        }
        if self.hive.registry.hive(to).is_none() {
            let _ = reply.send(Err(Error::hive_not_found(to)));
            return;
        }

        let id = if self.bees.contains_key(&bee) {
            bee
        } else {
            match self.hive.registry.resolve(&bee.app, bee.local) {
                Some(info) if info.id.hive == self.hive.id => {
                    let id = info.id.clone();
                    self.start_bee(info);
                    id
                }
                _ => {
                    let _ = reply.send(Err(Error::bee_not_found(&bee)));
                    return;
                }
            }
        };

        let Some(handle) = self.bees.get(&id) else {
            let _ = reply.send(Err(Error::bee_not_found(&id)));
            return;
        };
        if handle.detached {
            let _ = reply.send(Err(Error::invalid_message(format!("bee {} is detached", id))));
            return;
        }
        match handle.try_send(BeeCommand::Migrate { to, reply }) {
            Ok(()) => info!(bee = %id, to = %to, "Bee migration requested"),
            Err(TrySendError::Full(BeeCommand::Migrate { reply, .. })) => {
                let _ = reply.send(Err(Error::MailboxFull {
                    id: id.to_string(),
                    depth: handle.capacity(),
                    max: handle.capacity(),
                }));
            }
            Err(TrySendError::Closed(BeeCommand::Migrate { reply, .. })) => {
                let _ = reply.send(Err(Error::bee_not_found(&id)));
            }
            Err(_) => {}
        }
    }

    async fn stop(&mut self) {
        let wait = Duration::from_millis(self.hive.config.runtime.qee_stop_wait_ms);
        let hive_id = self.hive.id;

        for mut pending in self.pending.drain(..) {
            if let Some(handle) = pending.joining.take() {
                handle.abandon();
            }
            for msg in pending.mailbox.drain() {
                self.hive.fail_msg(
                    &msg,
                    Error::HiveStopped {
                        hive: hive_id.to_string(),
                    },
                );
            }
        }
        self.backlog.clear();

        let bees: Vec<BeeHandle> = self.bees.drain().map(|(_, h)| h).collect();
        let count = bees.len();
        futures::future::join_all(bees.into_iter().map(|b| b.stop(wait))).await;
        debug!(hive = %hive_id, app = %self.app.name(), bees = count, "Qee bees stopped");
    }
}

/// Create a bee with its slaves and claim `cells` for it
///
/// A bee that did not win its cells is removed again.
async fn claim_cells(
    hive: &Arc<HiveInner>,
    bee: BeeId,
    cells: MappedCells,
    slaves: usize,
) -> Result<RegistryResponse> {
    let colony = if slaves > 0 {
        let exclude = [hive.id];
        let hives = hive
            .replication
            .select_slave_hives(&Hive::from_inner(Arc::clone(hive)), &exclude, slaves)
            .await
            .unwrap_or_else(|e| {
                warn!(bee = %bee, error = %e, "No slave hives selected");
                Vec::new()
            });
        let slaves = hives.into_iter().map(|h| bee.moved_to(h)).collect();
        Colony::with_slaves(bee.clone(), slaves)
    } else {
        Colony::new(bee.clone())
    };

    let info = BeeInfo::with_colony(colony);
    hive.propose(&RegistryCommand::AddBee { info }).await?;

    let command = RegistryCommand::AssignBee {
        cells,
        bee: bee.clone(),
    };
    let response = hive.propose(&command).await;
    let keep = matches!(response, Ok(RegistryResponse::Assigned));
    if !keep {
        // AlreadyOwned already removed an empty loser; this covers the rest.
        if let Err(e) = hive.propose(&RegistryCommand::DeleteBee { bee: bee.clone() }).await {
            warn!(bee = %bee, error = %e, "Failed to remove unassigned bee");
        }
    }
    response
}

fn conflict(cells: &MappedCells, bees: &[BeeId]) -> Error {
    let bees: Vec<String> = bees.iter().map(|b| b.to_string()).collect();
    Error::CellConflict {
        cells: cells.to_string(),
        bees: bees.join(", "),
    }
}

