//! Bees: one task per actor
//!
//! TigerStyle: Explicit lifecycle states, one message at a time.
//!
//! A bee drains a bounded inbox in arrival order. Every message runs inside
//! a dictionary transaction that commits when the receiver returns `Ok`;
//! after a commit the master ships the committed ops to its slaves.
//!
//! What a bee does with a message is decided by its [`BeeReceiver`]. Mapped
//! bees run the app's handler for the message type; detached bees run the
//! app's [`DetachedHandler`].
//!
//! ```text
//!   Created -> Joining -> Active -> Migrating -> Stopped
//!      |          |         |  ^        |
//!      |          |         |  +--------+ (aborted)
//!      +----------+-----> Active -> Draining -> Stopped
//!                 |
//!                 +-> Stopped (lost the race)
//! ```

use crate::app::{App, DetachedHandler};
use crate::context::{BeeContext, RcvContext};
use crate::qee::QeeCommand;
use async_trait::async_trait;
use beehive_core::{BeeId, Error, HiveId, Msg, MsgTarget, Result};
use beehive_registry::RegistryCommand;
use beehive_registry::RegistryResponse;
use beehive_storage::Transaction;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// =============================================================================
// BeeState
// =============================================================================

/// Lifecycle state of a bee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BeeState {
    /// Allocated, not running yet
    #[default]
    Created,
    /// Waiting for its cell assignment to commit
    Joining,
    /// Processing messages
    Active,
    /// Handing its state to another hive; new messages are buffered
    Migrating,
    /// Inbox closed, processing what is left
    Draining,
    /// Done
    Stopped,
}

impl BeeState {
    pub fn is_running(&self) -> bool {
        matches!(self, BeeState::Active | BeeState::Migrating | BeeState::Draining)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: BeeState) -> bool {
        match (self, next) {
            // Reloaded and local bees skip the assignment round
            (BeeState::Created, BeeState::Joining | BeeState::Active) => true,
            (BeeState::Joining, BeeState::Active | BeeState::Stopped) => true,
            (BeeState::Active, BeeState::Migrating | BeeState::Draining) => true,
            (BeeState::Migrating, BeeState::Active | BeeState::Stopped) => true,
            (BeeState::Draining, BeeState::Stopped) => true,
            _ if *self == next => true,
            _ => false,
        }
    }
}

impl fmt::Display for BeeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BeeState::Created => write!(f, "created"),
            BeeState::Joining => write!(f, "joining"),
            BeeState::Active => write!(f, "active"),
            BeeState::Migrating => write!(f, "migrating"),
            BeeState::Draining => write!(f, "draining"),
            BeeState::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Receivers
// =============================================================================

/// What a bee does with its messages
#[async_trait]
pub(crate) trait BeeReceiver: Send + 'static {
    /// Called once before the first message
    async fn on_start(&mut self, _ctx: &BeeContext) {}

    /// Handle one message inside its transaction
    async fn receive(&mut self, msg: &Msg, ctx: &mut RcvContext) -> Result<()>;

    /// Called once after the last message
    async fn on_stop(&mut self, _ctx: &BeeContext) {}

    /// Whether this bee may move to another hive
    fn can_migrate(&self) -> bool {
        true
    }
}

/// Runs the app's handler for each message type
pub(crate) struct MappedReceiver {
    app: Arc<App>,
}

impl MappedReceiver {
    pub(crate) fn new(app: Arc<App>) -> Self {
        Self { app }
    }
}

#[async_trait]
impl BeeReceiver for MappedReceiver {
    async fn receive(&mut self, msg: &Msg, ctx: &mut RcvContext) -> Result<()> {
        let handler = self.app.handler(msg.type_name()).ok_or_else(|| {
            Error::invalid_message(format!(
                "{} has no handler for {}",
                self.app.name(),
                msg.type_name()
            ))
        })?;
        handler.rcv(msg, ctx).await
    }
}

/// Runs a detached handler next to its long-lived start task
pub(crate) struct DetachedReceiver {
    handler: Arc<dyn DetachedHandler>,
    started: Option<JoinHandle<()>>,
}

impl DetachedReceiver {
    pub(crate) fn new(handler: Arc<dyn DetachedHandler>) -> Self {
        Self {
            handler,
            started: None,
        }
    }
}

#[async_trait]
impl BeeReceiver for DetachedReceiver {
    async fn on_start(&mut self, ctx: &BeeContext) {
        let handler = Arc::clone(&self.handler);
        let ctx = ctx.clone();
        self.started = Some(tokio::spawn(async move { handler.start(ctx).await }));
    }

    async fn receive(&mut self, msg: &Msg, ctx: &mut RcvContext) -> Result<()> {
        self.handler.rcv(msg, ctx).await
    }

    async fn on_stop(&mut self, ctx: &BeeContext) {
        self.handler.stop(ctx).await;
        if let Some(task) = self.started.take() {
            task.abort();
        }
    }

    fn can_migrate(&self) -> bool {
        false
    }
}

// =============================================================================
// BeeLoop
// =============================================================================

/// Inbox item of a bee
#[derive(Debug)]
pub(crate) enum BeeCommand {
    Msg(Msg),
    Migrate {
        to: HiveId,
        reply: oneshot::Sender<Result<BeeId>>,
    },
    /// The bee's cells are assigned; leave `Joining`
    Activate,
    Drain,
}

/// Qee-side handle of a running bee
#[derive(Debug)]
pub(crate) struct BeeHandle {
    pub(crate) id: BeeId,
    pub(crate) detached: bool,
    tx: mpsc::Sender<BeeCommand>,
    state: watch::Receiver<BeeState>,
    task: JoinHandle<()>,
}

impl BeeHandle {
    pub(crate) fn state(&self) -> BeeState {
        *self.state.borrow()
    }

    pub(crate) fn try_send(
        &self,
        command: BeeCommand,
    ) -> std::result::Result<(), mpsc::error::TrySendError<BeeCommand>> {
        self.tx.try_send(command)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Stop a bee that never left `Joining`; its task exits on its own
    pub(crate) fn abandon(self) {
        let _ = self.tx.try_send(BeeCommand::Drain);
    }

    /// Drain the inbox and wait up to `wait` for the bee to stop, then abort it
    ///
    /// Dropping the sender ends the inbox even when it is too full to take
    /// the `Drain` command.
    pub(crate) async fn stop(self, wait: Duration) {
        let BeeHandle { id, tx, mut task, .. } = self;
        let _ = tx.try_send(BeeCommand::Drain);
        drop(tx);

        match tokio::time::timeout(wait, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if e.is_panic() {
                    error!(bee = %id, "Bee task panicked");
                }
            }
            Err(_) => {
                warn!(bee = %id, wait_ms = wait.as_millis() as u64, "Bee did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

/// The task body shared by every kind of bee
pub(crate) struct BeeLoop<R: BeeReceiver> {
    ctx: BeeContext,
    receiver: R,
    rx: mpsc::Receiver<BeeCommand>,
    state: watch::Sender<BeeState>,
    qee: mpsc::Sender<QeeCommand>,
    /// Wait for [`BeeCommand::Activate`] before running
    joining: bool,
}

impl<R: BeeReceiver> BeeLoop<R> {
    /// Start a bee task with an inbox of `depth` messages
    pub(crate) fn spawn(
        ctx: BeeContext,
        receiver: R,
        depth: usize,
        detached: bool,
        qee: mpsc::Sender<QeeCommand>,
    ) -> BeeHandle {
        Self::launch(ctx, receiver, depth, detached, false, qee)
    }

    /// Start a bee that stays `Joining` until its cells are assigned
    ///
    /// `Activate` lets it run; `Drain` or a dropped handle stops it without
    /// ever calling the receiver.
    pub(crate) fn spawn_joining(
        ctx: BeeContext,
        receiver: R,
        depth: usize,
        qee: mpsc::Sender<QeeCommand>,
    ) -> BeeHandle {
        Self::launch(ctx, receiver, depth, false, true, qee)
    }

    fn launch(
        ctx: BeeContext,
        receiver: R,
        depth: usize,
        detached: bool,
        joining: bool,
        qee: mpsc::Sender<QeeCommand>,
    ) -> BeeHandle {
        assert!(depth > 0, "bee inbox depth must be positive");

        let (tx, rx) = mpsc::channel(depth);
        let (state, state_rx) = watch::channel(BeeState::Created);
        let id = ctx.id().clone();
        let bee = Self {
            ctx,
            receiver,
            rx,
            state,
            qee,
            joining,
        };
        let task = tokio::spawn(bee.run());

        BeeHandle {
            id,
            detached,
            tx,
            state: state_rx,
            task,
        }
    }

    fn set_state(&self, next: BeeState) {
        let current = *self.state.borrow();
        debug_assert!(
            current.can_transition_to(next),
            "invalid bee transition {} -> {}",
            current,
            next
        );
        self.state.send_replace(next);
    }

    async fn run(mut self) {
        let id = self.ctx.id().clone();
        let mut early = Vec::new();
        if self.joining {
            self.set_state(BeeState::Joining);
            match self.join().await {
                Some(queued) => early = queued,
                None => {
                    self.set_state(BeeState::Stopped);
                    let _ = self.qee.try_send(QeeCommand::BeeStopped(id.clone()));
                    debug!(bee = %id, "Bee lost its cells");
                    return;
                }
            }
        }

        self.set_state(BeeState::Active);
        self.receiver.on_start(&self.ctx).await;
        debug!(bee = %id, "Bee started");

        for msg in early {
            self.process(msg).await;
        }

        while let Some(command) = self.rx.recv().await {
            match command {
                BeeCommand::Msg(msg) => self.process(msg).await,
                BeeCommand::Migrate { to, reply } => {
                    if *self.state.borrow() == BeeState::Draining {
                        let _ = reply.send(Err(Error::HiveStopped {
                            hive: self.ctx.hive_id().to_string(),
                        }));
                        continue;
                    }
                    match self.migrate(to).await {
                        Ok(new_id) => {
                            let _ = reply.send(Ok(new_id.clone()));
                            self.hand_off(new_id).await;
                            break;
                        }
                        Err(e) => {
                            warn!(bee = %id, to = %to, error = %e, "Migration aborted");
                            self.set_state(BeeState::Active);
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                BeeCommand::Activate => {}
                BeeCommand::Drain => {
                    if *self.state.borrow() == BeeState::Active {
                        self.set_state(BeeState::Draining);
                        self.rx.close();
                    }
                }
            }
        }

        // Every sender dropped without a drain.
        if *self.state.borrow() == BeeState::Active {
            self.set_state(BeeState::Draining);
        }
        self.set_state(BeeState::Stopped);
        self.receiver.on_stop(&self.ctx).await;
        // The qee may be stopping and not reading; it notices closed inboxes too.
        let _ = self.qee.try_send(QeeCommand::BeeStopped(id.clone()));
        debug!(bee = %id, "Bee stopped");
    }

    /// Wait for the assignment; `None` when the bee lost it
    ///
    /// Messages arriving meanwhile are kept for after activation.
    async fn join(&mut self) -> Option<Vec<Msg>> {
        let mut queued = Vec::new();
        loop {
            match self.rx.recv().await {
                Some(BeeCommand::Activate) => return Some(queued),
                Some(BeeCommand::Drain) | None => {
                    for msg in &queued {
                        self.ctx.inner().fail_msg(msg, Error::bee_not_found(self.ctx.id()));
                    }
                    return None;
                }
                Some(BeeCommand::Msg(msg)) => queued.push(msg),
                Some(BeeCommand::Migrate { reply, .. }) => {
                    let reason = format!("bee {} is still joining", self.ctx.id());
                    let _ = reply.send(Err(Error::invalid_message(reason)));
                }
            }
        }
    }

    async fn process(&mut self, msg: Msg) {
        let hive = Arc::clone(self.ctx.inner());
        let tx = Transaction::begin(self.ctx.id().clone(), Arc::clone(&hive.store));
        let mut rcv = RcvContext::new(self.ctx.clone(), tx);

        let result = self.receiver.receive(&msg, &mut rcv).await;
        let (mut tx, outbox) = rcv.into_parts();

        if let Err(e) = result {
            tx.abort();
            debug!(bee = %self.ctx.id(), msg = msg.id(), error = %e, "Handler failed");
            hive.fail_msg(&msg, e);
            return;
        }

        match tx.commit().await {
            Ok(ops) => {
                if !ops.is_empty() {
                    hive.replicate(self.ctx.id(), ops).await;
                }
                for outgoing in outbox {
                    if let Err(e) = hive.deliver(outgoing).await {
                        debug!(bee = %self.ctx.id(), error = %e, "Outgoing message dropped");
                    }
                }
            }
            Err(e) => {
                error!(bee = %self.ctx.id(), msg = msg.id(), error = %e, "Commit failed");
                hive.fail_msg(&msg, e);
            }
        }
    }

    /// Move state and ownership to `to`; returns the new master id
    async fn migrate(&mut self, to: HiveId) -> Result<BeeId> {
        let id = self.ctx.id().clone();
        if !self.receiver.can_migrate() {
            return Err(Error::invalid_message(format!("bee {} cannot migrate", id)));
        }
        if to == id.hive {
            return Err(Error::invalid_message(format!("bee {} is already on hive {}", id, to)));
        }

        self.set_state(BeeState::Migrating);
        let hive = Arc::clone(self.ctx.inner());
        let info = hive.registry.bee(&id).ok_or_else(|| Error::bee_not_found(&id))?;
        let new_id = id.moved_to(to);
        let colony = info.colony.with_master(new_id.clone());

        let snapshot = hive.store.export(&id).await?;
        info!(bee = %id, to = %to, entries = snapshot.len(), "Migrating bee");
        hive.transfer_state(to, new_id.clone(), colony.clone(), snapshot)
            .await?;

        let command = RegistryCommand::ReassignColony {
            bee: id.clone(),
            colony,
        };
        match hive.propose(&command).await? {
            RegistryResponse::Ok => Ok(new_id),
            RegistryResponse::NotFound => Err(Error::bee_not_found(&id)),
            other => Err(Error::fatal(format!("unexpected registry response {:?}", other))),
        }
    }

    /// Forward everything still queued to the new master and drop local state
    async fn hand_off(&mut self, new_id: BeeId) {
        let hive = Arc::clone(self.ctx.inner());
        self.rx.close();

        let mut forwarded = 0usize;
        while let Some(command) = self.rx.recv().await {
            match command {
                BeeCommand::Msg(msg) => {
                    let msg = msg.retarget(MsgTarget::Bee { id: new_id.clone() });
                    hive.forward(msg, new_id.hive).await;
                    forwarded += 1;
                }
                BeeCommand::Migrate { reply, .. } => {
                    let _ = reply.send(Err(Error::bee_not_found(self.ctx.id())));
                }
                BeeCommand::Activate | BeeCommand::Drain => {}
            }
        }

        if let Err(e) = hive.store.drop_state(self.ctx.id()).await {
            warn!(bee = %self.ctx.id(), error = %e, "Failed to drop migrated state");
        }
        info!(bee = %self.ctx.id(), to = %new_id, forwarded, "Bee migrated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use BeeState::*;

        assert!(Created.can_transition_to(Joining));
        assert!(Joining.can_transition_to(Active));
        assert!(Joining.can_transition_to(Stopped));
        assert!(Active.can_transition_to(Migrating));
        assert!(Migrating.can_transition_to(Active));
        assert!(Migrating.can_transition_to(Stopped));
        assert!(Active.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Stopped));

        assert!(!Stopped.can_transition_to(Active));
        assert!(!Draining.can_transition_to(Active));
        assert!(!Active.can_transition_to(Joining));
        assert!(!Joining.can_transition_to(Migrating));
    }

    #[test]
    fn test_running_states() {
        assert!(BeeState::Active.is_running());
        assert!(BeeState::Draining.is_running());
        assert!(!BeeState::Joining.is_running());
        assert!(!BeeState::Stopped.is_running());
        assert_eq!(BeeState::Migrating.to_string(), "migrating");
    }
}
