//! The hive: one node of a beehive cluster
//!
//! TigerStyle: Every message enters through one control loop, every
//! ownership decision goes through the registry.
//!
//! A [`Hive`] hosts one qee per installed app and the bees those qees
//! create. It keeps a replica of the registry through consensus, talks to
//! other hives through the [`Streamer`], and answers synchronous callers
//! through its reply table.
//!
//! ```text
//!   process/emit --> data inbox --+
//!   wire Data ------------------->+--> control loop --> qee (per app) --> bees
//!   control commands ------------>+
//! ```

use crate::app::App;
use crate::bee::BeeState;
use crate::context::Outgoing;
use crate::control::{self, ControlCommand};
use crate::meta::HiveMeta;
use crate::network::{AddressBook, Inbound, RaftOutbox};
use crate::qee::{Qee, QeeCommand, QeeHandle};
use crate::replication::{replication_app, HiveJoined, HiveLeft, RandomReplication, ReplicationStrategy};
use crate::sync::Waiters;
use beehive_core::{
    AppName, BeeId, BeeIdGen, CallContext, CodecRegistry, Error, HiveConfig, HiveId, IoContext,
    Message, Msg, MsgSource, MsgTarget, RaftStorageKind, Result,
};
use beehive_registry::consensus::{CoreConfig, RaftCore};
use beehive_registry::{
    spawn_consensus, Colony, FileRaftStorage, HiveInfo, MemoryRaftStorage, RaftStatus,
    RaftStorage, Registry, RegistryCommand, RegistryConsensus, RegistryEvent, RegistryMachine,
    RegistryResponse,
};
use beehive_storage::{DictOp, MemoryStore, StateSnapshot, StateStore};
use beehive_transport::{
    JoinAccepted, RetryPolicy, Streamer, TcpTransport, Transport, WireMessage,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// =============================================================================
// HiveInner
// =============================================================================

/// State shared by the control loop, qees, bees and the network handler
pub(crate) struct HiveInner {
    pub(crate) id: HiveId,
    pub(crate) info: HiveInfo,
    pub(crate) config: HiveConfig,
    pub(crate) io: IoContext,
    pub(crate) codecs: Arc<CodecRegistry>,
    pub(crate) registry: Registry,
    pub(crate) consensus: RegistryConsensus,
    pub(crate) streamer: Arc<Streamer>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) addresses: Arc<AddressBook>,
    pub(crate) replies: Arc<Waiters<Msg>>,
    pub(crate) migrations: Arc<Waiters<()>>,
    pub(crate) bee_ids: BeeIdGen,
    pub(crate) replication: Arc<dyn ReplicationStrategy>,
    pub(crate) cmd_tx: mpsc::Sender<ControlCommand>,
    apps: HashMap<AppName, Arc<App>>,
    /// Apps handling each message type
    routes: HashMap<String, Vec<AppName>>,
    qees: RwLock<HashMap<AppName, QeeHandle>>,
    /// Detached bees started by this run of the hive
    detached: Mutex<HashSet<BeeId>>,
    data_tx: mpsc::Sender<Msg>,
    msg_seq: AtomicU64,
    stopped: AtomicBool,
    raft_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for HiveInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HiveInner")
            .field("id", &self.id)
            .field("addr", &self.info.addr)
            .field("apps", &self.apps.len())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl HiveInner {
    pub(crate) fn next_msg_id(&self) -> u64 {
        self.msg_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Make sure `T` can cross the wire from this hive
    pub(crate) fn ensure_codec<T: Message>(&self) -> Result<()> {
        if self.codecs.contains(T::TYPE_NAME) {
            return Ok(());
        }
        self.codecs.register::<T>()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn stopped_error(&self) -> Error {
        Error::HiveStopped {
            hive: self.id.to_string(),
        }
    }

    /// Queue an application message for the control loop
    pub(crate) async fn enqueue_data(&self, msg: Msg) -> Result<()> {
        if self.is_stopped() {
            return Err(self.stopped_error());
        }
        self.data_tx
            .send(msg)
            .await
            .map_err(|_| self.stopped_error())
    }

    pub(crate) fn addr_of(&self, hive: HiveId) -> Option<String> {
        if hive == self.id {
            return Some(self.info.addr.clone());
        }
        self.addresses
            .get(hive)
            .or_else(|| self.registry.hive(hive).map(|h| h.addr))
    }

    fn qee(&self, app: &AppName) -> Option<mpsc::Sender<QeeCommand>> {
        let qees = self.qees.read().unwrap_or_else(|p| p.into_inner());
        qees.get(app).map(|q| q.tx.clone())
    }

    pub(crate) fn track_detached(&self, bee: &BeeId) {
        let mut detached = self.detached.lock().unwrap_or_else(|p| p.into_inner());
        detached.insert(bee.clone());
    }

    fn is_current_detached(&self, bee: &BeeId) -> bool {
        let detached = self.detached.lock().unwrap_or_else(|p| p.into_inner());
        detached.contains(bee)
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Hand a message to the qees that should see it
    pub(crate) async fn route(self: &Arc<Self>, msg: Msg) {
        if let Some(target) = msg.target_bee() {
            let app = target.app.clone();
            let hive = target.hive;
            match self.qee(&app) {
                Some(qee) => self.dispatch(qee, msg).await,
                None if hive != self.id => self.forward(msg, hive).await,
                None => self.fail_msg(&msg, Error::AppNotFound {
                    name: app.to_string(),
                }),
            }
            return;
        }

        let Some(apps) = self.routes.get(msg.type_name()) else {
            let reason = format!("no application handles {}", msg.type_name());
            self.fail_msg(&msg, Error::invalid_message(reason));
            return;
        };
        for app in apps {
            if let Some(qee) = self.qee(app) {
                self.dispatch(qee, msg.clone()).await;
            }
        }
    }

    async fn dispatch(&self, qee: mpsc::Sender<QeeCommand>, msg: Msg) {
        if let Err(mpsc::error::SendError(QeeCommand::Dispatch(msg))) =
            qee.send(QeeCommand::Dispatch(msg)).await
        {
            self.fail_msg(&msg, self.stopped_error());
        }
    }

    /// Send a message to the hive that can handle it
    pub(crate) async fn forward(self: &Arc<Self>, msg: Msg, hive: HiveId) {
        debug_assert_ne!(hive, self.id);
        let Some(addr) = self.addr_of(hive) else {
            self.fail_msg(&msg, Error::hive_not_found(hive));
            return;
        };
        let frame = match msg.to_frame(&self.codecs) {
            Ok(frame) => frame,
            Err(e) => {
                self.fail_msg(&msg, e);
                return;
            }
        };

        let message = WireMessage::Data {
            from: self.id,
            frames: vec![frame],
        };
        let receipt = self.streamer.send(&addr, message).await;
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = receipt.wait().await {
                inner.fail_msg(&msg, e.into());
            }
        });
    }

    /// Report a failed message to whoever waits for it
    pub(crate) fn fail_msg(&self, msg: &Msg, error: Error) {
        match msg.from() {
            MsgSource::Waiter { hive, waiter } => self.answer(*hive, *waiter, Err(error)),
            _ => warn!(
                hive = %self.id,
                msg = msg.id(),
                kind = msg.type_name(),
                error = %error,
                "Message failed"
            ),
        }
    }

    /// Resolve a synchronous caller, here or on another hive
    pub(crate) fn answer(&self, hive: HiveId, waiter: u64, result: Result<Msg>) {
        if hive == self.id {
            self.replies.resolve(waiter, result);
            return;
        }
        let Some(addr) = self.addr_of(hive) else {
            debug!(hive = %hive, waiter, "No address for waiting hive");
            return;
        };
        let result = match result {
            Ok(msg) => msg.to_frame(&self.codecs).map_err(|e| e.to_remote()),
            Err(e) => Err(e.to_remote()),
        };
        let streamer = Arc::clone(&self.streamer);
        tokio::spawn(async move {
            let message = WireMessage::Reply { waiter, result };
            if let Err(e) = streamer.send_and_wait(&addr, message).await {
                debug!(hive = %hive, waiter, error = %e, "Reply not delivered");
            }
        });
    }

    pub(crate) async fn deliver(&self, outgoing: Outgoing) -> Result<()> {
        match outgoing {
            Outgoing::Data(msg) => self.enqueue_data(msg).await,
            Outgoing::Answer { hive, waiter, msg } => {
                self.answer(hive, waiter, Ok(msg));
                Ok(())
            }
        }
    }

    fn emit_internal<T: Message>(&self, data: T) -> Msg {
        Msg::new(self.next_msg_id(), data, MsgSource::External, MsgTarget::Broadcast)
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Propose a registry command, retrying while the leader is unsettled
    pub(crate) async fn propose(&self, command: &RegistryCommand) -> Result<RegistryResponse> {
        let runtime = &self.config.runtime;
        let backoff_max = self.config.transport.backoff_max_ms.max(runtime.dispatch_backoff_ms);
        let policy = RetryPolicy::new(
            runtime.dispatch_backoff_ms,
            backoff_max,
            runtime.dispatch_retry_count_max.max(1),
        );

        let mut attempt = 0;
        loop {
            match self.consensus.propose(command).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let e = Error::from(e);
                    if !e.is_retriable() || !policy.should_retry(attempt) || self.is_stopped() {
                        return Err(e);
                    }
                    debug!(
                        hive = %self.id,
                        command = command.name(),
                        attempt,
                        error = %e,
                        "Retrying registry proposal"
                    );
                    self.io.sleep_ms(policy.delay_ms(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Ship a migrating bee's state to `to` and wait for the acknowledgement
    pub(crate) async fn transfer_state(
        &self,
        to: HiveId,
        bee: BeeId,
        colony: Colony,
        snapshot: StateSnapshot,
    ) -> Result<()> {
        let addr = self.addr_of(to).ok_or_else(|| Error::hive_not_found(to))?;
        let (guard, rx) = self.migrations.register();
        let message = WireMessage::MigrateState {
            req: guard.id(),
            bee,
            colony,
            snapshot,
        };
        self.streamer.send_and_wait(&addr, message).await?;

        let timeout_ms = self.config.raft.barrier_timeout_ms();
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.stopped_error()),
            Err(_) => Err(Error::timeout("migrate_state", timeout_ms)),
        }
    }

    /// Send committed writes of `bee` to its slaves; best-effort
    pub(crate) async fn replicate(&self, bee: &BeeId, ops: Vec<DictOp>) {
        let Some(info) = self.registry.bee(bee) else {
            return;
        };
        for slave in &info.colony.slaves {
            let Some(addr) = self.addr_of(slave.hive) else {
                debug!(bee = %bee, slave = %slave, "No address for slave hive");
                continue;
            };
            let message = WireMessage::Replicate {
                bee: slave.clone(),
                ops: ops.clone(),
            };
            // Slaves catch up on the next write; a lost batch is not retried.
            drop(self.streamer.send(&addr, message).await);
        }
    }

    pub(crate) async fn migrate_bee(&self, bee: BeeId, to: HiveId) -> Result<BeeId> {
        let qee = self.qee(&bee.app).ok_or_else(|| Error::AppNotFound {
            name: bee.app.to_string(),
        })?;
        let (reply, rx) = oneshot::channel();
        qee.send(QeeCommand::Migrate { bee, to, reply })
            .await
            .map_err(|_| self.stopped_error())?;
        rx.await.map_err(|_| self.stopped_error())?
    }

    pub(crate) async fn local_bees(&self, app: &AppName) -> Result<Vec<(BeeId, BeeState)>> {
        let qee = self.qee(app).ok_or_else(|| Error::AppNotFound {
            name: app.to_string(),
        })?;
        let (reply, rx) = oneshot::channel();
        qee.send(QeeCommand::Bees { reply })
            .await
            .map_err(|_| self.stopped_error())?;
        rx.await.map_err(|_| self.stopped_error())
    }

    /// Restart the bees the registry places on this hive
    pub(crate) async fn reload_state(&self) -> Result<()> {
        for info in self.registry.bees() {
            self.bee_ids.observe(&info.id);
            for slave in &info.colony.slaves {
                self.bee_ids.observe(slave);
            }
        }

        for hive in self.registry.hives() {
            self.addresses.insert(hive.id, hive.addr.clone());
            let msg = self.emit_internal(HiveJoined { hive: hive.id });
            self.enqueue_data(msg).await?;
        }

        let mut started = 0usize;
        for info in self.registry.bees_on_hive(self.id) {
            if info.detached {
                if !self.is_current_detached(&info.id) {
                    debug!(bee = %info.id, "Removing detached bee of an earlier run");
                    self.propose(&RegistryCommand::DeleteBee { bee: info.id }).await?;
                }
                continue;
            }
            let Some(qee) = self.qee(&info.app) else {
                warn!(bee = %info.id, app = %info.app, "Bee of an app not installed here");
                continue;
            };
            if qee.send(QeeCommand::StartBee(info)).await.is_err() {
                return Err(self.stopped_error());
            }
            started += 1;
        }
        info!(hive = %self.id, bees = started, "Reloaded hive state");
        Ok(())
    }

    fn save_meta(&self) {
        if !matches!(self.config.raft.storage, RaftStorageKind::File) {
            return;
        }
        let meta = HiveMeta {
            hive: self.info.clone(),
            peers: self.registry.hives(),
        };
        if let Err(e) = meta.save(&self.config.meta_path()) {
            warn!(hive = %self.id, error = %e, "Failed to save hive meta");
        }
    }

    async fn on_registry_event(&self, event: RegistryEvent) -> Result<()> {
        match event {
            RegistryEvent::HiveAdded(info) => {
                self.addresses.insert(info.id, info.addr.clone());
                self.save_meta();
                self.enqueue_data(self.emit_internal(HiveJoined { hive: info.id }))
                    .await?;
            }
            RegistryEvent::HiveRemoved(id) => {
                self.addresses.remove(id);
                self.save_meta();
                self.enqueue_data(self.emit_internal(HiveLeft { hive: id })).await?;
            }
            RegistryEvent::BeeMoved { from, to } if to.id.hive == self.id => {
                info!(hive = %self.id, from = %from, bee = %to.id, "Bee moved here");
                if let Some(qee) = self.qee(&to.app) {
                    let _ = qee.send(QeeCommand::StartBee(to)).await;
                }
            }
            RegistryEvent::BeeAdded(info) => self.bee_ids.observe(&info.id),
            RegistryEvent::Restored => self.reload_state().await?,
            RegistryEvent::BeeMoved { .. } | RegistryEvent::BeeDeleted(_) => {}
        }
        Ok(())
    }

    async fn pump_events(self: Arc<Self>, mut events: broadcast::Receiver<RegistryEvent>) {
        loop {
            let result = match events.recv().await {
                Ok(event) => self.on_registry_event(event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(hive = %self.id, skipped, "Registry events lagged, reloading");
                    self.reload_state().await
                }
                Err(RecvError::Closed) => break,
            };
            if let Err(e) = result {
                if self.is_stopped() {
                    break;
                }
                warn!(hive = %self.id, error = %e, "Registry event not handled");
            }
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    async fn stop_qee(&self, app: &AppName, mut handle: QeeHandle) {
        let runtime = &self.config.runtime;
        let wait = Duration::from_millis(runtime.qee_stop_wait_ms);

        for attempt in 0..runtime.qee_stop_retry_count.max(1) {
            let (reply, rx) = oneshot::channel();
            match handle.tx.try_send(QeeCommand::Stop { reply }) {
                Ok(()) => {
                    if tokio::time::timeout(wait, rx).await.is_ok() {
                        let _ = (&mut handle.task).await;
                        return;
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => self.io.sleep_ms(runtime.qee_stop_wait_ms).await,
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
            debug!(hive = %self.id, app = %app, attempt, "Qee still stopping");
        }

        warn!(hive = %self.id, app = %app, "Qee did not stop in time, aborting");
        handle.task.abort();
    }

    /// Stop every task of this hive; only the first call does anything
    pub(crate) async fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(hive = %self.id, "Stopping hive");

        let qees: Vec<(AppName, QeeHandle)> = {
            let mut qees = self.qees.write().unwrap_or_else(|p| p.into_inner());
            qees.drain().collect()
        };
        for (app, handle) in qees {
            self.stop_qee(&app, handle).await;
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        self.consensus.shutdown().await;
        let raft_task = self
            .raft_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(task) = raft_task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(hive = %self.id, "Consensus task panicked");
                }
            }
        }

        self.streamer.stop();
        if let Err(e) = self.transport.stop().await {
            warn!(hive = %self.id, error = %e, "Transport did not stop cleanly");
        }

        self.replies.fail_all(|| self.stopped_error());
        self.migrations.fail_all(|| self.stopped_error());
        info!(hive = %self.id, "Hive stopped");
        Ok(())
    }
}

// =============================================================================
// Hive
// =============================================================================

/// Handle to a running hive; clones share the same hive
#[derive(Clone)]
pub struct Hive {
    inner: Arc<HiveInner>,
}

impl fmt::Debug for Hive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hive")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.info.addr)
            .finish()
    }
}

impl Hive {
    pub(crate) fn from_inner(inner: Arc<HiveInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> HiveId {
        self.inner.id
    }

    pub fn addr(&self) -> &str {
        &self.inner.info.addr
    }

    /// Local replica of the registry
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn config(&self) -> &HiveConfig {
        &self.inner.config
    }

    /// Consensus role, term and known leader
    pub fn status(&self) -> RaftStatus {
        self.inner.consensus.status()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Broadcast `data` and wait for the first reply
    ///
    /// # Errors
    /// `Timeout` or `Cancelled` from `ctx`, the handler's error if the
    /// message failed, `HiveStopped` if the hive stops first.
    pub async fn process<T: Message>(&self, ctx: &CallContext, data: T) -> Result<Msg> {
        let inner = &self.inner;
        inner.ensure_codec::<T>()?;
        let (guard, rx) = inner.replies.register();
        let msg = Msg::new(
            inner.next_msg_id(),
            data,
            MsgSource::Waiter {
                hive: inner.id,
                waiter: guard.id(),
            },
            MsgTarget::Broadcast,
        );

        let result = ctx
            .run("process", async move {
                inner.enqueue_data(msg).await?;
                rx.await.map_err(|_| inner.stopped_error())?
            })
            .await;
        drop(guard);
        result
    }

    /// [`Hive::process`] and decode the reply as `R`
    pub async fn process_as<R: Message, T: Message>(&self, ctx: &CallContext, data: T) -> Result<R> {
        self.process(ctx, data).await?.data::<R>()
    }

    /// Broadcast `data` without waiting
    pub async fn emit<T: Message>(&self, data: T) -> Result<()> {
        self.inner.ensure_codec::<T>()?;
        let msg = Msg::new(
            self.inner.next_msg_id(),
            data,
            MsgSource::External,
            MsgTarget::Broadcast,
        );
        self.inner.enqueue_data(msg).await
    }

    /// Send `data` to one bee without waiting
    pub async fn send_to_bee<T: Message>(&self, data: T, to: &BeeId) -> Result<()> {
        self.inner.ensure_codec::<T>()?;
        let msg = Msg::new(
            self.inner.next_msg_id(),
            data,
            MsgSource::External,
            MsgTarget::Bee { id: to.clone() },
        );
        self.inner.enqueue_data(msg).await
    }

    /// Answer `msg` from outside any bee
    ///
    /// # Errors
    /// `NoReply` when the sender accepts no replies.
    pub async fn reply_to<T: Message>(&self, msg: &Msg, data: T) -> Result<()> {
        match msg.from() {
            MsgSource::External => Err(Error::NoReply { msg_id: msg.id() }),
            MsgSource::Bee { id } => self.send_to_bee(data, id).await,
            MsgSource::Waiter { hive, waiter } => {
                self.inner.ensure_codec::<T>()?;
                let reply = self.inner.emit_internal(data);
                self.inner.answer(*hive, *waiter, Ok(reply));
                Ok(())
            }
        }
    }

    async fn control<R>(&self, command: impl FnOnce(oneshot::Sender<Result<R>>) -> ControlCommand) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(command(reply))
            .await
            .map_err(|_| self.inner.stopped_error())?;
        rx.await.map_err(|_| self.inner.stopped_error())?
    }

    /// Move a bee and its state to hive `to`; returns the bee's new id
    pub async fn migrate_bee(&self, bee: &BeeId, to: HiveId) -> Result<BeeId> {
        let bee = bee.clone();
        self.control(|reply| ControlCommand::MigrateBee { bee, to, reply })
            .await
    }

    /// Wait until this hive's registry reflects everything committed so far
    pub async fn sync(&self) -> Result<()> {
        self.control(|reply| ControlCommand::Sync { reply }).await
    }

    /// Check that the control loop is responsive
    pub async fn ping(&self) -> Result<()> {
        self.control(|reply| ControlCommand::Ping { reply }).await
    }

    /// Hives currently in the registry
    pub async fn live_hives(&self) -> Result<Vec<HiveInfo>> {
        self.control(|reply| ControlCommand::LiveHives { reply }).await
    }

    /// Reserve a hive id for `addr`
    pub async fn new_hive_id(&self, addr: impl Into<String>) -> Result<HiveId> {
        let addr = addr.into();
        self.control(|reply| ControlCommand::NewHiveId { addr, reply })
            .await
    }

    /// Record a hive in the registry without making it a voter
    pub async fn add_hive(&self, info: HiveInfo) -> Result<()> {
        self.control(|reply| ControlCommand::AddHive { info, reply })
            .await
    }

    /// Permanently drop hive `id`; slaves of the bees it mastered take over
    ///
    /// # Errors
    /// `InvalidMessage` when `id` is this hive.
    pub async fn remove_hive(&self, id: HiveId) -> Result<()> {
        self.control(|reply| ControlCommand::RemoveHive { id, reply })
            .await
    }

    /// Bees of `app` running on this hive, with their lifecycle states
    ///
    /// Bees still waiting for their cells come last, in `Joining`.
    pub async fn local_bees(&self, app: &AppName) -> Result<Vec<(BeeId, BeeState)>> {
        self.inner.local_bees(app).await
    }

    /// Restart the bees the registry places on this hive
    pub async fn reload_state(&self) -> Result<()> {
        self.control(|reply| ControlCommand::ReloadState { reply })
            .await
    }

    /// Stop the hive; stopping twice is fine
    pub async fn stop(&self) -> Result<()> {
        if self.inner.is_stopped() {
            return Ok(());
        }
        match self.control(|reply| ControlCommand::Stop { reply }).await {
            Err(Error::HiveStopped { .. }) => Ok(()),
            other => other,
        }
    }
}

// =============================================================================
// HiveBuilder
// =============================================================================

type CodecInstaller = fn(&CodecRegistry) -> Result<()>;

fn install<T: Message>(codecs: &CodecRegistry) -> Result<()> {
    codecs.register::<T>()
}

/// Configures and starts a [`Hive`]
pub struct HiveBuilder {
    config: HiveConfig,
    io: Option<IoContext>,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn StateStore>>,
    raft_storage: Option<Arc<dyn RaftStorage>>,
    replication: Option<Arc<dyn ReplicationStrategy>>,
    apps: Vec<App>,
    codecs: Vec<CodecInstaller>,
}

impl fmt::Debug for HiveBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HiveBuilder")
            .field("addr", &self.config.node.addr)
            .field("apps", &self.apps.len())
            .finish()
    }
}

impl HiveBuilder {
    pub fn new(config: HiveConfig) -> Self {
        Self {
            config,
            io: None,
            transport: None,
            store: None,
            raft_storage: None,
            replication: None,
            apps: Vec::new(),
            codecs: Vec::new(),
        }
    }

    pub fn with_io(mut self, io: IoContext) -> Self {
        self.io = Some(io);
        self
    }

    /// Use `transport` instead of TCP
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the raft storage picked from the configuration
    pub fn with_raft_storage(mut self, storage: Arc<dyn RaftStorage>) -> Self {
        self.raft_storage = Some(storage);
        self
    }

    pub fn with_replication_strategy(mut self, strategy: Arc<dyn ReplicationStrategy>) -> Self {
        self.replication = Some(strategy);
        self
    }

    pub fn register_app(mut self, app: App) -> Self {
        self.apps.push(app);
        self
    }

    /// Make `T` known to the wire codec without handling it
    pub fn register_msg<T: Message>(mut self) -> Self {
        self.codecs.push(install::<T>);
        self
    }

    /// Start the hive: join or bootstrap the cluster, then start every app
    ///
    /// # Errors
    /// Invalid configuration or apps, transport start failures, persisted
    /// state that cannot be read, or a cluster that cannot be joined.
    pub async fn start(self) -> Result<Hive> {
        let HiveBuilder {
            config,
            io,
            transport,
            store,
            raft_storage,
            replication,
            mut apps,
            codecs: installers,
        } = self;

        config.validate()?;
        let io = io.unwrap_or_else(|| match config.runtime.rng_seed {
            Some(seed) => IoContext::seeded(seed),
            None => IoContext::production(),
        });

        // Apps and codecs
        apps.push(replication_app()?);
        let codecs = Arc::new(CodecRegistry::new());
        for installer in &installers {
            installer(&codecs)?;
        }
        let mut installed: HashMap<AppName, Arc<App>> = HashMap::new();
        let mut routes: HashMap<String, Vec<AppName>> = HashMap::new();
        for app in apps {
            app.install(&codecs)?;
            if installed.contains_key(app.name()) {
                return Err(Error::InvalidConfiguration {
                    field: format!("app.{}", app.name()),
                    reason: "application registered twice".into(),
                });
            }
            for type_name in app.type_names() {
                routes
                    .entry(type_name.to_string())
                    .or_default()
                    .push(app.name().clone());
            }
            installed.insert(app.name().clone(), Arc::new(app));
        }

        // Transport
        let addr = config.node.addr.clone();
        let transport = transport.unwrap_or_else(|| {
            Arc::new(TcpTransport::new(addr.clone(), config.transport.clone()))
        });
        let streamer = Arc::new(Streamer::new(Arc::clone(&transport), config.transport.clone()));
        let joins = Arc::new(Waiters::<JoinAccepted>::new("joins"));
        let inbound = Arc::new(Inbound::new(Arc::clone(&joins)));
        transport.start(inbound.clone()).await?;

        // Identity
        let raft_storage = raft_storage.unwrap_or_else(|| match config.raft.storage {
            RaftStorageKind::File => Arc::new(FileRaftStorage::new(config.raft_path())),
            RaftStorageKind::Memory => Arc::new(MemoryRaftStorage::new()),
        });
        let persisted = raft_storage.load()?;
        let meta = match config.raft.storage {
            RaftStorageKind::File => HiveMeta::load(&config.meta_path())?,
            RaftStorageKind::Memory => None,
        };
        let bootstrapping = meta.is_none() && config.node.peer_addrs.is_empty();
        let fresh = meta.is_none();
        let meta = match meta {
            Some(meta) => {
                info!(hive = %meta.hive, peers = meta.peers.len(), "Restarting hive");
                meta
            }
            None if bootstrapping => {
                info!(addr = %addr, "Bootstrapping new cluster");
                HiveMeta::bootstrap(addr.clone())
            }
            None => {
                let accepted = join_cluster(&config, &io, &streamer, &joins).await?;
                info!(hive = %accepted.hive, peers = accepted.peers.len(), "Joined cluster");
                HiveMeta {
                    hive: HiveInfo::new(accepted.hive, addr.clone()),
                    peers: accepted.peers,
                }
            }
        };
        let info = meta.hive.clone();
        let addresses = Arc::new(AddressBook::new());
        for peer in &meta.peers {
            addresses.insert(peer.id, peer.addr.clone());
        }

        // Registry and consensus
        let registry = Registry::new();
        let events = registry.subscribe();
        let machine = RegistryMachine::new(registry.clone());
        let core_config = CoreConfig::from(&config.raft);
        let rng = Arc::clone(&io.rng);
        let core = match persisted {
            Some(state) => RaftCore::restore(info.id, state, core_config, machine, rng)?,
            None if bootstrapping => {
                RaftCore::bootstrap(info.id, info.addr.clone(), core_config, machine, rng)
            }
            None => RaftCore::new(info.id, core_config, machine, rng),
        };
        let outbox = Arc::new(RaftOutbox::new(
            Arc::clone(&streamer),
            Arc::clone(&addresses),
            registry.clone(),
        ));
        let (consensus, raft_task) = spawn_consensus(core, raft_storage, outbox, &config.raft, &io);
        inbound.set_consensus(consensus.clone());
        consensus.barrier().await?;

        // Hive
        let (cmd_tx, cmd_rx) = mpsc::channel(config.node.cmd_channel_size);
        let (data_tx, data_rx) = mpsc::channel(config.node.data_channel_size);
        let replication = replication.unwrap_or_else(|| {
            Arc::new(RandomReplication::new(config.runtime.replication_query_timeout_ms))
        });
        let inner = Arc::new(HiveInner {
            id: info.id,
            info: info.clone(),
            bee_ids: BeeIdGen::new(info.id, 0),
            config,
            io,
            codecs,
            registry,
            consensus,
            streamer,
            transport,
            store: store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            addresses,
            replies: Arc::new(Waiters::new("replies")),
            migrations: Arc::new(Waiters::new("migrations")),
            replication,
            cmd_tx,
            apps: installed,
            routes,
            qees: RwLock::new(HashMap::new()),
            detached: Mutex::new(HashSet::new()),
            data_tx,
            msg_seq: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            raft_task: Mutex::new(Some(raft_task)),
            tasks: Mutex::new(Vec::new()),
        });
        inbound.set_hive(&inner);
        if fresh {
            inner.save_meta();
        }

        // Bee ids minted from here on must not collide with restored ones.
        for bee in inner.registry.bees() {
            inner.bee_ids.observe(&bee.id);
        }
        {
            let mut qees = inner.qees.write().unwrap_or_else(|p| p.into_inner());
            for (name, app) in &inner.apps {
                qees.insert(name.clone(), Qee::spawn(Arc::clone(app), Arc::clone(&inner)));
            }
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(Arc::clone(&inner).pump_events(events)));
        tasks.push(tokio::spawn(watch_leadership(Arc::clone(&inner))));
        inner
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(tasks);
        tokio::spawn(control::run(Arc::clone(&inner), cmd_rx, data_rx));

        let hive = Hive::from_inner(Arc::clone(&inner));
        hive.reload_state().await?;
        info!(hive = %info, apps = inner.apps.len(), "Hive started");
        Ok(hive)
    }
}

/// Ask the configured peers, in turn, to admit this hive
async fn join_cluster(
    config: &HiveConfig,
    io: &IoContext,
    streamer: &Streamer,
    joins: &Arc<Waiters<JoinAccepted>>,
) -> Result<JoinAccepted> {
    let policy = RetryPolicy::from(&config.transport);
    let timeout_ms = config.raft.barrier_timeout_ms();
    let mut last_error = Error::NoLeader;

    let mut attempt = 0;
    loop {
        for peer in &config.node.peer_addrs {
            let (guard, rx) = joins.register();
            let request = WireMessage::JoinRequest {
                req: guard.id(),
                addr: config.node.addr.clone(),
            };
            if let Err(e) = streamer.send_and_wait(peer, request).await {
                debug!(peer = %peer, error = %e, "Join request not delivered");
                last_error = e.into();
                continue;
            }
            match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
                Ok(Ok(Ok(accepted))) => return Ok(accepted),
                Ok(Ok(Err(e))) => {
                    debug!(peer = %peer, error = %e, "Join refused");
                    last_error = e;
                }
                Ok(Err(_)) => last_error = Error::fatal("join waiter dropped"),
                Err(_) => last_error = Error::timeout("join", timeout_ms),
            }
        }

        if !policy.should_retry(attempt) {
            warn!(peers = ?config.node.peer_addrs, error = %last_error, "Could not join cluster");
            return Err(last_error);
        }
        io.sleep_ms(policy.delay_ms(attempt)).await;
        attempt += 1;
    }
}

async fn watch_leadership(hive: Arc<HiveInner>) {
    let mut status = hive.consensus.subscribe();
    let mut was_leader = status.borrow().is_leader();
    while status.changed().await.is_ok() {
        let current = *status.borrow_and_update();
        if current.is_leader() && !was_leader {
            info!(hive = %hive.id, term = current.term, "Became registry leader");
        } else if !current.is_leader() && was_leader {
            info!(hive = %hive.id, term = current.term, leader = ?current.leader, "Lost registry leadership");
        }
        was_leader = current.is_leader();
    }
}
