//! Outbound batching with retry and backoff
//!
//! TigerStyle: Bounded queues, explicit flush thresholds.
//!
//! Each remote host gets one raft batcher and `batchers_per_host` data
//! batchers, created on first use. Data for one bee always uses the same
//! batcher. A batcher collects items until it holds
//! `batch_size` of them or `batcher_timeout_ms` has passed since the first,
//! then writes them as one [`WireBatch`].
//!
//! Data batches are retried with exponential backoff and every item carries
//! a [`DeliveryReceipt`] that resolves with the final outcome. Raft batches
//! are sent once; Raft retransmits on its own.

use crate::backoff::RetryPolicy;
use crate::error::{TransportError, TransportResult};
use crate::transport::Transport;
use crate::wire::{WireBatch, WireMessage};
use beehive_core::TransportConfig;
use beehive_registry::RaftMessage;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of one outbound data item
#[derive(Debug)]
pub struct DeliveryReceipt {
    rx: oneshot::Receiver<TransportResult<()>>,
}

impl DeliveryReceipt {
    fn resolved(result: TransportResult<()>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Wait until the item was written or finally failed
    pub async fn wait(self) -> TransportResult<()> {
        self.rx.await.unwrap_or(Err(TransportError::Stopped))
    }
}

struct Item {
    message: WireMessage,
    ack: Option<oneshot::Sender<TransportResult<()>>>,
}

struct HostBatchers {
    raft: mpsc::Sender<Item>,
    data: Vec<mpsc::Sender<Item>>,
}

impl HostBatchers {
    fn data(&self, message: &WireMessage) -> &mpsc::Sender<Item> {
        &self.data[batcher_index(message, self.data.len())]
    }
}

/// Data batcher for `message` among `count`
///
/// Messages of one bee always share a batcher so they arrive in the order
/// they were queued. Traffic with no bee goes to the first batcher.
fn batcher_index(message: &WireMessage, count: usize) -> usize {
    debug_assert!(count > 0);
    match message.ordering_bee() {
        Some(bee) if count > 1 => {
            let mut hasher = DefaultHasher::new();
            bee.hash(&mut hasher);
            (hasher.finish() % count as u64) as usize
        }
        _ => 0,
    }
}

#[derive(Clone)]
struct BatcherSettings {
    transport: Arc<dyn Transport>,
    addr: String,
    batch_size: usize,
    timeout: Duration,
    retry: RetryPolicy,
}

/// Batches and streams outbound traffic to every remote host
pub struct Streamer {
    transport: Arc<dyn Transport>,
    config: TransportConfig,
    hosts: Mutex<HashMap<String, Arc<HostBatchers>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Streamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streamer")
            .field("local_addr", &self.transport.local_addr())
            .field("hosts", &self.lock_hosts().len())
            .finish()
    }
}

impl Streamer {
    pub fn new(transport: Arc<dyn Transport>, config: TransportConfig) -> Self {
        debug_assert!(config.batch_size > 0);
        debug_assert!(config.batchers_per_host > 0);
        Self {
            transport,
            config,
            hosts: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Underlying transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn lock_hosts(&self) -> MutexGuard<'_, HashMap<String, Arc<HostBatchers>>> {
        self.hosts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn host(&self, addr: &str) -> Arc<HostBatchers> {
        let mut hosts = self.lock_hosts();
        if let Some(host) = hosts.get(addr) {
            return host.clone();
        }

        let data_settings = BatcherSettings {
            transport: self.transport.clone(),
            addr: addr.to_string(),
            batch_size: self.config.batch_size,
            timeout: Duration::from_millis(self.config.batcher_timeout_ms),
            retry: RetryPolicy::from(&self.config),
        };
        let raft_settings = BatcherSettings {
            retry: RetryPolicy::none(),
            ..data_settings.clone()
        };

        let mut tasks = Vec::with_capacity(1 + self.config.batchers_per_host);
        let (raft, rx) = mpsc::channel(self.config.batch_size);
        tasks.push(tokio::spawn(run_batcher(raft_settings, rx)));
        let data = (0..self.config.batchers_per_host)
            .map(|_| {
                let (tx, rx) = mpsc::channel(self.config.batch_size);
                tasks.push(tokio::spawn(run_batcher(data_settings.clone(), rx)));
                tx
            })
            .collect();

        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(tasks);

        let host = Arc::new(HostBatchers { raft, data });
        hosts.insert(addr.to_string(), host.clone());
        debug!(addr = addr, "Batchers started");
        host
    }

    /// Queue a consensus message
    ///
    /// Dropped when the raft queue for `addr` is full.
    pub fn send_raft(&self, addr: &str, msg: RaftMessage) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let item = Item {
            message: WireMessage::Raft { msg },
            ack: None,
        };
        if self.host(addr).raft.try_send(item).is_err() {
            debug!(addr = addr, "Raft queue full, message dropped");
        }
    }

    /// Queue a message with retries; waits for queue space
    pub async fn send(&self, addr: &str, message: WireMessage) -> DeliveryReceipt {
        if self.stopped.load(Ordering::SeqCst) {
            return DeliveryReceipt::resolved(Err(TransportError::Stopped));
        }
        let batcher = self.host(addr).data(&message).clone();
        let (tx, rx) = oneshot::channel();
        let item = Item {
            message,
            ack: Some(tx),
        };
        if batcher.send(item).await.is_err() {
            return DeliveryReceipt::resolved(Err(TransportError::Stopped));
        }
        DeliveryReceipt { rx }
    }

    /// Queue a message and wait for the outcome
    pub async fn send_and_wait(&self, addr: &str, message: WireMessage) -> TransportResult<()> {
        self.send(addr, message).await.wait().await
    }

    /// Drop every batcher; queued items fail with `Stopped`
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.lock_hosts().clear();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_batcher(settings: BatcherSettings, mut rx: mpsc::Receiver<Item>) {
    while let Some(first) = rx.recv().await {
        let mut items = vec![first];
        let deadline = Instant::now() + settings.timeout;
        while items.len() < settings.batch_size {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) | Err(_) => break,
            }
        }
        flush(&settings, items).await;
    }
    debug!(addr = %settings.addr, "Batcher exiting");
}

async fn flush(settings: &BatcherSettings, items: Vec<Item>) {
    let mut acks = Vec::with_capacity(items.len());
    let mut messages = Vec::with_capacity(items.len());
    for item in items {
        messages.push(item.message);
        acks.push(item.ack);
    }
    let batch = WireBatch::new(settings.transport.local_addr(), messages);

    let mut attempt = 0;
    let result = loop {
        match settings.transport.send(&settings.addr, &batch).await {
            Ok(()) => break Ok(()),
            Err(e) if e.is_retriable() && settings.retry.should_retry(attempt) => {
                let delay = settings.retry.delay(attempt);
                debug!(addr = %settings.addr, attempt = attempt, delay_ms = delay.as_millis() as u64, error = %e, "Send failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = &result {
        if acks.iter().any(Option::is_some) {
            warn!(addr = %settings.addr, items = batch.len(), attempts = attempt + 1, error = %e, "Batch failed");
        } else {
            debug!(addr = %settings.addr, items = batch.len(), error = %e, "Raft batch dropped");
        }
    }
    for ack in acks.into_iter().flatten() {
        let _ = ack.send(result.clone());
    }
}
