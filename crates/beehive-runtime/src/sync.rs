//! Tables of callers waiting for an answer
//!
//! A waiter is registered before its request leaves the hive and resolved
//! when the answer arrives, locally or over the wire. A waiter whose caller
//! gave up is removed by its [`WaiterGuard`].

use beehive_core::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::debug;

type Pending<T> = HashMap<u64, oneshot::Sender<Result<T>>>;

/// Waiters keyed by a hive-local id
#[derive(Debug)]
pub struct Waiters<T> {
    name: &'static str,
    next: AtomicU64,
    pending: Mutex<Pending<T>>,
}

impl<T> Waiters<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending<T>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a waiter; the id travels with the request
    pub fn register(self: &Arc<Self>) -> (WaiterGuard<T>, oneshot::Receiver<Result<T>>) {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        let guard = WaiterGuard {
            id,
            waiters: Arc::clone(self),
        };
        (guard, rx)
    }

    /// Hand `result` to waiter `id`; false if it is gone
    pub fn resolve(&self, id: u64, result: Result<T>) -> bool {
        let Some(tx) = self.lock().remove(&id) else {
            debug!(table = self.name, waiter = id, "Answer for unknown waiter dropped");
            return false;
        };
        tx.send(result).is_ok()
    }

    /// Fail every pending waiter
    pub fn fail_all(&self, error: impl Fn() -> Error) {
        let pending = std::mem::take(&mut *self.lock());
        for (_, tx) in pending {
            let _ = tx.send(Err(error()));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }
}

/// Removes its waiter when dropped
#[derive(Debug)]
pub struct WaiterGuard<T> {
    id: u64,
    waiters: Arc<Waiters<T>>,
}

impl<T> WaiterGuard<T> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Drop for WaiterGuard<T> {
    fn drop(&mut self) {
        self.waiters.remove(self.id);
    }
}
