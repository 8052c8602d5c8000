//! In-process transport for tests
//!
//! TigerStyle: Configurable network conditions with fault injection.
//!
//! Every [`MemoryTransport`] attached to the same [`MemoryNetwork`] can reach
//! the others by address. Batches still go through the JSON frame codec, so
//! anything that would not survive the wire fails here too.

use crate::codec::FRAME_HEADER_SIZE_BYTES;
use crate::error::{TransportError, TransportResult};
use crate::transport::{Transport, WireHandler};
use crate::wire::WireBatch;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct NetworkState {
    inboxes: HashMap<String, mpsc::UnboundedSender<WireBatch>>,
    /// Hives cut off from everyone
    unplugged: HashSet<String>,
    /// Pairs that cannot reach each other
    partitions: Vec<(String, String)>,
    /// Remaining sends to an address that fail before it is reachable again
    fail_budget: HashMap<String, u32>,
}

impl NetworkState {
    fn is_partitioned(&self, a: &str, b: &str) -> bool {
        self.partitions
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }
}

/// A shared in-memory network
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A transport listening on `addr`
    pub fn transport(&self, addr: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            addr: addr.into(),
            network: self.clone(),
            frame_size_bytes_max: beehive_core::WIRE_FRAME_SIZE_BYTES_MAX,
            delivery: Mutex::new(None),
        }
    }

    /// Cut `addr` off from every other hive
    pub fn unplug(&self, addr: &str) {
        self.lock().unplugged.insert(addr.to_string());
        info!(addr = addr, "Hive unplugged");
    }

    /// Reconnect an unplugged hive
    pub fn plug(&self, addr: &str) {
        self.lock().unplugged.remove(addr);
        info!(addr = addr, "Hive plugged back in");
    }

    /// Stop traffic between `a` and `b`
    pub fn partition(&self, a: &str, b: &str) {
        self.lock().partitions.push((a.to_string(), b.to_string()));
        info!(node_a = a, node_b = b, "Network partition created");
    }

    /// Remove every partition and reconnect every hive
    pub fn heal_all(&self) {
        let mut state = self.lock();
        state.partitions.clear();
        state.unplugged.clear();
        info!("All network partitions healed");
    }

    /// Fail the next `count` sends to `addr`
    pub fn fail_next(&self, addr: &str, count: u32) {
        self.lock().fail_budget.insert(addr.to_string(), count);
    }

    /// Whether a transport is listening on `addr`
    pub fn is_listening(&self, addr: &str) -> bool {
        self.lock().inboxes.contains_key(addr)
    }

    fn deliver(&self, from: &str, to: &str, batch: WireBatch) -> TransportResult<()> {
        let mut state = self.lock();
        if state.unplugged.contains(from) || state.unplugged.contains(to) {
            return Err(TransportError::unreachable(to, "unplugged"));
        }
        if state.is_partitioned(from, to) {
            return Err(TransportError::unreachable(to, "partitioned"));
        }
        if let Some(budget) = state.fail_budget.get_mut(to) {
            if *budget > 0 {
                *budget -= 1;
                return Err(TransportError::unreachable(to, "injected failure"));
            }
        }
        let inbox = state
            .inboxes
            .get(to)
            .ok_or_else(|| TransportError::unreachable(to, "connection refused"))?;
        inbox
            .send(batch)
            .map_err(|_| TransportError::unreachable(to, "connection reset"))
    }
}

/// Transport over a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryTransport {
    addr: String,
    network: MemoryNetwork,
    frame_size_bytes_max: usize,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryTransport {
    /// Limit the size of encoded batches
    pub fn with_frame_size_max(mut self, bytes: usize) -> Self {
        self.frame_size_bytes_max = bytes;
        self
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    fn delivery(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.delivery.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> &str {
        &self.addr
    }

    async fn start(&self, handler: Arc<dyn WireHandler>) -> TransportResult<()> {
        let mut delivery = self.delivery();
        if delivery.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<WireBatch>();
        {
            let mut state = self.network.lock();
            if state.inboxes.contains_key(&self.addr) {
                return Err(TransportError::unreachable(&self.addr, "address in use"));
            }
            state.inboxes.insert(self.addr.clone(), tx);
        }

        let addr = self.addr.clone();
        *delivery = Some(tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                handler.handle(batch).await;
            }
            debug!(addr = %addr, "Memory delivery task exiting");
        }));
        info!(addr = %self.addr, "Memory transport started");
        Ok(())
    }

    async fn send(&self, addr: &str, batch: &WireBatch) -> TransportResult<()> {
        let json = serde_json::to_vec(batch).map_err(TransportError::codec)?;
        if json.len() > self.frame_size_bytes_max {
            return Err(TransportError::FrameTooLarge {
                size: json.len() + FRAME_HEADER_SIZE_BYTES,
                limit: self.frame_size_bytes_max,
            });
        }
        let decoded: WireBatch = serde_json::from_slice(&json).map_err(TransportError::codec)?;
        self.network.deliver(&self.addr, addr, decoded)
    }

    async fn stop(&self) -> TransportResult<()> {
        self.network.lock().inboxes.remove(&self.addr);
        if let Some(task) = self.delivery().take() {
            task.abort();
        }
        info!(addr = %self.addr, "Memory transport stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::WireMessage;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect {
        batches: tokio::sync::Mutex<Vec<WireBatch>>,
    }

    #[async_trait]
    impl WireHandler for Collect {
        async fn handle(&self, batch: WireBatch) {
            self.batches.lock().await.push(batch);
        }
    }

    fn join(req: u64) -> WireBatch {
        WireBatch::single(
            "a:1",
            WireMessage::JoinRequest {
                req,
                addr: "a:1".into(),
            },
        )
    }

    async fn wait_for(handler: &Collect, count: usize) -> Vec<WireBatch> {
        for _ in 0..100 {
            let batches = handler.batches.lock().await.clone();
            if batches.len() >= count {
                return batches;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} batches", count);
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let network = MemoryNetwork::new();
        let a = network.transport("a:1");
        let b = network.transport("b:1");
        let handler = Arc::new(Collect::default());
        b.start(handler.clone()).await.unwrap();

        for req in 1..=3 {
            a.send("b:1", &join(req)).await.unwrap();
        }
        let batches = wait_for(&handler, 3).await;
        assert_eq!(batches, vec![join(1), join(2), join(3)]);
    }

    #[tokio::test]
    async fn test_unknown_addr_unreachable() {
        let network = MemoryNetwork::new();
        let a = network.transport("a:1");
        let err = a.send("nowhere:1", &join(1)).await.unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_unplug_and_fail_budget() {
        let network = MemoryNetwork::new();
        let a = network.transport("a:1");
        let b = network.transport("b:1");
        b.start(Arc::new(Collect::default())).await.unwrap();

        network.unplug("b:1");
        assert!(a.send("b:1", &join(1)).await.is_err());
        network.plug("b:1");
        assert!(a.send("b:1", &join(1)).await.is_ok());

        network.fail_next("b:1", 2);
        assert!(a.send("b:1", &join(1)).await.is_err());
        assert!(a.send("b:1", &join(1)).await.is_err());
        assert!(a.send("b:1", &join(1)).await.is_ok());

        network.partition("a:1", "b:1");
        assert!(a.send("b:1", &join(1)).await.is_err());
        network.heal_all();
        assert!(a.send("b:1", &join(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_releases_address() {
        let network = MemoryNetwork::new();
        let b = network.transport("b:1");
        b.start(Arc::new(Collect::default())).await.unwrap();
        assert!(matches!(
            b.start(Arc::new(Collect::default())).await,
            Err(TransportError::AlreadyStarted)
        ));
        b.stop().await.unwrap();
        assert!(!network.is_listening("b:1"));

        let again = network.transport("b:1");
        again.start(Arc::new(Collect::default())).await.unwrap();
        assert!(network.is_listening("b:1"));
    }

    #[tokio::test]
    async fn test_frame_limit() {
        let network = MemoryNetwork::new();
        let a = network.transport("a:1").with_frame_size_max(8);
        let err = a.send("b:1", &join(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    }
}
