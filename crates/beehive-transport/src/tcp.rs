//! TCP transport
//!
//! Wire protocol: [4-byte big-endian length][JSON WireBatch]
//!
//! Outbound connections are pooled per remote address, up to
//! `max_connections_per_host`, and used round robin. Each connection has a
//! writer task fed through a channel; every write is acknowledged back to
//! the sender so failures reach the caller.

use crate::codec::{encode_frame, read_frame};
use crate::error::{TransportError, TransportResult};
use crate::transport::{Transport, WireHandler};
use crate::wire::WireBatch;
use async_trait::async_trait;
use beehive_core::TransportConfig;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

/// Depth of each connection's write queue
const CONNECTION_QUEUE_DEPTH: usize = 128;

/// A frame plus the channel its write result goes to
type WriteRequest = (Bytes, oneshot::Sender<TransportResult<()>>);

#[derive(Debug)]
struct Connection {
    sender: mpsc::Sender<WriteRequest>,
}

impl Connection {
    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Pooled connections to one address
#[derive(Debug, Default)]
struct HostPool {
    connections: Vec<Arc<Connection>>,
    next: AtomicUsize,
}

impl HostPool {
    fn pick(&self) -> Option<Arc<Connection>> {
        if self.connections.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        Some(self.connections[i].clone())
    }
}

/// TCP-based transport for real network communication
#[derive(Debug)]
pub struct TcpTransport {
    local_addr: String,
    config: TransportConfig,
    pools: Arc<RwLock<HashMap<String, HostPool>>>,
    running: AtomicBool,
    shutdown_tx: RwLock<Option<broadcast::Sender<()>>>,
}

impl TcpTransport {
    /// Create a transport that will listen on `local_addr`
    pub fn new(local_addr: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            local_addr: local_addr.into(),
            config,
            pools: Arc::new(RwLock::new(HashMap::new())),
            running: AtomicBool::new(false),
            shutdown_tx: RwLock::new(None),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.connection_timeout_ms)
    }

    /// Number of open outbound connections to `addr`
    pub async fn connection_count(&self, addr: &str) -> usize {
        let pools = self.pools.read().await;
        pools
            .get(addr)
            .map(|p| p.connections.iter().filter(|c| !c.is_closed()).count())
            .unwrap_or(0)
    }

    /// A connection to `addr`, dialing a new one while the pool has room
    async fn connection(&self, addr: &str) -> TransportResult<Arc<Connection>> {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(addr) {
                if pool.connections.len() >= self.config.max_connections_per_host {
                    if let Some(conn) = pool.pick().filter(|c| !c.is_closed()) {
                        return Ok(conn);
                    }
                }
            }
        }

        let conn = Arc::new(self.dial(addr).await?);

        let mut pools = self.pools.write().await;
        let pool = pools.entry(addr.to_string()).or_default();
        pool.connections.retain(|c| !c.is_closed());
        if pool.connections.len() >= self.config.max_connections_per_host {
            // Lost a race with another dialer; the new connection closes when dropped.
            if let Some(existing) = pool.pick().filter(|c| !c.is_closed()) {
                return Ok(existing);
            }
        }
        pool.connections.push(conn.clone());
        debug!(addr = addr, pooled = pool.connections.len(), "Connection pooled");
        Ok(conn)
    }

    async fn dial(&self, addr: &str) -> TransportResult<Connection> {
        let stream = tokio::time::timeout(self.timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connection_timeout_ms,
            })?
            .map_err(|e| TransportError::unreachable(addr, format!("connection failed: {}", e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(addr = addr, error = %e, "Failed to set TCP_NODELAY");
        }

        // Outbound connections only write; replies come back on the peer's own connection.
        let (_read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<WriteRequest>(CONNECTION_QUEUE_DEPTH);
        tokio::spawn(Self::writer_task(write_half, rx, addr.to_string(), self.timeout()));
        Ok(Connection { sender: tx })
    }

    /// Writer task - writes frames and reports each result
    async fn writer_task(
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::Receiver<WriteRequest>,
        target: String,
        timeout: Duration,
    ) {
        while let Some((frame, ack)) = rx.recv().await {
            let write = async {
                write_half.write_all(&frame).await?;
                write_half.flush().await
            };
            let result = match tokio::time::timeout(timeout, write).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(TransportError::io(&target, &e)),
                Err(_) => Err(TransportError::Timeout {
                    addr: target.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };
            let failed = result.is_err();
            if let Err(e) = &result {
                error!(addr = %target, error = %e, "Failed to write frame");
            }
            let _ = ack.send(result);
            if failed {
                break;
            }
        }
        debug!(addr = %target, "Writer task exiting");
    }

    /// Reader task - hands every frame of one inbound connection to the handler
    async fn reader_task(
        mut read_half: OwnedReadHalf,
        handler: Arc<dyn WireHandler>,
        peer: String,
        frame_size_bytes_max: usize,
    ) {
        loop {
            match read_frame(&mut read_half, frame_size_bytes_max, &peer).await {
                Ok(Some(batch)) => {
                    debug!(peer = %peer, messages = batch.len(), "Received batch");
                    handler.handle(batch).await;
                }
                Ok(None) => break,
                Err(TransportError::Codec { reason }) => {
                    // Framing is intact; only this batch is lost.
                    error!(peer = %peer, reason = %reason, "Failed to parse batch");
                }
                Err(e) => {
                    error!(peer = %peer, error = %e, "Failed to read frame");
                    break;
                }
            }
        }
        debug!(peer = %peer, "Reader task exiting");
    }

    /// Accept task - spawns a reader per inbound connection
    async fn accept_task(
        listener: TcpListener,
        handler: Arc<dyn WireHandler>,
        frame_size_bytes_max: usize,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let (read_half, _write_half) = stream.into_split();
                            let handler = handler.clone();
                            let mut reader_shutdown = shutdown_rx.resubscribe();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = Self::reader_task(read_half, handler, peer_addr.to_string(), frame_size_bytes_max) => {}
                                    _ = reader_shutdown.recv() => {}
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Accept task shutting down");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> &str {
        &self.local_addr
    }

    async fn start(&self, handler: Arc<dyn WireHandler>) -> TransportResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }

        let listener = match TcpListener::bind(&self.local_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(TransportError::io(&self.local_addr, &e));
            }
        };
        info!(addr = %self.local_addr, "TCP transport started");

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        tokio::spawn(Self::accept_task(
            listener,
            handler,
            self.config.frame_size_bytes_max,
            shutdown_rx,
        ));
        Ok(())
    }

    async fn send(&self, addr: &str, batch: &WireBatch) -> TransportResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped);
        }
        let frame = encode_frame(batch, self.config.frame_size_bytes_max)?;
        let conn = self.connection(addr).await?;

        let (ack_tx, ack_rx) = oneshot::channel();
        conn.sender
            .send((frame, ack_tx))
            .await
            .map_err(|_| TransportError::unreachable(addr, "connection closed"))?;
        ack_rx
            .await
            .map_err(|_| TransportError::unreachable(addr, "connection closed"))?
    }

    async fn stop(&self) -> TransportResult<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
        self.pools.write().await.clear();
        info!(addr = %self.local_addr, "TCP transport stopped");
        Ok(())
    }
}
