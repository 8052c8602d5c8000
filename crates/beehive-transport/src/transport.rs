//! The transport seam

use crate::error::TransportResult;
use crate::wire::WireBatch;
use async_trait::async_trait;
use std::sync::Arc;

/// Receives batches that arrive from other hives
///
/// Batches from one connection are handed over one at a time and in order.
#[async_trait]
pub trait WireHandler: Send + Sync {
    async fn handle(&self, batch: WireBatch);
}

/// Moves batches between hives
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Address this hive listens on
    fn local_addr(&self) -> &str;

    /// Start accepting batches and hand them to `handler`
    async fn start(&self, handler: Arc<dyn WireHandler>) -> TransportResult<()>;

    /// Write one batch to `addr`
    ///
    /// Returns once the batch has been written; delivery to the remote
    /// handler is not acknowledged.
    async fn send(&self, addr: &str, batch: &WireBatch) -> TransportResult<()>;

    /// Stop accepting and drop every connection
    async fn stop(&self) -> TransportResult<()>;
}
