//! Beehive Transport
//!
//! Moves consensus and application traffic between hives.
//!
//! # Overview
//!
//! - [`wire`] - Messages exchanged between hives
//! - [`codec`] - Length-prefixed JSON framing
//! - [`transport`] - The [`Transport`] seam, with [`TcpTransport`] and the
//!   in-process [`MemoryTransport`]
//! - [`streamer`] - Per-host batching with retry and backoff

pub mod backoff;
pub mod codec;
pub mod error;
pub mod memory;
pub mod streamer;
pub mod tcp;
pub mod transport;
pub mod wire;

pub use backoff::RetryPolicy;
pub use codec::{encode_frame, read_frame};
pub use error::{TransportError, TransportResult};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use streamer::{DeliveryReceipt, Streamer};
pub use tcp::TcpTransport;
pub use transport::{Transport, WireHandler};
pub use wire::{JoinAccepted, WireBatch, WireMessage};
