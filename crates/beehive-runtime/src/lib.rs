//! Beehive Runtime
//!
//! Hives, dispatch engines and bees of the Beehive actor runtime.
//!
//! # Overview
//!
//! The runtime provides:
//! - [`Hive`]: a cluster node, started with [`HiveBuilder`]
//! - [`App`]: handlers mapping messages to cells and processing them
//! - One dispatch engine per app, placing cells on bees through the registry
//! - Bees that process one message at a time in a dictionary transaction
//! - Slave replication and live bee migration between hives
//!
//! # TigerStyle
//! - A cell has exactly one owner, decided by consensus
//! - Explicit lifecycle states
//! - Bounded queues everywhere (no silent message drops)

pub mod app;
pub mod bee;
pub mod context;
mod control;
pub mod hive;
pub mod mailbox;
pub mod meta;
mod network;
mod qee;
pub mod replication;
pub mod sync;

pub use app::{App, DetachedHandler, Handler, MapContext};
pub use bee::BeeState;
pub use context::{BeeContext, RcvContext};
pub use hive::{Hive, HiveBuilder};
pub use mailbox::Mailbox;
pub use meta::HiveMeta;
pub use replication::{
    HiveJoined, HiveLeft, RandomReplication, ReplicationQuery, ReplicationReply,
    ReplicationStrategy,
};
