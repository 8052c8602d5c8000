//! Beehive Storage
//!
//! Per-bee dictionary storage for the Beehive actor runtime.
//!
//! # Overview
//!
//! Each bee owns a set of named dictionaries. Handlers read and write them
//! through a [`Transaction`] that commits when the handler succeeds and is
//! discarded when it fails. Committed ops are returned so masters can ship
//! them to their slaves.
//!
//! The [`StateStore`] trait is the storage seam; [`MemoryStore`] is the
//! in-memory implementation.

pub mod dictionary;
pub mod kv;
pub mod memory;
pub mod transaction;

pub use dictionary::Dictionary;
pub use kv::{DictOp, SnapshotEntry, StateSnapshot, StateStore};
pub use memory::MemoryStore;
pub use transaction::{Transaction, TransactionState};
