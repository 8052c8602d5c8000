//! Beehive Core
//!
//! Core types, errors, and constants for the Beehive distributed actor runtime.
//!
//! # Overview
//!
//! Beehive partitions application state into cells, assigns every cell to
//! exactly one bee (actor), and routes each message to the bee that owns the
//! cells the message maps to. Ownership is kept consistent across hives by a
//! replicated registry.
//!
//! This crate holds the pieces every other crate shares: identifiers, the
//! message envelope and its codecs, cells, configuration, and the error
//! taxonomy.
//!
//! # TigerStyle
//!
//! - Explicit limits with big-endian naming (e.g., `DICT_KEY_SIZE_BYTES_MAX`)
//! - Explicit configuration passed to every constructor
//! - No recursion (bounded iteration only)

pub mod call;
pub mod cell;
pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod ids;
pub mod io;
pub mod message;
pub mod telemetry;

pub use call::{CallContext, CancelHandle};
pub use cell::{CellKey, MappedCells};
pub use codec::CodecRegistry;
pub use config::{HiveConfig, NodeConfig, RaftConfig, RaftStorageKind, RuntimeConfig, TransportConfig};
pub use constants::*;
pub use error::{Error, ErrorKind, RemoteError, Result, StatusClass};
pub use ids::{AppName, BeeId, BeeIdGen, HiveId};
pub use io::{ChaChaRngProvider, IoContext, RngProvider, TimeProvider, WallClockTime};
pub use message::{Message, Msg, MsgFrame, MsgSource, MsgTarget, Payload};
pub use telemetry::{init_telemetry, TelemetryConfig};
