//! Messages exchanged between hives
//!
//! Every write on the wire is one [`WireBatch`]: the sender's address and an
//! ordered list of [`WireMessage`]s. Replies to requests go back to the
//! batch's `from_addr`.

use beehive_core::{BeeId, HiveId, MsgFrame, MsgSource, MsgTarget, RemoteError};
use beehive_registry::{Colony, HiveInfo, RaftMessage};
use beehive_storage::{DictOp, StateSnapshot};
use serde::{Deserialize, Serialize};

/// Result of a join request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAccepted {
    /// Id assigned to the joining hive
    pub hive: HiveId,
    /// Every voter, including the joining hive
    pub peers: Vec<HiveInfo>,
}

/// One message between hives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Consensus traffic
    Raft { msg: RaftMessage },

    /// Application messages, in emission order
    Data { from: HiveId, frames: Vec<MsgFrame> },

    /// Reply to a synchronous caller waiting on the receiving hive
    Reply {
        waiter: u64,
        result: Result<MsgFrame, RemoteError>,
    },

    /// Ask an existing hive to admit `addr` into the cluster
    JoinRequest { req: u64, addr: String },

    /// Answer to a [`WireMessage::JoinRequest`]
    JoinResponse {
        req: u64,
        result: Result<JoinAccepted, RemoteError>,
    },

    /// State of a bee moving to the receiving hive
    MigrateState {
        req: u64,
        bee: BeeId,
        colony: Colony,
        snapshot: StateSnapshot,
    },

    /// Answer to a [`WireMessage::MigrateState`]
    MigrateAck {
        req: u64,
        result: Result<(), RemoteError>,
    },

    /// Committed writes of a master, for one of its slaves
    Replicate { bee: BeeId, ops: Vec<DictOp> },
}

impl WireMessage {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Raft { .. } => "raft",
            Self::Data { .. } => "data",
            Self::Reply { .. } => "reply",
            Self::JoinRequest { .. } => "join_request",
            Self::JoinResponse { .. } => "join_response",
            Self::MigrateState { .. } => "migrate_state",
            Self::MigrateAck { .. } => "migrate_ack",
            Self::Replicate { .. } => "replicate",
        }
    }

    /// Whether this is consensus traffic
    pub fn is_raft(&self) -> bool {
        matches!(self, Self::Raft { .. })
    }

    /// Bee whose traffic must stay in order with this message
    ///
    /// Data goes by its target bee, or by the sending bee for broadcasts.
    /// `None` for traffic with no bee to order by.
    pub fn ordering_bee(&self) -> Option<&BeeId> {
        match self {
            Self::Data { frames, .. } => {
                let frame = frames.first()?;
                match (&frame.to, &frame.from) {
                    (MsgTarget::Bee { id }, _) => Some(id),
                    (MsgTarget::Broadcast, MsgSource::Bee { id }) => Some(id),
                    (MsgTarget::Broadcast, _) => None,
                }
            }
            Self::MigrateState { bee, .. } | Self::Replicate { bee, .. } => Some(bee),
            _ => None,
        }
    }
}

/// Unit written to and read from the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireBatch {
    /// Listen address of the sending hive
    pub from_addr: String,
    pub messages: Vec<WireMessage>,
}

impl WireBatch {
    pub fn new(from_addr: impl Into<String>, messages: Vec<WireMessage>) -> Self {
        Self {
            from_addr: from_addr.into(),
            messages,
        }
    }

    /// A batch holding one message
    pub fn single(from_addr: impl Into<String>, message: WireMessage) -> Self {
        Self::new(from_addr, vec![message])
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
