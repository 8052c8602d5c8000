//! Raft log entries and peer messages

use crate::node::{HiveInfo, MembershipChange};
use beehive_core::HiveId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a proposal so its waiter can be resolved when the entry applies
///
/// `incarnation` changes on every start of the consensus node, so entries
/// re-applied after a restart never resolve a new waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalTag {
    pub origin: HiveId,
    pub incarnation: u64,
    pub seq: u64,
}

impl fmt::Display for ProposalTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.origin, self.incarnation, self.seq)
    }
}

/// What a log entry carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryPayload {
    /// Leader no-op and barrier entries
    Empty,
    /// A JSON-encoded state machine command
    Command { data: Bytes },
    /// A voter set change
    Membership { change: MembershipChange },
}

/// One entry of the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub payload: EntryPayload,
    #[serde(default)]
    pub tag: Option<ProposalTag>,
}

/// Compacted state machine image plus the voter set at that point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_index: u64,
    pub last_term: u64,
    pub peers: Vec<HiveInfo>,
    pub data: Bytes,
}

/// Durable vote and commit state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<HiveId>,
    pub commit: u64,
}

/// A message between two consensus nodes, addressed by hive id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMessage {
    pub from: HiveId,
    pub to: HiveId,
    pub term: u64,
    pub body: RaftBody,
}

/// Consensus protocol bodies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaftBody {
    RequestVote {
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        granted: bool,
    },
    AppendEntries {
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<Entry>,
        leader_commit: u64,
    },
    /// On rejection `match_index` is a hint for the leader's next probe
    AppendEntriesResponse {
        success: bool,
        match_index: u64,
    },
    InstallSnapshot {
        snapshot: Snapshot,
    },
    InstallSnapshotResponse {
        last_index: u64,
    },
    /// A follower forwarding a proposal to the leader
    Propose {
        payload: EntryPayload,
        tag: ProposalTag,
    },
}

impl RaftBody {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestVote { .. } => "request_vote",
            Self::RequestVoteResponse { .. } => "request_vote_response",
            Self::AppendEntries { .. } => "append_entries",
            Self::AppendEntriesResponse { .. } => "append_entries_response",
            Self::InstallSnapshot { .. } => "install_snapshot",
            Self::InstallSnapshotResponse { .. } => "install_snapshot_response",
            Self::Propose { .. } => "propose",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raft_message_json_shape() {
        let msg = RaftMessage {
            from: HiveId(1),
            to: HiveId(2),
            term: 3,
            body: RaftBody::RequestVoteResponse { granted: true },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["body"]["type"], "request_vote_response");
        let back: RaftMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_entry_without_tag_decodes() {
        let json = r#"{"index":1,"term":1,"payload":{"kind":"empty"}}"#;
        let entry: Entry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.payload, EntryPayload::Empty);
        assert!(entry.tag.is_none());
    }
}
