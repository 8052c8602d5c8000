//! Raft consensus for the registry
//!
//! [`raft`] holds the protocol as a pure state machine, [`driver`] runs it as
//! a tokio task, and [`storage`] persists it.

pub mod driver;
pub mod log;
pub mod message;
pub mod raft;
pub mod storage;

pub use driver::{spawn_consensus, ConsensusHandle, RaftSender};
pub use message::{Entry, EntryPayload, HardState, ProposalTag, RaftBody, RaftMessage, Snapshot};
pub use raft::{Applied, CoreConfig, RaftCore, RaftStatus, Ready, Role, StateMachine};
pub use storage::{FileRaftStorage, MemoryRaftStorage, PersistentState, RaftStorage};
