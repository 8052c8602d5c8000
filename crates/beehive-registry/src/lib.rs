//! Beehive Registry
//!
//! Consistent ownership of cells across a Beehive cluster.
//!
//! # Overview
//!
//! The registry maps every cell to exactly one bee and every bee to the hive
//! hosting it. It is a deterministic state machine replicated by a Raft log:
//!
//! - [`consensus`] - Raft core, driver task and persistence
//! - [`registry`] - Registry commands, the state machine and its read view
//! - [`placement`] - Colonies, bee records and replica selection
//! - [`node`] - Hive identity and voter changes

pub mod consensus;
pub mod error;
pub mod node;
pub mod placement;
pub mod registry;

pub use consensus::{
    spawn_consensus, ConsensusHandle, FileRaftStorage, MemoryRaftStorage, RaftMessage, RaftSender,
    RaftStatus, RaftStorage, Role,
};
pub use error::{RegistryError, RegistryResult};
pub use node::{HiveInfo, MembershipChange};
pub use placement::{select_replica_nodes, AssignmentPolicy, BeeInfo, Colony, FirstCommitWins};
pub use registry::{
    Registry, RegistryCommand, RegistryEvent, RegistryMachine, RegistryResponse, RegistryState,
};

/// Consensus handle driving the registry
pub type RegistryConsensus = ConsensusHandle<RegistryMachine>;
