//! Registry error types
//!
//! TigerStyle: Explicit error variants with context.

use beehive_core::{BeeId, Error as CoreError, HiveId};
use thiserror::Error;

/// Registry and consensus errors
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    /// Hive not found in registry
    #[error("hive not found: {hive}")]
    HiveNotFound { hive: HiveId },

    /// Bee not found in registry
    #[error("bee not found: {bee}")]
    BeeNotFound { bee: BeeId },

    /// Cells resolve to more than one bee
    #[error("cells {cells} are owned by different bees: {bees}")]
    CellConflict { cells: String, bees: String },

    /// No leader is known to forward a proposal to
    #[error("no consensus leader is known")]
    NoLeader,

    /// Leadership changed while a proposal was pending
    #[error("leader changed while proposal {proposal} was pending")]
    LeaderChanged { proposal: String },

    /// Proposal was dropped before it could be appended
    #[error("proposal dropped: {reason}")]
    ProposalDropped { reason: String },

    /// Proposal or barrier did not commit in time
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Raft storage failed
    #[error("storage error: {reason}")]
    StorageError { reason: String },

    /// Persisted state could not be decoded
    #[error("corrupted state: {reason}")]
    Corrupted { reason: String },

    /// The consensus driver has stopped
    #[error("consensus stopped")]
    Stopped,

    /// Internal registry error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RegistryError {
    /// Create a bee not found error
    pub fn bee_not_found(bee: &BeeId) -> Self {
        Self::BeeNotFound { bee: bee.clone() }
    }

    /// Create a storage error
    pub fn storage(reason: impl std::fmt::Display) -> Self {
        Self::StorageError {
            reason: reason.to_string(),
        }
    }

    /// Create a corrupted state error
    pub fn corrupted(reason: impl std::fmt::Display) -> Self {
        Self::Corrupted {
            reason: reason.to_string(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error indicates a retriable condition
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NoLeader
                | Self::LeaderChanged { .. }
                | Self::ProposalDropped { .. }
                | Self::Timeout { .. }
        )
    }
}

impl From<RegistryError> for CoreError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::HiveNotFound { hive } => CoreError::hive_not_found(hive),
            RegistryError::BeeNotFound { bee } => CoreError::bee_not_found(bee),
            RegistryError::CellConflict { cells, bees } => CoreError::CellConflict { cells, bees },
            RegistryError::NoLeader => CoreError::NoLeader,
            RegistryError::LeaderChanged { proposal } => CoreError::LeaderChanged { proposal },
            RegistryError::ProposalDropped { reason } => CoreError::ProposalDropped { reason },
            RegistryError::Timeout {
                operation,
                timeout_ms,
            } => CoreError::Timeout {
                operation,
                timeout_ms,
            },
            RegistryError::StorageError { reason } => CoreError::Fatal {
                reason: format!("raft storage: {}", reason),
            },
            RegistryError::Corrupted { reason } => CoreError::StateCorrupted { reason },
            RegistryError::Stopped => CoreError::HiveStopped {
                hive: "consensus".into(),
            },
            RegistryError::Internal { message } => CoreError::Fatal { reason: message },
        }
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
