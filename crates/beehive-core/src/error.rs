//! Error types for Beehive
//!
//! TigerStyle: Explicit error types with context, using thiserror.
//!
//! Every variant belongs to exactly one [`ErrorKind`]. Callers branch on the
//! kind, front-ends map the kind to a response class, and retry loops use
//! [`Error::is_retriable`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Beehive operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by every crate in the workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Absent bee, hive, app, or dictionary key. An expected outcome of a miss.
    NotFound,
    /// A message's cells resolve to more than one bee
    Conflict,
    /// No quorum, no leader, or an unreachable peer. Retryable.
    Unavailable,
    /// The caller's deadline expired or the call was cancelled. Retryable.
    Timeout,
    /// Malformed message or missing capability
    InvalidArgument,
    /// Local state is corrupted or an irrecoverable I/O error occurred
    Fatal,
    /// Error returned by application handler code
    Application,
}

/// Response class for external-facing adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Missing data: reply empty / not found
    NotFound,
    /// Malformed request: client error
    ClientError,
    /// Transient failure: the client may retry
    Retry,
    /// Internal resolution failure: server error
    ServerError,
}

impl ErrorKind {
    /// Map this kind to a front-end response class
    pub fn status_class(&self) -> StatusClass {
        match self {
            Self::NotFound => StatusClass::NotFound,
            Self::InvalidArgument => StatusClass::ClientError,
            Self::Unavailable | Self::Timeout => StatusClass::Retry,
            Self::Conflict | Self::Fatal | Self::Application => StatusClass::ServerError,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::InvalidArgument => "invalid_argument",
            Self::Fatal => "fatal",
            Self::Application => "application",
        };
        f.write_str(name)
    }
}

/// Beehive error types
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Not Found
    // =========================================================================
    #[error("Bee not found: {id}")]
    BeeNotFound { id: String },

    #[error("Hive not found: {id}")]
    HiveNotFound { id: String },

    #[error("Application not found: {name}")]
    AppNotFound { name: String },

    #[error("Key not found: {dict}/{key}")]
    KeyNotFound { dict: String, key: String },

    // =========================================================================
    // Conflict
    // =========================================================================
    #[error("Cells {cells} are owned by different bees: {bees}")]
    CellConflict { cells: String, bees: String },

    // =========================================================================
    // Unavailable
    // =========================================================================
    #[error("No consensus leader is known")]
    NoLeader,

    #[error("Consensus leader changed while proposal {proposal} was pending")]
    LeaderChanged { proposal: String },

    #[error("Proposal dropped: {reason}")]
    ProposalDropped { reason: String },

    #[error("Hive unreachable: {hive}, reason: {reason}")]
    HiveUnreachable { hive: String, reason: String },

    #[error("Mailbox full: {id}, depth: {depth}, max: {max}")]
    MailboxFull { id: String, depth: usize, max: usize },

    #[error("Hive is stopped: {hive}")]
    HiveStopped { hive: String },

    // =========================================================================
    // Timeout
    // =========================================================================
    #[error("Operation timed out: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    // =========================================================================
    // Invalid Argument
    // =========================================================================
    #[error("Cannot reply to message {msg_id}: sender accepts no replies")]
    NoReply { msg_id: u64 },

    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("Payload type mismatch: expected {expected}, found {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("No codec registered for message type {type_name}")]
    NoCodec { type_name: String },

    #[error("Invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Invalid identifier: {id}, reason: {reason}")]
    InvalidId { id: String, reason: String },

    #[error("Message too large: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    // =========================================================================
    // Fatal
    // =========================================================================
    #[error("Fatal error: {reason}")]
    Fatal { reason: String },

    #[error("State corrupted: {reason}")]
    StateCorrupted { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Application
    // =========================================================================
    #[error("Handler failed: {reason}")]
    Handler { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a bee not found error
    pub fn bee_not_found(id: impl ToString) -> Self {
        Self::BeeNotFound { id: id.to_string() }
    }

    /// Create a hive not found error
    pub fn hive_not_found(id: impl ToString) -> Self {
        Self::HiveNotFound { id: id.to_string() }
    }

    /// Create a key not found error
    pub fn key_not_found(dict: impl Into<String>, key: &[u8]) -> Self {
        Self::KeyNotFound {
            dict: dict.into(),
            key: String::from_utf8_lossy(key).into_owned(),
        }
    }

    /// Create a hive unreachable error
    pub fn hive_unreachable(hive: impl ToString, reason: impl Into<String>) -> Self {
        Self::HiveUnreachable {
            hive: hive.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an invalid message error
    pub fn invalid_message(reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            reason: reason.into(),
        }
    }

    /// Create a fatal error
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Create a handler error
    pub fn handler(reason: impl Into<String>) -> Self {
        Self::Handler {
            reason: reason.into(),
        }
    }

    /// Create a serialization error for a payload or frame
    pub fn serialization(reason: impl std::fmt::Display) -> Self {
        Self::InvalidMessage {
            reason: format!("serialization failed: {}", reason),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BeeNotFound { .. }
            | Self::HiveNotFound { .. }
            | Self::AppNotFound { .. }
            | Self::KeyNotFound { .. } => ErrorKind::NotFound,

            Self::CellConflict { .. } => ErrorKind::Conflict,

            Self::NoLeader
            | Self::LeaderChanged { .. }
            | Self::ProposalDropped { .. }
            | Self::HiveUnreachable { .. }
            | Self::MailboxFull { .. }
            | Self::HiveStopped { .. } => ErrorKind::Unavailable,

            Self::Timeout { .. } | Self::Cancelled { .. } => ErrorKind::Timeout,

            Self::NoReply { .. }
            | Self::InvalidMessage { .. }
            | Self::TypeMismatch { .. }
            | Self::NoCodec { .. }
            | Self::InvalidConfiguration { .. }
            | Self::InvalidId { .. }
            | Self::MessageTooLarge { .. } => ErrorKind::InvalidArgument,

            Self::Fatal { .. } | Self::StateCorrupted { .. } | Self::Io(_) => ErrorKind::Fatal,

            Self::Handler { .. } | Self::Other(_) => ErrorKind::Application,
        }
    }

    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Unavailable | ErrorKind::Timeout)
    }

    /// Check if this error is a miss rather than a failure
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Flatten into a serializable form for delivery to a remote waiter
    pub fn to_remote(&self) -> RemoteError {
        RemoteError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// An error that crossed a hive boundary
///
/// Only the kind and the rendered message survive the trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<RemoteError> for Error {
    fn from(remote: RemoteError) -> Self {
        let reason = remote.message;
        match remote.kind {
            ErrorKind::NotFound => Error::BeeNotFound { id: reason },
            ErrorKind::Conflict => Error::CellConflict {
                cells: reason,
                bees: String::new(),
            },
            ErrorKind::Unavailable => Error::ProposalDropped { reason },
            ErrorKind::Timeout => Error::Timeout {
                operation: reason,
                timeout_ms: 0,
            },
            ErrorKind::InvalidArgument => Error::InvalidMessage { reason },
            ErrorKind::Fatal => Error::Fatal { reason },
            ErrorKind::Application => Error::Handler { reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::bee_not_found("kv/1/42");
        assert!(err.to_string().contains("kv/1/42"));
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(Error::NoLeader.is_retriable());
        assert!(Error::timeout("sync", 100).is_retriable());
        assert!(!Error::bee_not_found("x").is_retriable());
        assert!(!Error::NoReply { msg_id: 1 }.is_retriable());
    }

    #[test]
    fn test_error_kinds_are_not_conflated() {
        assert_eq!(
            Error::key_not_found("d", b"k").kind().status_class(),
            StatusClass::NotFound
        );
        assert_eq!(
            Error::invalid_message("bad").kind().status_class(),
            StatusClass::ClientError
        );
        assert_eq!(
            Error::fatal("disk").kind().status_class(),
            StatusClass::ServerError
        );
        assert_eq!(
            Error::CellConflict {
                cells: "a".into(),
                bees: "b".into()
            }
            .kind(),
            ErrorKind::Conflict
        );
    }

    #[test]
    fn test_remote_error_keeps_kind() {
        let original = Error::timeout("process", 50);
        let restored: Error = original.to_remote().into();
        assert_eq!(restored.kind(), ErrorKind::Timeout);
        assert!(restored.is_retriable());
    }

    #[test]
    fn test_anyhow_errors_are_application_errors() {
        let err: Error = anyhow::anyhow!("boom").into();
        assert_eq!(err.kind(), ErrorKind::Application);
    }
}
