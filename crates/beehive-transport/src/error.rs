//! Transport error types
//!
//! TigerStyle: Explicit error variants with context.

use beehive_core::Error as CoreError;
use thiserror::Error;

/// Transport errors
///
/// `Clone` so one failed batch can fail every delivery receipt in it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer could not be reached
    #[error("host {addr} unreachable: {reason}")]
    Unreachable { addr: String, reason: String },

    /// Dialing or writing took too long
    #[error("send to {addr} timed out after {timeout_ms}ms")]
    Timeout { addr: String, timeout_ms: u64 },

    /// A frame exceeds the configured limit
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    /// A frame could not be encoded or decoded
    #[error("codec error: {reason}")]
    Codec { reason: String },

    /// Socket error
    #[error("io error on {addr}: {reason}")]
    Io { addr: String, reason: String },

    /// Transport already started
    #[error("transport already started")]
    AlreadyStarted,

    /// Transport stopped or never started
    #[error("transport stopped")]
    Stopped,
}

impl TransportError {
    /// Create an unreachable error
    pub fn unreachable(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unreachable {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    /// Create an io error
    pub fn io(addr: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            addr: addr.into(),
            reason: err.to_string(),
        }
    }

    /// Create a codec error
    pub fn codec(reason: impl std::fmt::Display) -> Self {
        Self::Codec {
            reason: reason.to_string(),
        }
    }

    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::Timeout { .. } | Self::Io { .. }
        )
    }
}

impl From<TransportError> for CoreError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unreachable { addr, reason } => CoreError::HiveUnreachable { hive: addr, reason },
            TransportError::Io { addr, reason } => CoreError::HiveUnreachable { hive: addr, reason },
            TransportError::Timeout { addr, timeout_ms } => CoreError::Timeout {
                operation: format!("send to {}", addr),
                timeout_ms,
            },
            TransportError::FrameTooLarge { size, limit } => CoreError::MessageTooLarge { size, limit },
            TransportError::Codec { reason } => CoreError::InvalidMessage { reason },
            TransportError::AlreadyStarted | TransportError::Stopped => CoreError::HiveStopped {
                hive: "transport".into(),
            },
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use beehive_core::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = TransportError::unreachable("h2:7767", "unplugged");
        assert!(err.to_string().contains("h2:7767"));
    }

    #[test]
    fn test_error_retriable() {
        assert!(TransportError::unreachable("h", "x").is_retriable());
        assert!(!TransportError::codec("bad").is_retriable());
        assert!(!TransportError::Stopped.is_retriable());
    }

    #[test]
    fn test_conversion_keeps_kind() {
        let err: CoreError = TransportError::unreachable("h", "x").into();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        let err: CoreError = TransportError::FrameTooLarge { size: 2, limit: 1 }.into();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
