//! # Client Errors
//!
//! Purpose: One error taxonomy for every client call, so callers can tell
//! expected cache outcomes (miss, exists) from infrastructure failures without
//! inspecting strings.
//!
//! ## Design Principles
//! 1. **Typed Outcomes**: `NotFound` and `KeyExists` are plain variants.
//! 2. **Retry Guidance**: `is_retryable` marks the failures a caller may retry
//!    against the same server later.
//! 3. **Context Over Codes**: Connection failures name the server and reason.

use thiserror::Error;

use mcache_common::{ProtocolError, Status};

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Key is not stored on its server.
    #[error("key not found")]
    NotFound,
    /// Key already exists, or its CAS version did not match.
    #[error("key exists")]
    KeyExists,
    /// No reply before the call's deadline.
    #[error("operation timed out")]
    Timeout,
    /// Server is unreachable, failed mid-request, or is still marked dead.
    #[error("connection to {server} failed: {reason}")]
    Connection { server: String, reason: String },
    /// Malformed frame, stream desync, or a request violating protocol limits.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Invalid server list or option value.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Any other non-success status returned by the server.
    #[error("server error: {0}")]
    Server(Status),
    /// Failure of the readiness poller itself.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Returns true when retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Timeout | ClientError::Connection { .. })
    }

    /// Returns true for a cache miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound)
    }

    /// Returns true when the key was already present (or the CAS was stale).
    pub fn is_key_exists(&self) -> bool {
        matches!(self, ClientError::KeyExists)
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        ClientError::Config(message.into())
    }

    /// Maps a non-success status word to its error kind.
    pub(crate) fn from_status(status: Status) -> Self {
        match status {
            Status::KeyNotFound => ClientError::NotFound,
            Status::KeyExists => ClientError::KeyExists,
            other => ClientError::Server(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_distinguishes_outcomes() {
        assert!(ClientError::from_status(Status::KeyNotFound).is_not_found());
        assert!(ClientError::from_status(Status::KeyExists).is_key_exists());
        assert!(matches!(
            ClientError::from_status(Status::NonNumeric),
            ClientError::Server(Status::NonNumeric)
        ));
    }

    #[test]
    fn retryable_kinds() {
        assert!(ClientError::Timeout.is_retryable());
        let dead = ClientError::Connection {
            server: "127.0.0.1:11211".to_string(),
            reason: "refused".to_string(),
        };
        assert!(dead.is_retryable());
        assert!(!ClientError::NotFound.is_retryable());
        assert!(!ClientError::Protocol(ProtocolError::EmptyKey).is_retryable());
        assert!(!ClientError::config("empty").is_retryable());
    }
}
