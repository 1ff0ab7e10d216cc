//! Common error types for the Poleshift sync engine.

use thiserror::Error;

/// Top-level error type for engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transient network failure (connection refused, timeout, 5xx).
    #[error("Network error: {0}")]
    Network(String),

    /// The remote service explicitly rejected a payload.
    #[error("Remote rejected request ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// Durable local store read or write failed.
    #[error("Local store error: {0}")]
    LocalStore(String),

    /// Work was stopped because connectivity is down.
    #[error("Offline")]
    Offline,

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether a retry loop may try the failed call again.
    ///
    /// Remote rejections are retried like transient failures: the remote
    /// does not tell us reliably whether a rejection is permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::RemoteRejected { .. })
    }

    /// Whether this error comes from the durable local store.
    pub fn is_local_store(&self) -> bool {
        matches!(self, Error::LocalStore(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("timeout".into()).is_retryable());
        assert!(Error::RemoteRejected {
            status: 422,
            message: "bad row".into()
        }
        .is_retryable());
        assert!(!Error::LocalStore("disk full".into()).is_retryable());
        assert!(!Error::Offline.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::RemoteRejected {
            status: 409,
            message: "duplicate".into(),
        };
        assert_eq!(err.to_string(), "Remote rejected request (409): duplicate");
    }
}
