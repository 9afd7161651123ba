//! Error types for the Skiff client

use serde::{Deserialize, Serialize};
use skiff_ssh::{EngineError, TransportError};
use std::fmt;
use thiserror::Error;

/// Kinds of error a session reports through [`crate::SessionEvent::Error`]
///
/// The absence of an error ("no error") is `None` / `Ok(())`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A connect attempt did not finish within its time budget
    TimeOut,
    /// The server actively refused the TCP connection
    ConnectionRefused,
    /// The host key is not in the trust store
    HostKeyUnknown,
    /// The host key differs from the trusted one
    HostKeyMismatch,
    /// No authentication method succeeded
    Authentication,
    /// The transport or protocol session ended unexpectedly
    UnexpectedShutdown,
}

impl ErrorKind {
    /// Whether a connect attempt failing this way may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TimeOut | ErrorKind::ConnectionRefused | ErrorKind::UnexpectedShutdown
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::TimeOut => "connection timed out",
            ErrorKind::ConnectionRefused => "connection refused",
            ErrorKind::HostKeyUnknown => "host key unknown",
            ErrorKind::HostKeyMismatch => "host key mismatch",
            ErrorKind::Authentication => "authentication failed",
            ErrorKind::UnexpectedShutdown => "unexpected shutdown",
        };
        f.write_str(text)
    }
}

/// Outcome of a failed connect operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// Every attempt failed; `kind` is the last attempt's failure
    #[error("{kind} after {attempts} attempt(s)")]
    Failed {
        /// Failure of the final attempt
        kind: ErrorKind,
        /// Attempts made, including the first
        attempts: u32,
    },

    /// The operation was abandoned by a disconnect or reset
    #[error("connect cancelled")]
    Cancelled,
}

impl ConnectError {
    /// Error kind of a failed (not cancelled) connect
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ConnectError::Failed { kind, .. } => Some(*kind),
            ConnectError::Cancelled => None,
        }
    }
}

/// Main error type for Skiff operations
#[derive(Debug, Error)]
pub enum SkiffError {
    /// Connect operation failed
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol engine errors
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Known hosts errors
    #[error("Known hosts error: {0}")]
    KnownHosts(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The client task is no longer running
    #[error("Client task has shut down")]
    ClientClosed,
}

impl From<TransportError> for SkiffError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connection(msg) => Self::Transport(msg),
            TransportError::Engine(e) => Self::Engine(e),
            TransportError::Io(e) => Self::Io(e),
            TransportError::UnsupportedKeyType => {
                Self::KnownHosts("unsupported host key type".to_string())
            }
            TransportError::KnownHosts(msg) => Self::KnownHosts(msg),
            TransportError::Configuration(msg) => Self::Configuration(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::TimeOut.is_retryable());
        assert!(ErrorKind::ConnectionRefused.is_retryable());
        assert!(ErrorKind::UnexpectedShutdown.is_retryable());
        assert!(!ErrorKind::Authentication.is_retryable());
        assert!(!ErrorKind::HostKeyMismatch.is_retryable());
        assert!(!ErrorKind::HostKeyUnknown.is_retryable());
    }

    #[test]
    fn test_connect_error_display() {
        let err = ConnectError::Failed {
            kind: ErrorKind::ConnectionRefused,
            attempts: 3,
        };
        assert_eq!(err.to_string(), "connection refused after 3 attempt(s)");
        assert_eq!(err.kind(), Some(ErrorKind::ConnectionRefused));
        assert_eq!(ConnectError::Cancelled.kind(), None);
    }

    #[test]
    fn test_transport_error_conversion() {
        let err: SkiffError = TransportError::KnownHosts("bad file".to_string()).into();
        assert!(matches!(err, SkiffError::KnownHosts(msg) if msg == "bad file"));

        let err: SkiffError = TransportError::Engine(EngineError::new(-18, "denied")).into();
        assert!(matches!(err, SkiffError::Engine(e) if e.code == -18));
    }
}
