//! SSH-specific error types

use thiserror::Error;
use std::io;

/// libssh2's "would block" return code (`LIBSSH2_ERROR_EAGAIN`)
pub const ERROR_EAGAIN: i32 = -37;

/// Error reported by a protocol engine call
///
/// Carries the engine's numeric code and human-readable message, the pair
/// the session keeps as its "last error".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("engine error {code}: {message}")]
pub struct EngineError {
    /// Engine-defined error code
    pub code: i32,
    /// Engine-provided message
    pub message: String,
}

impl EngineError {
    /// Create a new engine error
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// TCP connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol engine error
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Host key has a type the trust store cannot record
    #[error("Unsupported host key type")]
    UnsupportedKeyType,

    /// Known hosts file could not be parsed or written
    #[error("Known hosts error: {0}")]
    KnownHosts(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}
