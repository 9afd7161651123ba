//! # Skiff SSH Engine Layer
//!
//! Protocol engine seam, libssh2 engine, transport relay and known hosts
//! store used by the Skiff session client.

#![warn(missing_docs)]

/// Protocol engine abstraction
pub mod engine;

/// Known hosts trust store
pub mod known_hosts;

/// Transport socket abstraction
pub mod transport;

/// Byte relay and traffic accounting
#[cfg(unix)]
pub mod relay;

/// libssh2 backed engine
#[cfg(all(unix, feature = "ssh2"))]
pub mod libssh2;

/// Scripted engine for tests
#[cfg(all(unix, any(test, feature = "mock")))]
pub mod mock;

/// SSH-specific error types
pub mod error;

pub use engine::{
    AuthList, EngineFactory, EngineResult, HostIdentity, HostKeyType, ProtocolEngine, Step,
};
pub use error::{EngineError, TransportError, ERROR_EAGAIN};
pub use known_hosts::{KnownHost, TrustStore, Verification};
pub use transport::{Connector, TcpConnector};
#[cfg(unix)]
pub use relay::{Relay, RelayEvent, TrafficCounters};
#[cfg(all(unix, feature = "ssh2"))]
pub use libssh2::{Ssh2Engine, Ssh2EngineFactory};
