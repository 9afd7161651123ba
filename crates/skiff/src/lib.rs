//! # Skiff
//!
//! An asynchronous SSH session client.
//!
//! Skiff drives a non-blocking SSH protocol engine through TCP connect, key
//! exchange, host key verification and authentication without ever blocking
//! the caller. The [`session::Session`] state machine decides what happens
//! next; the [`client::Client`] task owns the socket and the timers and carries
//! out what the state machine asks for.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use skiff_ssh as ssh;

/// Error types for the Skiff library
pub mod error;

/// Authentication methods, credentials and method selection
pub mod auth;

/// Client configuration
pub mod config;

/// Session lifecycle events
pub mod events;

/// Connection and authentication state machine
pub mod session;

/// Client task driving a session over TCP
#[cfg(unix)]
pub mod client;

pub use auth::{AuthMethod, AuthMethods, Credentials, KeyPair};
pub use config::{ClientConfig, HostKeyPolicy, Target};
pub use error::{ConnectError, ErrorKind, SkiffError};
pub use events::{EventReceiver, SessionEvent};
pub use session::{ChannelConsumer, Session, SessionAction, SessionState, SessionStatus};
#[cfg(unix)]
pub use client::{Client, ClientBuilder};

/// Result type alias for Skiff operations
pub type Result<T> = std::result::Result<T, SkiffError>;
