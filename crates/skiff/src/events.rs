//! Session lifecycle events

use crate::{AuthMethods, ErrorKind};
use tokio::sync::mpsc;

/// Lifecycle notification delivered to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Authentication completed; channels may be opened
    Connected,
    /// The transport closed
    Disconnected,
    /// No usable authentication method remains; the server offers these
    AuthRequired(AuthMethods),
    /// Something went wrong
    Error(ErrorKind),
    /// The session is ready and new channel data may be available
    DataReady,
    /// The session was reset to idle
    Reset,
    /// Bytes moved since the previous sample
    TrafficSample {
        /// Bytes written towards the server
        sent: u64,
        /// Bytes read from the server
        received: u64,
    },
}

impl SessionEvent {
    /// Error kind carried by an [`SessionEvent::Error`]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            SessionEvent::Error(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Methods asked for by an [`SessionEvent::AuthRequired`]
    pub fn auth_required(&self) -> Option<AuthMethods> {
        match self {
            SessionEvent::AuthRequired(methods) => Some(*methods),
            _ => None,
        }
    }
}

/// Receiving side of a client's event stream
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Sending side of a client's event stream
pub(crate) type EventSender = mpsc::UnboundedSender<SessionEvent>;
