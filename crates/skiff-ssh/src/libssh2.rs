//! libssh2 protocol engine
//!
//! Wraps an [`ssh2::Session`] in non-blocking mode. libssh2 reports "would
//! block" as `LIBSSH2_ERROR_EAGAIN`, which maps to [`Step::Suspended`].

use crate::engine::{
    AuthList, EngineFactory, EngineResult, HostIdentity, HostKeyType, ProtocolEngine, Step,
};
use crate::{EngineError, ERROR_EAGAIN};
use bytes::Bytes;
use ssh2::{ErrorCode, HashType, Session};
use std::os::unix::net::UnixStream;
use std::sync::Once;
use tracing::{debug, warn};

/// Server keep-alive interval configured on every handshake, in seconds
pub const LIBSSH2_KEEPALIVE_INTERVAL: u32 = 5;

static LIBSSH2_INIT: Once = Once::new();

/// Initialize libssh2 once per process
pub fn init_library() {
    LIBSSH2_INIT.call_once(|| {
        debug!("Initializing libssh2");
        ssh2::init();
    });
}

fn engine_error(err: &ssh2::Error) -> EngineError {
    let code = match err.code() {
        ErrorCode::Session(code) => code,
        ErrorCode::SFTP(code) => code,
    };
    EngineError::new(code, err.message())
}

/// Non-blocking engine backed by libssh2
pub struct Ssh2Engine {
    session: Session,
    attached: bool,
    last_error: Option<EngineError>,
}

impl Ssh2Engine {
    /// Create a disconnected engine
    pub fn new() -> Result<Self, EngineError> {
        init_library();

        let session = Session::new().map_err(|e| engine_error(&e))?;
        session.set_blocking(false);

        Ok(Self {
            session,
            attached: false,
            last_error: None,
        })
    }

    /// Underlying libssh2 session, for channel consumers
    pub fn session(&self) -> &Session {
        &self.session
    }

    fn step<T>(&mut self, result: Result<T, ssh2::Error>) -> EngineResult<T> {
        match result {
            Ok(value) => Ok(Step::Done(value)),
            Err(e) if matches!(e.code(), ErrorCode::Session(code) if code == ERROR_EAGAIN) => {
                Ok(Step::Suspended)
            }
            Err(e) => {
                let err = engine_error(&e);
                self.last_error = Some(err.clone());
                Err(err)
            }
        }
    }
}

impl ProtocolEngine for Ssh2Engine {
    type Socket = UnixStream;

    fn attach(&mut self, socket: UnixStream) {
        self.session.set_tcp_stream(socket);
        self.attached = true;
    }

    fn begin_handshake(&mut self) -> EngineResult<()> {
        if !self.attached {
            let err = EngineError::new(-1, "engine is not attached to a transport");
            self.last_error = Some(err.clone());
            return Err(err);
        }

        let result = self.session.handshake();
        let step = self.step(result)?;
        if !step.is_suspended() {
            self.session.set_keepalive(true, LIBSSH2_KEEPALIVE_INTERVAL);
        }
        Ok(step)
    }

    fn host_identity(&self) -> Option<HostIdentity> {
        let (key, _) = self.session.host_key()?;
        let hash = self
            .session
            .host_key_hash(HashType::Sha256)
            .or_else(|| self.session.host_key_hash(HashType::Md5))
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();

        Some(HostIdentity {
            key_type: HostKeyType::from_key_blob(key),
            key: Bytes::copy_from_slice(key),
            hash,
        })
    }

    fn list_auth_methods(&mut self, username: &str) -> EngineResult<AuthList> {
        let result = self.session.auth_methods(username).map(str::to_string);
        match result {
            Ok(list) => Ok(Step::Done(AuthList::parse(&list))),
            // libssh2 answers a successful "none" authentication with no list
            Err(_) if self.session.authenticated() => {
                Ok(Step::Done(AuthList::AlreadyAuthenticated))
            }
            Err(e) => self.step(Err(e)),
        }
    }

    fn authenticate_with_password(&mut self, username: &str, password: &str) -> EngineResult<()> {
        let result = self.session.userauth_password(username, password);
        self.step(result)
    }

    fn authenticate_with_key_pair(
        &mut self,
        username: &str,
        public_key: Option<&str>,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> EngineResult<()> {
        let result = self
            .session
            .userauth_pubkey_memory(username, public_key, private_key, passphrase);
        self.step(result)
    }

    fn send_keepalive(&mut self) -> Result<(), EngineError> {
        match self.session.keepalive_send() {
            Ok(next) => {
                debug!("Keep-alive sent, next due in {}s", next);
                Ok(())
            }
            Err(e) => Err(engine_error(&e)),
        }
    }

    fn last_error(&self) -> Option<EngineError> {
        self.last_error.clone()
    }

    fn disconnect(&mut self, description: &str) {
        if let Err(e) = self.session.disconnect(None, description, None) {
            // EAGAIN here only means the goodbye could not be flushed
            if !matches!(e.code(), ErrorCode::Session(code) if code == ERROR_EAGAIN) {
                warn!("Failed to send SSH disconnect: {}", e);
            }
        }
    }
}

/// Factory producing fresh [`Ssh2Engine`]s
#[derive(Debug, Clone, Default)]
pub struct Ssh2EngineFactory;

impl EngineFactory for Ssh2EngineFactory {
    type Engine = Ssh2Engine;

    fn create(&mut self) -> Result<Ssh2Engine, EngineError> {
        Ssh2Engine::new()
    }
}
