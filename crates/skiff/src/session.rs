//! Connection and authentication state machine
//!
//! [`Session`] performs no I/O. The client task feeds it transport and timer
//! events; the session advances its state, calls into the protocol engine and
//! queues [`SessionAction`]s that the client task carries out. A protocol
//! engine answering [`Step::Suspended`] leaves the state untouched until the
//! next readiness event or explicit re-entry.

use crate::auth::{self, AttemptMaterial, AuthMethod, AuthMethods, Credentials, KeyPair};
use crate::config::{ClientConfig, HostKeyPolicy, Target};
use crate::error::{ConnectError, ErrorKind, SkiffError};
use crate::events::SessionEvent;
use skiff_ssh::transport::is_refused;
use skiff_ssh::{
    AuthList, EngineError, EngineFactory, HostIdentity, ProtocolEngine, Step, TrustStore,
    Verification,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Description sent with the protocol disconnect message
pub const DISCONNECT_MESSAGE: &str = "good bye!";

/// Engine end of the transport for the engines a factory creates
pub type EngineSocket<F> = <<F as EngineFactory>::Engine as ProtocolEngine>::Socket;

/// Connection state, in the order a successful connect passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// No connection
    Idle,
    /// Waiting for the TCP connection
    TcpConnecting,
    /// TCP is up, the handshake has not started
    TcpConnected,
    /// Key exchange running
    HandshakeInProgress,
    /// Asking the server for its authentication methods
    AuthMethodsQueried,
    /// Picking the next authentication method
    ChoosingAuthMethod,
    /// An authentication attempt is running
    AuthAttemptInProgress,
    /// Authenticated; channels may be opened
    ChannelsReady,
}

/// Work the session asks its driver to carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Deliver an event to the caller
    Emit(SessionEvent),
    /// Open a TCP connection and report it through [`Session::on_tcp_connected`]
    OpenTransport {
        /// Remote host
        host: String,
        /// Remote port
        port: u16,
    },
    /// Drop the TCP connection and any connect in flight
    CloseTransport,
    /// Call [`Session::on_connect_timeout`] after this long, replacing any armed timer
    ArmConnectTimer(Duration),
    /// Call [`Session::send_keepalive`] periodically
    StartKeepAlive,
    /// Stop the keep-alive timer
    StopKeepAlive,
    /// Call [`Session::resume`] before waiting for more events
    Reenter,
    /// The pending connect operation is over; disarm the connect timer
    ConnectFinished(Result<(), ConnectError>),
}

/// Snapshot of a session's observable state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Session ID
    pub id: Uuid,
    /// Current state
    pub state: SessionState,
    /// Most recent error kind, if any
    pub error_kind: Option<ErrorKind>,
    /// Most recent engine error, if any
    pub last_error: Option<EngineError>,
    /// Methods the server advertised
    pub available: AuthMethods,
    /// Methods the server rejected
    pub failed: AuthMethods,
    /// Local port of the TCP connection
    pub local_port: Option<u16>,
}

/// Something that works with channels once the session is authenticated
///
/// Called once when authentication completes and again on every readiness
/// event while the session stays authenticated.
pub trait ChannelConsumer<E>: Send {
    /// The session is ready and may have new channel data
    fn channel_ready(&mut self, engine: &mut E);
}

/// Attempts left for the pending connect operation
#[derive(Debug, Clone, Copy)]
struct ConnectBudget {
    retries_left: u32,
    attempts: u32,
    timeout: Duration,
}

/// Authentication attempt in flight
///
/// Every re-entry repeats the engine call with the same material until the
/// engine answers.
struct AuthAttempt {
    method: AuthMethod,
    material: AttemptMaterial,
    /// The caller replaced this method's credentials mid-attempt
    superseded: bool,
}

/// SSH session state machine
pub struct Session<F: EngineFactory> {
    id: Uuid,
    factory: F,
    engine: Option<F::Engine>,
    target: Option<Target>,
    host_key_policy: HostKeyPolicy,
    known_hosts_path: Option<PathBuf>,
    trust: TrustStore,
    credentials: Credentials,
    state: SessionState,
    error_kind: Option<ErrorKind>,
    last_error: Option<EngineError>,
    available: AuthMethods,
    failed: AuthMethods,
    current_attempt: Option<AuthAttempt>,
    awaiting_credentials: bool,
    host_identity: Option<HostIdentity>,
    pending: Option<ConnectBudget>,
    transport_open: bool,
    consumers: Vec<Box<dyn ChannelConsumer<F::Engine>>>,
    actions: VecDeque<SessionAction>,
}

impl<F: EngineFactory> Session<F> {
    /// Create an idle session
    pub fn new(factory: F, config: &ClientConfig) -> Self {
        let mut session = Self {
            id: Uuid::new_v4(),
            factory,
            engine: None,
            target: None,
            host_key_policy: config.host_key_policy,
            known_hosts_path: config.known_hosts.clone(),
            trust: TrustStore::new(),
            credentials: Credentials::new(),
            state: SessionState::Idle,
            error_kind: None,
            last_error: None,
            available: AuthMethods::new(),
            failed: AuthMethods::new(),
            current_attempt: None,
            awaiting_credentials: false,
            host_identity: None,
            pending: None,
            transport_open: false,
            consumers: Vec::new(),
            actions: VecDeque::new(),
        };
        session.trust = session.fresh_trust_store();
        session.engine = session.create_engine();
        session
    }

    /// Session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Most recent error kind
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    /// Most recent engine error
    pub fn last_error(&self) -> Option<&EngineError> {
        self.last_error.as_ref()
    }

    /// Methods the server advertised
    pub fn available_methods(&self) -> AuthMethods {
        self.available
    }

    /// Methods the server rejected
    pub fn failed_methods(&self) -> AuthMethods {
        self.failed
    }

    /// Identity presented by the most recent handshake
    pub fn host_identity(&self) -> Option<&HostIdentity> {
        self.host_identity.as_ref()
    }

    /// Target of the most recent connect
    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    /// Current trust store
    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    /// Whether a connect operation is waiting for its outcome
    pub fn is_connect_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Snapshot of the observable state
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.id,
            state: self.state,
            error_kind: self.error_kind,
            last_error: self.last_error.clone(),
            available: self.available,
            failed: self.failed,
            local_port: None,
        }
    }

    /// Take the next queued action
    pub fn next_action(&mut self) -> Option<SessionAction> {
        self.actions.pop_front()
    }

    /// Take every queued action
    pub fn drain_actions(&mut self) -> Vec<SessionAction> {
        self.actions.drain(..).collect()
    }

    /// Start connecting to `target`
    ///
    /// A session that is not idle is reset first. `timeout` bounds each
    /// attempt up to its outcome; retryable failures start a new attempt on
    /// a fresh engine until `retries` extra attempts have been used.
    pub fn connect(&mut self, target: Target, retries: u32, timeout: Duration) {
        if self.state != SessionState::Idle || self.pending.is_some() {
            self.reset();
        }

        info!("Connecting to {}", target);
        self.target = Some(target);
        self.pending = Some(ConnectBudget {
            retries_left: retries,
            attempts: 0,
            timeout,
        });
        self.start_attempt();
    }

    /// The transport connected; `socket` is the engine's end of it
    pub fn on_tcp_connected(&mut self, socket: EngineSocket<F>) {
        if self.state != SessionState::TcpConnecting {
            debug!("Ignoring transport connected in state {:?}", self.state);
            return;
        }

        self.transport_open = true;
        let Some(engine) = self.engine.as_mut() else {
            self.fail(ErrorKind::UnexpectedShutdown);
            return;
        };

        debug!("Transport connected");
        engine.attach(socket);
        self.state = SessionState::TcpConnected;
        self.drive();
    }

    /// The transport reported an error
    ///
    /// A refused connection ends the current attempt. Anything else is left
    /// to the connect timeout.
    pub fn on_transport_error(&mut self, err: &io::Error) {
        if self.state == SessionState::TcpConnecting && is_refused(err) {
            self.fail(ErrorKind::ConnectionRefused);
        } else {
            warn!("Transport error in state {:?}: {}", self.state, err);
        }
    }

    /// The connect timer fired
    pub fn on_connect_timeout(&mut self) {
        if self.pending.is_some() {
            self.fail(ErrorKind::TimeOut);
        }
    }

    /// The transport closed, by the peer or through an error
    pub fn on_transport_closed(&mut self) {
        self.push(SessionAction::StopKeepAlive);
        let was_open = std::mem::replace(&mut self.transport_open, false);

        if self.state == SessionState::Idle {
            if was_open {
                self.emit(SessionEvent::Disconnected);
            }
            return;
        }

        warn!("Transport closed in state {:?}", self.state);
        let budget = self.pending.take();
        if budget.is_some() {
            self.emit(SessionEvent::Error(ErrorKind::UnexpectedShutdown));
        }
        self.reset_internal();
        self.emit(SessionEvent::Disconnected);

        if let Some(budget) = budget {
            self.conclude_attempt(ErrorKind::UnexpectedShutdown, budget);
        }
    }

    /// Server data reached the engine
    pub fn on_readable(&mut self) {
        self.drive();
    }

    /// Re-enter the state machine without new transport data
    pub fn resume(&mut self) {
        self.drive();
    }

    /// Supply a password
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.failed.remove(AuthMethod::Password);
        self.credentials.set_password(password);
        self.credentials_updated(AuthMethod::Password);
    }

    /// Supply key pair material
    pub fn set_key_pair(&mut self, key_pair: KeyPair) {
        self.failed.remove(AuthMethod::PublicKey);
        self.credentials.set_key_pair(key_pair);
        self.credentials_updated(AuthMethod::PublicKey);
    }

    /// Send a keep-alive probe if authenticated
    pub fn send_keepalive(&mut self) {
        if self.state != SessionState::ChannelsReady {
            return;
        }

        if let Some(engine) = self.engine.as_mut() {
            if let Err(e) = engine.send_keepalive() {
                debug!("Keep-alive failed: {}", e);
            }
        }
    }

    /// Register a channel consumer
    pub fn register_consumer(&mut self, consumer: Box<dyn ChannelConsumer<F::Engine>>) {
        self.consumers.push(consumer);
    }

    /// Abandon any connect in flight and return to idle
    pub fn reset(&mut self) {
        info!("Resetting session");
        self.finish_connect(Err(ConnectError::Cancelled));
        self.reset_internal();
    }

    /// Reset and forget the credentials
    pub fn disconnect(&mut self) {
        self.reset();
        self.credentials.clear();
    }

    /// Merge a known hosts file into the trust store
    ///
    /// The file is also reloaded into the fresh trust store of every reset.
    pub fn load_known_hosts(&mut self, path: &Path) -> Result<usize, SkiffError> {
        let added = self.trust.load(path)?;
        self.known_hosts_path = Some(path.to_path_buf());
        Ok(added)
    }

    /// Write the trust store to a known hosts file
    pub fn save_known_hosts(&self, path: &Path) -> Result<(), SkiffError> {
        self.trust.save(path)?;
        Ok(())
    }

    /// Trust `identity` for `hostname`
    pub fn add_known_host(
        &mut self,
        hostname: &str,
        identity: &HostIdentity,
    ) -> Result<(), SkiffError> {
        self.trust_host(hostname, identity)
    }

    fn drive(&mut self) {
        loop {
            let progressed = match self.state {
                SessionState::Idle | SessionState::TcpConnecting => false,
                SessionState::TcpConnected => {
                    self.state = SessionState::HandshakeInProgress;
                    true
                }
                SessionState::HandshakeInProgress => self.step_handshake(),
                SessionState::AuthMethodsQueried => self.step_auth_list(),
                SessionState::ChoosingAuthMethod => self.step_choose(),
                SessionState::AuthAttemptInProgress => self.step_authenticate(),
                SessionState::ChannelsReady => {
                    self.notify_consumers();
                    false
                }
            };

            if !progressed {
                break;
            }
        }
    }

    fn step_handshake(&mut self) -> bool {
        let Some(engine) = self.engine.as_mut() else {
            self.fail(ErrorKind::UnexpectedShutdown);
            return false;
        };

        match engine.begin_handshake() {
            Ok(Step::Suspended) => false,
            Ok(Step::Done(())) => {
                debug!("Handshake complete");
                self.check_host_key()
            }
            Err(e) => {
                warn!("Handshake failed: {}", e);
                self.last_error = Some(e);
                self.fail(ErrorKind::UnexpectedShutdown);
                false
            }
        }
    }

    fn check_host_key(&mut self) -> bool {
        let identity = self.engine.as_ref().and_then(|engine| engine.host_identity());
        let (Some(identity), Some(target)) = (identity, self.target.as_ref()) else {
            error!("Handshake completed without a host key");
            self.fail(ErrorKind::UnexpectedShutdown);
            return false;
        };
        let hostname = target.host.clone();
        self.host_identity = Some(identity.clone());

        let verdict = self.trust.verify(&hostname, &identity);
        match verdict {
            Verification::Match => debug!("Host key for {} is trusted", hostname),
            Verification::NotFound if self.host_key_policy == HostKeyPolicy::AcceptNew => {
                info!(
                    "Trusting new {} key for {}: {}",
                    identity.key_type,
                    hostname,
                    identity.fingerprint()
                );
                if let Err(e) = self.trust_host(&hostname, &identity) {
                    warn!("Failed to record host key for {}: {}", hostname, e);
                }
            }
            Verification::NotFound | Verification::Mismatch => {
                let kind = if verdict == Verification::Mismatch {
                    ErrorKind::HostKeyMismatch
                } else {
                    ErrorKind::HostKeyUnknown
                };
                let fingerprint = identity.fingerprint();
                warn!("{} for {}: {} {}", kind, hostname, identity.key_type, fingerprint);

                if self.host_key_policy == HostKeyPolicy::Reject {
                    self.fail(kind);
                    return false;
                }
                self.error_kind = Some(kind);
                self.emit(SessionEvent::Error(kind));
            }
        }

        self.state = SessionState::AuthMethodsQueried;
        true
    }

    fn step_auth_list(&mut self) -> bool {
        let (Some(engine), Some(target)) = (self.engine.as_mut(), self.target.as_ref()) else {
            self.fail(ErrorKind::UnexpectedShutdown);
            return false;
        };

        match engine.list_auth_methods(&target.username) {
            Ok(Step::Suspended) => false,
            Ok(Step::Done(AuthList::AlreadyAuthenticated)) => {
                debug!("Server accepted the none method");
                self.authenticated();
                true
            }
            Ok(Step::Done(AuthList::Methods(names))) => {
                for name in &names {
                    match AuthMethod::from_name(name) {
                        Some(method) => self.available.insert(method),
                        None => debug!("Ignoring unsupported auth method {}", name),
                    }
                }
                debug!("Server offers {:?}", self.available);
                self.state = SessionState::ChoosingAuthMethod;
                true
            }
            Err(e) => {
                warn!("Failed to list auth methods: {}", e);
                self.last_error = Some(e);
                self.fail(ErrorKind::UnexpectedShutdown);
                false
            }
        }
    }

    fn step_choose(&mut self) -> bool {
        if self.awaiting_credentials {
            return false;
        }

        let chosen = auth::select(self.available, self.failed, &self.credentials)
            .and_then(|method| Some((method, self.credentials.material(method)?)));
        match chosen {
            Some((method, material)) => {
                debug!("Trying {} authentication", method);
                self.current_attempt = Some(AuthAttempt {
                    method,
                    material,
                    superseded: false,
                });
                self.state = SessionState::AuthAttemptInProgress;
                true
            }
            None => {
                info!("No usable authentication method; server offers {:?}", self.available);
                self.awaiting_credentials = true;
                self.error_kind = Some(ErrorKind::Authentication);
                self.emit(SessionEvent::Error(ErrorKind::Authentication));
                self.emit(SessionEvent::AuthRequired(self.available));
                let attempts = self.pending.map(|b| b.attempts).unwrap_or_default();
                self.finish_connect(Err(ConnectError::Failed {
                    kind: ErrorKind::Authentication,
                    attempts,
                }));
                false
            }
        }
    }

    fn step_authenticate(&mut self) -> bool {
        let (Some(attempt), Some(engine), Some(target)) =
            (self.current_attempt.as_ref(), self.engine.as_mut(), self.target.as_ref())
        else {
            self.state = SessionState::ChoosingAuthMethod;
            return true;
        };

        let method = attempt.method;
        let username = target.username.as_str();
        let result = match &attempt.material {
            AttemptMaterial::KeyPair(key_pair) => engine.authenticate_with_key_pair(
                username,
                key_pair.public_key(),
                key_pair.private_key(),
                key_pair.passphrase(),
            ),
            AttemptMaterial::Password(password) => {
                engine.authenticate_with_password(username, password.as_str())
            }
        };

        match result {
            Ok(Step::Suspended) => false,
            Ok(Step::Done(())) => {
                info!("Authenticated with {}", method);
                self.current_attempt = None;
                self.authenticated();
                true
            }
            Err(e) => {
                info!("{} authentication rejected: {}", method, e);
                self.last_error = Some(e);
                // Rejected material that the caller already replaced is not a failure
                if !self.current_attempt.take().is_some_and(|a| a.superseded) {
                    self.failed.insert(method);
                }
                self.state = SessionState::ChoosingAuthMethod;
                true
            }
        }
    }

    fn authenticated(&mut self) {
        self.state = SessionState::ChannelsReady;
        self.error_kind = None;
        self.awaiting_credentials = false;
        self.push(SessionAction::StartKeepAlive);
        self.emit(SessionEvent::Connected);
        self.finish_connect(Ok(()));
    }

    fn notify_consumers(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            for consumer in self.consumers.iter_mut() {
                consumer.channel_ready(engine);
            }
        }
        self.emit(SessionEvent::DataReady);
    }

    fn start_attempt(&mut self) {
        let Some(budget) = self.pending.as_mut() else {
            return;
        };
        budget.attempts += 1;
        let (attempt, timeout) = (budget.attempts, budget.timeout);

        let Some(target) = self.target.as_ref() else {
            return;
        };
        let (host, port) = (target.host.clone(), target.port);

        if self.engine.is_none() {
            self.engine = self.create_engine();
        }

        debug!("Connect attempt {} to {}:{}", attempt, host, port);
        self.state = SessionState::TcpConnecting;
        self.push(SessionAction::OpenTransport { host, port });
        self.push(SessionAction::ArmConnectTimer(timeout));
    }

    fn fail(&mut self, kind: ErrorKind) {
        warn!("Connect attempt failed: {}", kind);
        self.emit(SessionEvent::Error(kind));

        let budget = self.pending.take();
        self.reset_internal();

        match budget {
            Some(budget) => self.conclude_attempt(kind, budget),
            None => self.error_kind = Some(kind),
        }
    }

    fn conclude_attempt(&mut self, kind: ErrorKind, mut budget: ConnectBudget) {
        if kind.is_retryable() && budget.retries_left > 0 {
            budget.retries_left -= 1;
            info!("Retrying connect, {} retries left", budget.retries_left);
            self.pending = Some(budget);
            self.start_attempt();
        } else {
            self.error_kind = Some(kind);
            self.push(SessionAction::ConnectFinished(Err(ConnectError::Failed {
                kind,
                attempts: budget.attempts,
            })));
        }
    }

    fn finish_connect(&mut self, result: Result<(), ConnectError>) {
        if self.pending.take().is_some() {
            self.push(SessionAction::ConnectFinished(result));
        }
    }

    fn reset_internal(&mut self) {
        self.push(SessionAction::StopKeepAlive);

        if let Some(mut engine) = self.engine.take() {
            if self.state > SessionState::TcpConnected {
                engine.disconnect(DISCONNECT_MESSAGE);
            }
        }

        self.trust = self.fresh_trust_store();
        self.state = SessionState::Idle;
        self.error_kind = None;
        self.last_error = None;
        self.available.clear();
        self.failed.clear();
        self.current_attempt = None;
        self.awaiting_credentials = false;
        self.engine = self.create_engine();

        self.push(SessionAction::CloseTransport);
        if std::mem::replace(&mut self.transport_open, false) {
            self.emit(SessionEvent::Disconnected);
        }
        self.emit(SessionEvent::Reset);
    }

    fn credentials_updated(&mut self, method: AuthMethod) {
        self.awaiting_credentials = false;

        // The attempt in flight finishes with the material it started with
        if let Some(attempt) = self.current_attempt.as_mut() {
            if attempt.method == method {
                attempt.superseded = true;
            }
            return;
        }

        if self.state > SessionState::TcpConnecting {
            self.push(SessionAction::Reenter);
        }
    }

    fn trust_host(&mut self, hostname: &str, identity: &HostIdentity) -> Result<(), SkiffError> {
        self.trust.add(hostname, identity)?;
        if let Some(path) = &self.known_hosts_path {
            self.trust.save(path)?;
        }
        Ok(())
    }

    fn fresh_trust_store(&self) -> TrustStore {
        let mut trust = TrustStore::new();
        if let Some(path) = self.known_hosts_path.as_deref().filter(|p| p.exists()) {
            if let Err(e) = trust.load(path) {
                warn!("Failed to load known hosts: {}", e);
            }
        }
        trust
    }

    fn create_engine(&mut self) -> Option<F::Engine> {
        match self.factory.create() {
            Ok(engine) => Some(engine),
            Err(e) => {
                error!("Failed to create protocol engine: {}", e);
                None
            }
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        debug!("Event {:?}", event);
        self.push(SessionAction::Emit(event));
    }

    fn push(&mut self, action: SessionAction) {
        self.actions.push_back(action);
    }
}

impl<F: EngineFactory> std::fmt::Debug for Session<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("target", &self.target)
            .field("error_kind", &self.error_kind)
            .field("available", &self.available)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}
