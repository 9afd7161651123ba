//! Scripted protocol engine for tests
//!
//! Every engine created by a [`MockFactory`] shares one [`MockServer`]. Each
//! engine call pops the next scripted answer for that call; an empty script
//! answers [`Step::Suspended`], the same thing a real engine says when no
//! server data has arrived yet.

use crate::engine::{AuthList, EngineFactory, EngineResult, HostIdentity, ProtocolEngine, Step};
use crate::EngineError;
use std::collections::VecDeque;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard};

/// A call observed by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `attach`
    Attach,
    /// `begin_handshake`
    Handshake,
    /// `list_auth_methods(username)`
    ListAuthMethods(String),
    /// `authenticate_with_password(username, password)`
    Password(String, String),
    /// `authenticate_with_key_pair(username, private_key)`
    KeyPair(String, String),
    /// `send_keepalive`
    KeepAlive,
    /// `disconnect(description)`
    Disconnect(String),
}

/// Scripted answers and the record of calls made
#[derive(Debug, Default)]
pub struct Script {
    /// Answers to `begin_handshake`
    pub handshake: VecDeque<EngineResult<()>>,
    /// Answers to `list_auth_methods`
    pub auth_list: VecDeque<EngineResult<AuthList>>,
    /// Answers to `authenticate_with_password`
    pub password: VecDeque<EngineResult<()>>,
    /// Answers to `authenticate_with_key_pair`
    pub key_pair: VecDeque<EngineResult<()>>,
    /// Identity reported once the handshake has completed
    pub identity: Option<HostIdentity>,
    /// Every call in order
    pub calls: Vec<Call>,
    /// Engines created so far
    pub engines_created: usize,
}

/// Handle on the shared script
#[derive(Debug, Clone, Default)]
pub struct MockServer {
    script: Arc<Mutex<Script>>,
}

impl MockServer {
    /// Create an empty script
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the script for inspection or editing
    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a handshake answer
    pub fn handshake(&self, answer: EngineResult<()>) -> &Self {
        self.script().handshake.push_back(answer);
        self
    }

    /// Queue an auth method list answer
    pub fn auth_list(&self, answer: EngineResult<AuthList>) -> &Self {
        self.script().auth_list.push_back(answer);
        self
    }

    /// Queue a password authentication answer
    pub fn password(&self, answer: EngineResult<()>) -> &Self {
        self.script().password.push_back(answer);
        self
    }

    /// Queue a key pair authentication answer
    pub fn key_pair(&self, answer: EngineResult<()>) -> &Self {
        self.script().key_pair.push_back(answer);
        self
    }

    /// Set the host identity presented after the handshake
    pub fn identity(&self, identity: HostIdentity) -> &Self {
        self.script().identity = Some(identity);
        self
    }

    /// Copy of the recorded calls
    pub fn calls(&self) -> Vec<Call> {
        self.script().calls.clone()
    }

    /// Number of engines the factory has created
    pub fn engines_created(&self) -> usize {
        self.script().engines_created
    }

    /// Factory producing engines bound to this script
    pub fn factory(&self) -> MockFactory {
        MockFactory { server: self.clone() }
    }
}

/// Engine that answers from a [`MockServer`] script
#[derive(Debug)]
pub struct MockEngine {
    server: MockServer,
    socket: Option<UnixStream>,
    handshake_done: bool,
    last_error: Option<EngineError>,
}

impl MockEngine {
    fn answer<T>(
        &mut self,
        pop: impl FnOnce(&mut Script) -> Option<EngineResult<T>>,
    ) -> EngineResult<T> {
        let answer = pop(&mut self.server.script()).unwrap_or(Ok(Step::Suspended));
        if let Err(e) = &answer {
            self.last_error = Some(e.clone());
        }
        answer
    }
}

impl ProtocolEngine for MockEngine {
    /// `None` when the session is driven without a relay
    type Socket = Option<UnixStream>;

    fn attach(&mut self, socket: Option<UnixStream>) {
        self.socket = socket;
        self.server.script().calls.push(Call::Attach);
    }

    fn begin_handshake(&mut self) -> EngineResult<()> {
        self.server.script().calls.push(Call::Handshake);
        let answer = self.answer(|s| s.handshake.pop_front());
        if let Ok(Step::Done(())) = answer {
            self.handshake_done = true;
        }
        answer
    }

    fn host_identity(&self) -> Option<HostIdentity> {
        if self.handshake_done {
            self.server.script().identity.clone()
        } else {
            None
        }
    }

    fn list_auth_methods(&mut self, username: &str) -> EngineResult<AuthList> {
        self.server
            .script()
            .calls
            .push(Call::ListAuthMethods(username.to_string()));
        self.answer(|s| s.auth_list.pop_front())
    }

    fn authenticate_with_password(&mut self, username: &str, password: &str) -> EngineResult<()> {
        self.server
            .script()
            .calls
            .push(Call::Password(username.to_string(), password.to_string()));
        self.answer(|s| s.password.pop_front())
    }

    fn authenticate_with_key_pair(
        &mut self,
        username: &str,
        _public_key: Option<&str>,
        private_key: &str,
        _passphrase: Option<&str>,
    ) -> EngineResult<()> {
        self.server
            .script()
            .calls
            .push(Call::KeyPair(username.to_string(), private_key.to_string()));
        self.answer(|s| s.key_pair.pop_front())
    }

    fn send_keepalive(&mut self) -> Result<(), EngineError> {
        self.server.script().calls.push(Call::KeepAlive);
        Ok(())
    }

    fn last_error(&self) -> Option<EngineError> {
        self.last_error.clone()
    }

    fn disconnect(&mut self, description: &str) {
        self.server
            .script()
            .calls
            .push(Call::Disconnect(description.to_string()));
    }
}

/// Factory for [`MockEngine`]s sharing one script
#[derive(Debug, Clone)]
pub struct MockFactory {
    server: MockServer,
}

impl EngineFactory for MockFactory {
    type Engine = MockEngine;

    fn create(&mut self) -> Result<MockEngine, EngineError> {
        self.server.script().engines_created += 1;
        Ok(MockEngine {
            server: self.server.clone(),
            socket: None,
            handshake_done: false,
            last_error: None,
        })
    }
}
