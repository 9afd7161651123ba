//! Protocol engine abstraction
//!
//! The session state machine never talks to libssh2 directly. It drives an
//! engine through [`ProtocolEngine`], whose calls never block: a call that
//! cannot make progress without more I/O returns [`Step::Suspended`] and must
//! be re-issued, with the same arguments, on the next readiness event.

use crate::EngineError;
use bytes::Bytes;
use std::fmt;

/// Outcome of a non-blocking engine call that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// No progress possible until more data arrives
    Suspended,
    /// The call completed
    Done(T),
}

impl<T> Step<T> {
    /// Whether the call must be re-issued later
    pub fn is_suspended(&self) -> bool {
        matches!(self, Step::Suspended)
    }
}

/// Result type of every re-entrant engine call
pub type EngineResult<T> = Result<Step<T>, EngineError>;

/// Answer to an authentication method query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthList {
    /// Method names advertised by the server, e.g. `["publickey", "password"]`
    Methods(Vec<String>),
    /// The server accepted the "none" method; no authentication is needed
    AlreadyAuthenticated,
}

impl AuthList {
    /// Parse libssh2's comma separated method list
    pub fn parse(list: &str) -> Self {
        AuthList::Methods(
            list.split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

/// Host key algorithm family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostKeyType {
    /// `ssh-rsa`
    Rsa,
    /// `ssh-dss`
    Dss,
    /// `ecdsa-sha2-nistp256`
    Ecdsa256,
    /// `ecdsa-sha2-nistp384`
    Ecdsa384,
    /// `ecdsa-sha2-nistp521`
    Ecdsa521,
    /// `ssh-ed25519`
    Ed25519,
    /// Anything the engine could not classify
    Unknown,
}

impl HostKeyType {
    /// Key type tag used in known hosts files
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            HostKeyType::Rsa => Some("ssh-rsa"),
            HostKeyType::Dss => Some("ssh-dss"),
            HostKeyType::Ecdsa256 => Some("ecdsa-sha2-nistp256"),
            HostKeyType::Ecdsa384 => Some("ecdsa-sha2-nistp384"),
            HostKeyType::Ecdsa521 => Some("ecdsa-sha2-nistp521"),
            HostKeyType::Ed25519 => Some("ssh-ed25519"),
            HostKeyType::Unknown => None,
        }
    }

    /// Inverse of [`HostKeyType::tag`]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "ssh-rsa" => HostKeyType::Rsa,
            "ssh-dss" => HostKeyType::Dss,
            "ecdsa-sha2-nistp256" => HostKeyType::Ecdsa256,
            "ecdsa-sha2-nistp384" => HostKeyType::Ecdsa384,
            "ecdsa-sha2-nistp521" => HostKeyType::Ecdsa521,
            "ssh-ed25519" => HostKeyType::Ed25519,
            _ => HostKeyType::Unknown,
        }
    }

    /// Classify a raw public key blob by its leading algorithm name
    pub fn from_key_blob(blob: &[u8]) -> Self {
        let Some(len) = blob.get(..4) else {
            return HostKeyType::Unknown;
        };
        let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;

        match blob.get(4..4 + len).map(std::str::from_utf8) {
            Some(Ok(name)) => HostKeyType::from_tag(name),
            _ => HostKeyType::Unknown,
        }
    }
}

impl fmt::Display for HostKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag().unwrap_or("unknown"))
    }
}

/// Identity presented by the remote host during the handshake
///
/// `key` is the raw public key blob as the engine reports it. `hash` is the
/// engine's fingerprint of that blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    /// Key algorithm
    pub key_type: HostKeyType,
    /// Raw key material
    pub key: Bytes,
    /// Fingerprint hash
    pub hash: Bytes,
}

impl HostIdentity {
    /// Create a new host identity
    pub fn new(key_type: HostKeyType, key: impl Into<Bytes>, hash: impl Into<Bytes>) -> Self {
        Self {
            key_type,
            key: key.into(),
            hash: hash.into(),
        }
    }

    /// Human readable fingerprint
    ///
    /// 16 byte hashes are MD5 and shown as colon separated hex, anything else
    /// is shown OpenSSH style as `SHA256:<unpadded base64>`.
    pub fn fingerprint(&self) -> String {
        use base64::Engine as _;

        if self.hash.len() == 16 {
            let hex: Vec<String> = self.hash.iter().map(|b| format!("{:02x}", b)).collect();
            format!("MD5:{}", hex.join(":"))
        } else {
            format!(
                "SHA256:{}",
                base64::engine::general_purpose::STANDARD_NO_PAD.encode(&self.hash)
            )
        }
    }
}

/// A non-blocking SSH protocol engine
///
/// Every method returning [`EngineResult`] must be safe to call again with
/// the same arguments until it stops returning [`Step::Suspended`].
pub trait ProtocolEngine {
    /// Engine side of the byte stream the engine reads and writes
    type Socket;

    /// Bind this engine to the transport
    fn attach(&mut self, socket: Self::Socket);

    /// Drive the key exchange
    fn begin_handshake(&mut self) -> EngineResult<()>;

    /// Host key captured by a completed handshake
    fn host_identity(&self) -> Option<HostIdentity>;

    /// Ask the server which authentication methods `username` may use
    fn list_auth_methods(&mut self, username: &str) -> EngineResult<AuthList>;

    /// Attempt password authentication
    fn authenticate_with_password(&mut self, username: &str, password: &str) -> EngineResult<()>;

    /// Attempt public key authentication with in-memory key material
    fn authenticate_with_key_pair(
        &mut self,
        username: &str,
        public_key: Option<&str>,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> EngineResult<()>;

    /// Send a protocol level keep-alive; best effort
    fn send_keepalive(&mut self) -> Result<(), EngineError>;

    /// Most recent error recorded by the engine
    fn last_error(&self) -> Option<EngineError>;

    /// Politely close the protocol session
    fn disconnect(&mut self, description: &str);
}

/// Creates fresh, disconnected engines
///
/// The session asks for a new engine on every reset so that no state from a
/// failed attempt survives into the next one.
pub trait EngineFactory {
    /// Engine type produced
    type Engine: ProtocolEngine;

    /// Allocate a new engine
    fn create(&mut self) -> Result<Self::Engine, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_list_parse() {
        let list = AuthList::parse("publickey,password,keyboard-interactive");
        assert_eq!(
            list,
            AuthList::Methods(vec![
                "publickey".to_string(),
                "password".to_string(),
                "keyboard-interactive".to_string(),
            ])
        );

        assert_eq!(AuthList::parse(""), AuthList::Methods(vec![]));
    }

    #[test]
    fn test_key_type_tags() {
        for key_type in [
            HostKeyType::Rsa,
            HostKeyType::Dss,
            HostKeyType::Ecdsa256,
            HostKeyType::Ecdsa384,
            HostKeyType::Ecdsa521,
            HostKeyType::Ed25519,
        ] {
            let tag = key_type.tag().unwrap();
            assert_eq!(HostKeyType::from_tag(tag), key_type);
        }

        assert_eq!(HostKeyType::Unknown.tag(), None);
        assert_eq!(HostKeyType::from_tag("x509v3-sign-rsa"), HostKeyType::Unknown);
    }

    #[test]
    fn test_key_type_from_blob() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&11u32.to_be_bytes());
        blob.extend_from_slice(b"ssh-ed25519");
        blob.extend_from_slice(&[0u8; 36]);
        assert_eq!(HostKeyType::from_key_blob(&blob), HostKeyType::Ed25519);

        assert_eq!(HostKeyType::from_key_blob(&[0, 0]), HostKeyType::Unknown);
        assert_eq!(HostKeyType::from_key_blob(&[0, 0, 0, 200, b's']), HostKeyType::Unknown);
    }

    #[test]
    fn test_fingerprint_formats() {
        let md5 = HostIdentity::new(HostKeyType::Rsa, vec![1u8, 2, 3], vec![0xabu8; 16]);
        assert!(md5.fingerprint().starts_with("MD5:ab:ab:"));

        let sha = HostIdentity::new(HostKeyType::Ed25519, vec![1u8, 2, 3], vec![0u8; 32]);
        let fp = sha.fingerprint();
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }
}
