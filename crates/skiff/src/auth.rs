//! Authentication methods, credentials and method selection

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Supported authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// `publickey`
    PublicKey,
    /// `password`
    Password,
}

impl AuthMethod {
    /// Order in which methods are tried
    pub const PRIORITY: [AuthMethod; 2] = [AuthMethod::PublicKey, AuthMethod::Password];

    /// Method name as advertised by SSH servers
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::PublicKey => "publickey",
            AuthMethod::Password => "password",
        }
    }

    /// Parse an advertised method name; unsupported names yield `None`
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "publickey" => Some(AuthMethod::PublicKey),
            "password" => Some(AuthMethod::Password),
            _ => None,
        }
    }

    fn bit(&self) -> u8 {
        match self {
            AuthMethod::PublicKey => 0b01,
            AuthMethod::Password => 0b10,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of authentication methods
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AuthMethods(u8);

impl AuthMethods {
    /// The empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method
    pub fn insert(&mut self, method: AuthMethod) {
        self.0 |= method.bit();
    }

    /// Remove a method
    pub fn remove(&mut self, method: AuthMethod) {
        self.0 &= !method.bit();
    }

    /// Whether `method` is in the set
    pub fn contains(&self, method: AuthMethod) -> bool {
        self.0 & method.bit() != 0
    }

    /// Remove every method
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Methods in priority order
    pub fn iter(&self) -> impl Iterator<Item = AuthMethod> + '_ {
        AuthMethod::PRIORITY.into_iter().filter(|m| self.contains(*m))
    }

    /// Collect the supported methods out of advertised names, ignoring the rest
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        names.into_iter().filter_map(AuthMethod::from_name).collect()
    }
}

impl FromIterator<AuthMethod> for AuthMethods {
    fn from_iter<I: IntoIterator<Item = AuthMethod>>(iter: I) -> Self {
        let mut set = AuthMethods::new();
        for method in iter {
            set.insert(method);
        }
        set
    }
}

impl fmt::Debug for AuthMethods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Key pair material for public key authentication
///
/// Keys are held as PEM/OpenSSH text and handed to the engine from memory.
/// All fields are wiped when the key pair is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    public_key: Option<String>,
    private_key: String,
    passphrase: Option<String>,
}

impl KeyPair {
    /// Create a key pair from a private key
    pub fn new(private_key: impl Into<String>) -> Self {
        Self {
            public_key: None,
            private_key: private_key.into(),
            passphrase: None,
        }
    }

    /// Provide the matching public key; libssh2 derives it otherwise
    pub fn with_public_key(mut self, public_key: impl Into<String>) -> Self {
        self.public_key = Some(public_key.into());
        self
    }

    /// Passphrase protecting the private key
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Public key text, if supplied
    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }

    /// Private key text
    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    /// Private key passphrase, if any
    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key.is_some())
            .field("private_key", &"<redacted>")
            .field("passphrase", &self.passphrase.is_some())
            .finish()
    }
}

/// Material fixed for the length of one authentication attempt
pub(crate) enum AttemptMaterial {
    Password(Zeroizing<String>),
    KeyPair(KeyPair),
}

/// Credential material supplied by the caller
#[derive(Default)]
pub struct Credentials {
    password: Option<Zeroizing<String>>,
    key_pair: Option<KeyPair>,
}

impl Credentials {
    /// No credentials
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the password
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = Some(Zeroizing::new(password.into()));
    }

    /// Replace the key pair
    pub fn set_key_pair(&mut self, key_pair: KeyPair) {
        self.key_pair = Some(key_pair);
    }

    /// Password, if supplied
    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.as_str())
    }

    /// Key pair, if supplied
    pub fn key_pair(&self) -> Option<&KeyPair> {
        self.key_pair.as_ref()
    }

    /// Whether material for `method` is present
    pub fn supports(&self, method: AuthMethod) -> bool {
        match method {
            AuthMethod::PublicKey => self.key_pair.is_some(),
            AuthMethod::Password => self.password.is_some(),
        }
    }

    /// Copy of the material for `method`, if supplied
    pub(crate) fn material(&self, method: AuthMethod) -> Option<AttemptMaterial> {
        match method {
            AuthMethod::PublicKey => self.key_pair.clone().map(AttemptMaterial::KeyPair),
            AuthMethod::Password => self.password.clone().map(AttemptMaterial::Password),
        }
    }

    /// Drop (and wipe) all material
    pub fn clear(&mut self) {
        self.password = None;
        self.key_pair = None;
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.is_some())
            .field("key_pair", &self.key_pair)
            .finish()
    }
}

/// Pick the next method to try
///
/// The first method in [`AuthMethod::PRIORITY`] that the server offers, that
/// the caller has material for and that has not already failed.
pub fn select(
    available: AuthMethods,
    failed: AuthMethods,
    credentials: &Credentials,
) -> Option<AuthMethod> {
    AuthMethod::PRIORITY
        .into_iter()
        .find(|m| available.contains(*m) && credentials.supports(*m) && !failed.contains(*m))
}
