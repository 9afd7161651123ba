//! Known hosts trust store
//!
//! Entries are kept as raw public key blobs keyed by hostname and key type.
//! The persisted form is OpenSSH's `known_hosts` text format, where the blob
//! is base64 encoded; encoding happens only at the file boundary so that
//! comparisons always work on the raw bytes.

use crate::{HostIdentity, HostKeyType, TransportError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Result of checking a host identity against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// A stored key for this host and key type matches byte for byte
    Match,
    /// A stored key for this host and key type differs
    Mismatch,
    /// Nothing stored for this host and key type
    NotFound,
}

/// A single trusted host key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHost {
    /// Hostname as given on connect
    pub hostname: String,
    /// Key algorithm
    pub key_type: HostKeyType,
    /// Raw key blob
    pub key: Bytes,
}

/// In-memory set of trusted host keys
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    entries: HashMap<(String, HostKeyType), Bytes>,
}

impl TrustStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Trust `identity` for `hostname`, replacing any key of the same type
    pub fn add(&mut self, hostname: &str, identity: &HostIdentity) -> Result<(), TransportError> {
        if identity.key_type == HostKeyType::Unknown {
            return Err(TransportError::UnsupportedKeyType);
        }

        debug!("Trusting {} key for {}", identity.key_type, hostname);
        self.entries
            .insert((hostname.to_string(), identity.key_type), identity.key.clone());
        Ok(())
    }

    /// Check `identity` against the stored keys for `hostname`
    pub fn verify(&self, hostname: &str, identity: &HostIdentity) -> Verification {
        match self.entries.get(&(hostname.to_string(), identity.key_type)) {
            Some(key) if key == &identity.key => Verification::Match,
            Some(_) => Verification::Mismatch,
            None => Verification::NotFound,
        }
    }

    /// All stored keys, sorted by hostname then key type
    pub fn hosts(&self) -> Vec<KnownHost> {
        let mut hosts: Vec<KnownHost> = self
            .entries
            .iter()
            .map(|((hostname, key_type), key)| KnownHost {
                hostname: hostname.clone(),
                key_type: *key_type,
                key: key.clone(),
            })
            .collect();
        hosts.sort_by(|a, b| (&a.hostname, a.key_type).cmp(&(&b.hostname, b.key_type)));
        hosts
    }

    /// Merge entries parsed from known hosts text; returns how many were added
    pub fn parse(&mut self, text: &str) -> usize {
        let mut added = 0;

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match parse_line(line) {
                Some((hosts, key_type, key)) => {
                    for host in hosts {
                        self.entries.insert((host, key_type), key.clone());
                        added += 1;
                    }
                }
                None => debug!("Skipping known hosts line {}", lineno + 1),
            }
        }

        added
    }

    /// Render all entries as known hosts text
    pub fn render(&self) -> String {
        let mut out = String::new();
        for host in self.hosts() {
            // Unknown types never enter the store
            if let Some(tag) = host.key_type.tag() {
                let key = STANDARD.encode(&host.key);
                out.push_str(&format!("{} {} {}\n", host.hostname, tag, key));
            }
        }
        out
    }

    /// Load entries from a known hosts file, merging with what is stored
    pub fn load(&mut self, path: &Path) -> Result<usize, TransportError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TransportError::KnownHosts(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let added = self.parse(&text);
        debug!("Loaded {} known hosts from {}", added, path.display());
        Ok(added)
    }

    /// Write every entry to a known hosts file
    pub fn save(&self, path: &Path) -> Result<(), TransportError> {
        std::fs::write(path, self.render()).map_err(|e| {
            TransportError::KnownHosts(format!("Failed to write {}: {}", path.display(), e))
        })?;
        debug!("Saved {} known hosts to {}", self.len(), path.display());
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<(Vec<String>, HostKeyType, Bytes)> {
    // @cert-authority and @revoked carry semantics this store does not model
    if line.starts_with('@') {
        return None;
    }

    let mut fields = line.split_whitespace();
    let hosts = fields.next()?;
    let key_type = HostKeyType::from_tag(fields.next()?);
    let key = STANDARD.decode(fields.next()?).ok()?;

    if key_type == HostKeyType::Unknown || key.is_empty() {
        return None;
    }

    let hosts: Vec<String> = hosts
        .split(',')
        .filter(|h| !h.is_empty() && !h.starts_with("|1|") && !h.starts_with('!'))
        .map(str::to_string)
        .collect();
    if hosts.is_empty() {
        return None;
    }

    Some((hosts, key_type, Bytes::from(key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn identity(key_type: HostKeyType, key: &[u8]) -> HostIdentity {
        HostIdentity::new(key_type, key.to_vec(), vec![0u8; 16])
    }

    #[test]
    fn test_add_and_verify() {
        let mut store = TrustStore::new();
        let key = identity(HostKeyType::Rsa, b"rsa-key");

        assert_eq!(store.verify("example.com", &key), Verification::NotFound);
        store.add("example.com", &key).unwrap();
        assert_eq!(store.verify("example.com", &key), Verification::Match);

        let other = identity(HostKeyType::Rsa, b"another-key");
        assert_eq!(store.verify("example.com", &other), Verification::Mismatch);
        assert_eq!(store.verify("other.example.com", &key), Verification::NotFound);
    }

    #[test]
    fn test_verify_is_per_key_type() {
        let mut store = TrustStore::new();
        store.add("example.com", &identity(HostKeyType::Rsa, b"rsa-key")).unwrap();

        let ed = identity(HostKeyType::Ed25519, b"ed-key");
        assert_eq!(store.verify("example.com", &ed), Verification::NotFound);
    }

    #[test]
    fn test_add_unknown_type_fails() {
        let mut store = TrustStore::new();
        let result = store.add("example.com", &identity(HostKeyType::Unknown, b"key"));
        assert!(matches!(result, Err(TransportError::UnsupportedKeyType)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_add_replaces_same_type() {
        let mut store = TrustStore::new();
        store.add("example.com", &identity(HostKeyType::Rsa, b"old")).unwrap();
        store.add("example.com", &identity(HostKeyType::Rsa, b"new")).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.verify("example.com", &identity(HostKeyType::Rsa, b"new")),
            Verification::Match
        );
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let text = format!(
            "# comment\n\
             \n\
             good.example.com ssh-rsa {}\n\
             missing-key ssh-rsa\n\
             bad-base64 ssh-rsa !!!notbase64!!!\n\
             weird.example.com x509v3-sign-rsa {}\n\
             |1|c2FsdA==|aGFzaA== ssh-ed25519 {}\n\
             @cert-authority *.example.com ssh-rsa {}\n\
             a.example.com,b.example.com ssh-ed25519 {} trailing comment\n",
            STANDARD.encode(b"good"),
            STANDARD.encode(b"weird"),
            STANDARD.encode(b"hashed"),
            STANDARD.encode(b"ca"),
            STANDARD.encode(b"multi"),
        );

        let mut store = TrustStore::new();
        let added = store.parse(&text);

        assert_eq!(added, 3);
        assert_eq!(
            store.verify("good.example.com", &identity(HostKeyType::Rsa, b"good")),
            Verification::Match
        );
        assert_eq!(
            store.verify("a.example.com", &identity(HostKeyType::Ed25519, b"multi")),
            Verification::Match
        );
        assert_eq!(
            store.verify("b.example.com", &identity(HostKeyType::Ed25519, b"multi")),
            Verification::Match
        );
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TrustStore::new();
        let result = store.load(&dir.path().join("does-not-exist"));
        assert!(matches!(result, Err(TransportError::KnownHosts(_))));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        let mut store = TrustStore::new();
        store.add("example.com", &identity(HostKeyType::Rsa, b"rsa-key")).unwrap();
        store.add("[example.com]:2222", &identity(HostKeyType::Ed25519, b"ed-key")).unwrap();
        store.save(&path).unwrap();

        let mut loaded = TrustStore::new();
        assert_eq!(loaded.load(&path).unwrap(), 2);
        assert_eq!(loaded.hosts(), store.hosts());
    }

    fn key_type_strategy() -> impl Strategy<Value = HostKeyType> {
        prop_oneof![
            Just(HostKeyType::Rsa),
            Just(HostKeyType::Dss),
            Just(HostKeyType::Ecdsa256),
            Just(HostKeyType::Ed25519),
        ]
    }

    fn entry_strategy() -> impl Strategy<Value = (String, HostKeyType, Vec<u8>)> {
        (
            "[a-z]{1,8}(\\.[a-z]{2,4})?",
            key_type_strategy(),
            prop::collection::vec(any::<u8>(), 1..64),
        )
    }

    proptest! {
        #[test]
        fn prop_render_parse_preserves_verification(
            entries in prop::collection::vec(entry_strategy(), 0..16),
            lookups in prop::collection::vec(entry_strategy(), 0..8),
        ) {
            let mut original = TrustStore::new();
            for (host, key_type, key) in &entries {
                original.add(host, &identity(*key_type, key)).unwrap();
            }

            let mut reloaded = TrustStore::new();
            reloaded.parse(&original.render());

            for (host, key_type, key) in entries.iter().chain(lookups.iter()) {
                let candidate = identity(*key_type, key);
                prop_assert_eq!(
                    original.verify(host, &candidate),
                    reloaded.verify(host, &candidate)
                );
            }
        }
    }
}
