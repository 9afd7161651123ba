//! Client configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// What to do with host keys the trust store does not vouch for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Trust unknown keys on first use; report mismatches and continue
    AcceptNew,
    /// Report unknown and mismatching keys and continue; the caller decides
    #[default]
    Strict,
    /// Report unknown and mismatching keys and abandon the connection
    Reject,
}

/// Where to connect and as whom
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Remote username
    pub username: String,
    /// Remote hostname or IP
    pub host: String,
    /// Remote port
    pub port: u16,
}

impl Target {
    /// Create a new target
    pub fn new(username: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            username: username.into(),
            host: host.into(),
            port,
        }
    }

    /// Parse `[user@]host[:port]`
    pub fn parse(target: &str) -> Self {
        let mut username = "root".to_string();
        let mut host = target.to_string();
        let mut port = DEFAULT_PORT;

        if let Some(at_pos) = target.find('@') {
            username = target[..at_pos].to_string();
            host = target[at_pos + 1..].to_string();
        }

        if let Some(colon_pos) = host.rfind(':') {
            if let Ok(parsed_port) = host[colon_pos + 1..].parse::<u16>() {
                port = parsed_port;
                host = host[..colon_pos].to_string();
            }
        }

        Self { username, host, port }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Time budget of a single connect attempt, up to the first outcome
    pub connect_timeout: Duration,
    /// Extra attempts after the first one fails
    pub retries: u32,
    /// Keep-alive period once authenticated
    pub keepalive_interval: Duration,
    /// Traffic sample period
    pub traffic_sample_interval: Duration,
    /// Host key checking policy
    pub host_key_policy: HostKeyPolicy,
    /// Known hosts file loaded into every fresh trust store
    pub known_hosts: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            retries: 0,
            keepalive_interval: Duration::from_secs(10),
            traffic_sample_interval: Duration::from_secs(1),
            host_key_policy: HostKeyPolicy::default(),
            known_hosts: None,
        }
    }
}

impl ClientConfig {
    /// Parse a JSON configuration document; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self, crate::SkiffError> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            crate::SkiffError::Configuration(format!("Invalid client config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the timers cannot run with
    pub fn validate(&self) -> Result<(), crate::SkiffError> {
        if self.connect_timeout.is_zero() {
            return Err(crate::SkiffError::Configuration(
                "connect_timeout must be non-zero".to_string(),
            ));
        }
        if self.keepalive_interval.is_zero() || self.traffic_sample_interval.is_zero() {
            return Err(crate::SkiffError::Configuration(
                "timer intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
