//! Server and client configuration.
//!
//! Every field has a default, so a TOML file only needs to name what it
//! changes:
//!
//! ```toml
//! store_messages = true
//! namespace = "tenant-a"
//!
//! [heartbeat]
//! enabled = true
//! interval = 5000
//! max_attempts = 3
//!
//! [authentication]
//! disconnect_on_fail = true
//! ```

use crate::error::Error;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
const DEFAULT_HEARTBEAT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;
const DEFAULT_AUTHENTICATION_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_QUEUED: usize = 1024;

/// Server-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub heartbeat: HeartbeatConfig,
    pub authentication: AuthenticationConfig,
    /// Keep per-connection sent/received history.
    pub store_messages: bool,
    /// Isolates the broadcast channel and connected-identities set of one deployment.
    pub namespace: Option<String>,
    /// Settings advertised to clients in the hello envelope.
    pub client: ClientSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Milliseconds between pings.
    pub interval: u64,
    pub max_attempts: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: DEFAULT_HEARTBEAT_INTERVAL_MS,
            max_attempts: DEFAULT_HEARTBEAT_MAX_ATTEMPTS,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthenticationConfig {
    /// Close with 1008 when the application rejects an authentication request.
    pub disconnect_on_fail: bool,
    /// Track authenticated identities in the shared store.
    pub store_connected_identities: bool,
    /// Echo identity data back in the authentication result.
    pub send_identity_data_on_ack: bool,
}

/// Client-facing settings, forwarded verbatim in the hello envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub enforce_equal_versions: bool,
    /// Milliseconds between reconnection attempts.
    pub reconnect_interval: Option<u64>,
    /// Milliseconds a client waits for an authentication result.
    pub authentication_timeout: Option<u64>,
}

impl ServerConfig {
    pub fn from_toml_str(data: &str) -> Result<Self, Error> {
        let config: Self = parse_toml(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::from_toml_str(&read(path.as_ref())?)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.heartbeat.enabled && self.heartbeat.interval == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat.interval must be greater than zero".into(),
            ));
        }
        if self.namespace.as_deref().is_some_and(|ns| ns.trim().is_empty()) {
            return Err(Error::InvalidConfig("namespace cannot be empty".into()));
        }
        if self.client.reconnect_interval == Some(0) {
            return Err(Error::InvalidConfig(
                "client.reconnect_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Key of the shared connected-identities set.
    pub fn connected_identities_key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("connected_identities-{ns}"),
            None => "connected_identities".to_string(),
        }
    }

    /// Name of the cross-process broadcast channel.
    pub fn broadcast_channel(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("mesa-{ns}"),
            None => "mesa".to_string(),
        }
    }
}

/// Settings for a client-side session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Start connecting as soon as the session is created.
    pub auto_connect: bool,
    /// Milliseconds between reconnection attempts, until the server says otherwise.
    pub reconnect_interval: u64,
    /// Milliseconds to wait for an authentication result, until the server says otherwise.
    pub authentication_timeout: u64,
    /// Envelopes held while disconnected. The oldest is dropped beyond this.
    pub max_queued: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL_MS,
            authentication_timeout: DEFAULT_AUTHENTICATION_TIMEOUT_MS,
            max_queued: DEFAULT_MAX_QUEUED,
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(data: &str) -> Result<Self, Error> {
        let config: Self = parse_toml(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::from_toml_str(&read(path.as_ref())?)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.reconnect_interval == 0 {
            return Err(Error::InvalidConfig(
                "reconnect_interval must be greater than zero".into(),
            ));
        }
        if self.max_queued == 0 {
            return Err(Error::InvalidConfig(
                "max_queued must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval)
    }

    pub fn authentication_timeout(&self) -> Duration {
        Duration::from_millis(self.authentication_timeout)
    }
}

fn parse_toml<T: DeserializeOwned>(data: &str) -> Result<T, Error> {
    toml::from_str(data).map_err(|e| Error::InvalidConfig(e.to_string()))
}

fn read(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))
}
