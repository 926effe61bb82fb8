//! Core types for Mesa.
//!
//! This crate holds everything both ends of a connection agree on: the
//! envelope framing, reserved operation codes, identities, rules and
//! configuration. It does no I/O.

mod config;
mod delivery;
mod envelope;
mod error;
mod history;
mod identity;
mod rule;

pub use config::{
    AuthenticationConfig, ClientConfig, ClientSettings, HeartbeatConfig, ServerConfig,
};
pub use delivery::DeliveryRecord;
pub use envelope::{Envelope, Operation, op};
pub use error::{Error, Result};
pub use history::MessageHistory;
pub use identity::{Identity, IdentityParseError};
pub use rule::{Rule, Rules};

use serde::{Deserialize, Serialize};

/// Protocol version advertised in the hello envelope.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Connection settings the server sends as the payload of the hello envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c_heartbeat_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c_reconnect_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c_authentication_timeout: Option<u64>,
    #[serde(default)]
    pub rules: Rules,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Hello {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            c_heartbeat_interval: config
                .heartbeat
                .enabled
                .then_some(config.heartbeat.interval),
            c_reconnect_interval: config.client.reconnect_interval,
            c_authentication_timeout: config.client.authentication_timeout,
            rules: Rules::derive(config),
            version: Some(VERSION.to_string()),
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(
            op::HELLO,
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        )
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        serde_json::from_value(envelope.payload().clone())
            .map_err(|e| Error::MalformedFrame(e.to_string()))
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Socket accepted, not authenticated.
    Open,
    /// Authentication callback invoked, awaiting its result.
    Authenticating,
    /// Authenticated; terminal success.
    Authenticated,
    /// Socket gone.
    Closed,
}

impl ConnectionState {
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}
