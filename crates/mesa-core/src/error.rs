//! Error taxonomy shared by server and client.

use crate::identity::IdentityParseError;

/// Errors raised by the Mesa crates.
///
/// Everything except [`Error::InvalidConfig`] is scoped to a single
/// connection or session; none of them should take the process down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A frame could not be decoded into an envelope.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The authentication callback produced a result without a required field.
    #[error("authentication result is missing {0}")]
    AuthenticationContractViolation(&'static str),

    /// The application explicitly refused the authentication request.
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("no heartbeat acknowledgement after {attempts} attempts")]
    HeartbeatTimeout { attempts: u32 },

    /// The external pub/sub store could not be reached.
    #[error("delivery bridge unavailable: {0}")]
    BridgeUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection is not authenticated")]
    NotAuthenticated,

    #[error("timed out waiting for authentication result")]
    AuthenticationTimeout,

    #[error("server version {server} does not match client version {client}")]
    VersionMismatch { server: String, client: String },

    #[error(transparent)]
    Identity(#[from] IdentityParseError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
