//! Authenticated identities.
//!
//! An identity is the stable key a connection is addressed by once it has
//! authenticated. Any non-empty string is accepted (`u1`, `user:42`,
//! `alice@example.com`); interpretation is up to the application.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A validated, non-empty identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Create an identity, rejecting empty (or whitespace-only) strings.
    pub fn new(value: impl Into<String>) -> Result<Self, IdentityParseError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(IdentityParseError::Empty);
        }
        Ok(Self(value))
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Error parsing an identity string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityParseError {
    #[error("identity cannot be empty")]
    Empty,
}
