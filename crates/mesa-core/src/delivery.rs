//! Addressed delivery records carried on the cross-process broadcast channel.

use crate::envelope::Envelope;
use crate::error::Error;
use crate::Identity;
use serde::{Deserialize, Serialize};

/// An envelope addressed to one or more identities, wherever they are connected.
///
/// `message` holds the already-encoded envelope so receiving processes can
/// forward it to sockets without re-encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message: String,
    pub recipients: Vec<Identity>,
}

impl DeliveryRecord {
    pub fn new(envelope: &Envelope, recipients: Vec<Identity>) -> Self {
        Self {
            message: envelope.encode(),
            recipients,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(data: &str) -> Result<Self, Error> {
        serde_json::from_str(data).map_err(|e| Error::MalformedFrame(e.to_string()))
    }
}
