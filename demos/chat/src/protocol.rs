//! Chat payloads carried in Mesa envelopes.

use mesa_core::Envelope;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

pub mod op {
    /// Client → server: talk to everyone.
    pub const SAY: u32 = 100;
    /// Client → server: talk to one user.
    pub const WHISPER: u32 = 101;
    /// Server → client: someone said something.
    pub const CHAT: u32 = 110;
    /// Server → client: joins, leaves and errors.
    pub const NOTICE: u32 = 111;
}

/// Authentication request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Login {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Say {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Whisper {
    pub to: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub from: String,
    pub text: String,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub text: String,
}

pub fn envelope<T: Serialize>(op: u32, body: &T) -> Envelope {
    Envelope::new(op, serde_json::to_value(body).unwrap_or_default())
}

pub fn body<T: DeserializeOwned>(envelope: &Envelope) -> Option<T> {
    serde_json::from_value(envelope.payload().clone()).ok()
}
