//! Wire envelope and its codec.
//!
//! Every frame on a Mesa socket is a JSON object
//! `{"op": <code>, "d": <payload>, "t": <timestamp?>}`. The operation code
//! selects how the receiver dispatches it; a handful of codes are reserved
//! for the protocol itself (see [`op`]), everything else belongs to the
//! application.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved operation codes.
pub mod op {
    /// Heartbeat ping, server to client.
    pub const HEARTBEAT_PING: u32 = 1;
    /// Authentication request, client to server.
    pub const AUTHENTICATION_REQUEST: u32 = 2;
    /// Connection settings sent right after the socket opens, server to client.
    pub const HELLO: u32 = 10;
    /// Heartbeat acknowledgement, client to server.
    pub const HEARTBEAT_ACK: u32 = 11;
    /// Authentication result, server to client.
    pub const AUTHENTICATION_RESULT: u32 = 22;
}

/// Classified operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    HeartbeatPing,
    HeartbeatAck,
    AuthenticationRequest,
    AuthenticationResult,
    Hello,
    /// Any code the protocol does not reserve.
    Application(u32),
}

impl Operation {
    pub fn code(self) -> u32 {
        match self {
            Self::HeartbeatPing => op::HEARTBEAT_PING,
            Self::HeartbeatAck => op::HEARTBEAT_ACK,
            Self::AuthenticationRequest => op::AUTHENTICATION_REQUEST,
            Self::AuthenticationResult => op::AUTHENTICATION_RESULT,
            Self::Hello => op::HELLO,
            Self::Application(code) => code,
        }
    }
}

impl From<u32> for Operation {
    fn from(code: u32) -> Self {
        match code {
            op::HEARTBEAT_PING => Self::HeartbeatPing,
            op::HEARTBEAT_ACK => Self::HeartbeatAck,
            op::AUTHENTICATION_REQUEST => Self::AuthenticationRequest,
            op::AUTHENTICATION_RESULT => Self::AuthenticationResult,
            op::HELLO => Self::Hello,
            other => Self::Application(other),
        }
    }
}

/// The unit of data exchanged over a connection. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    op: u32,
    #[serde(rename = "d", default)]
    payload: Value,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<u64>,
}

impl Envelope {
    pub fn new(op: u32, payload: Value) -> Self {
        Self {
            op,
            payload,
            timestamp: None,
        }
    }

    /// Create an envelope carrying a timestamp (milliseconds, caller-defined epoch).
    pub fn with_timestamp(op: u32, payload: Value, timestamp: u64) -> Self {
        Self {
            op,
            payload,
            timestamp: Some(timestamp),
        }
    }

    /// An envelope with an empty object payload.
    pub fn empty(op: u32) -> Self {
        Self::new(op, Value::Object(Map::new()))
    }

    pub fn op(&self) -> u32 {
        self.op
    }

    pub fn operation(&self) -> Operation {
        Operation::from(self.op)
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    /// Serialize to the textual wire form.
    pub fn encode(&self) -> String {
        let mut frame = Map::with_capacity(3);
        frame.insert("op".into(), Value::from(self.op));
        frame.insert("d".into(), self.payload.clone());
        if let Some(t) = self.timestamp {
            frame.insert("t".into(), Value::from(t));
        }
        Value::Object(frame).to_string()
    }

    /// Parse the textual wire form. Only a JSON object is an envelope.
    pub fn decode(frame: &str) -> Result<Self, Error> {
        let value: Value =
            serde_json::from_str(frame).map_err(|e| Error::MalformedFrame(e.to_string()))?;
        if !value.is_object() {
            return Err(Error::MalformedFrame("envelope must be a JSON object".into()));
        }
        serde_json::from_value(value).map_err(|e| Error::MalformedFrame(e.to_string()))
    }

    /// Parse a binary frame, which must hold UTF-8 JSON.
    pub fn decode_bytes(frame: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(frame).map_err(|e| Error::MalformedFrame(e.to_string()))?;
        Self::decode(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip_preserves_op_payload_and_timestamp() {
        let cases = [
            Envelope::new(7, json!({"text": "hi", "n": [1, 2, 3]})),
            Envelope::empty(op::AUTHENTICATION_RESULT),
            Envelope::with_timestamp(40, json!("plain"), 1_700_000_000_000),
            Envelope::new(0, Value::Null),
        ];
        for envelope in cases {
            let decoded = Envelope::decode(&envelope.encode()).unwrap();
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn wire_field_names() {
        let encoded = Envelope::with_timestamp(2, json!({"token": "abc"}), 5).encode();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value, json!({"op": 2, "d": {"token": "abc"}, "t": 5}));

        let encoded = Envelope::empty(22).encode();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value, json!({"op": 22, "d": {}}));
        assert!(!encoded.contains("\"t\""));
    }

    #[test]
    fn missing_payload_decodes_as_null() {
        let envelope = Envelope::decode(r#"{"op": 11}"#).unwrap();
        assert_eq!(envelope.operation(), Operation::HeartbeatAck);
        assert_eq!(envelope.payload(), &Value::Null);
    }

    #[test]
    fn malformed_frames() {
        for frame in ["", "not json", "[1,2]", "[11]", r#"[2, {"token": "abc"}]"#, "11", "null", r#"{"d": {}}"#, r#"{"op": -1}"#, r#"{"op": "x"}"#] {
            assert!(
                matches!(Envelope::decode(frame), Err(Error::MalformedFrame(_))),
                "{frame:?} should be malformed"
            );
        }
        assert!(matches!(
            Envelope::decode_bytes(&[0xff, 0xfe]),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn classify_codes() {
        assert_eq!(Operation::from(1), Operation::HeartbeatPing);
        assert_eq!(Operation::from(2), Operation::AuthenticationRequest);
        assert_eq!(Operation::from(10), Operation::Hello);
        assert_eq!(Operation::from(11), Operation::HeartbeatAck);
        assert_eq!(Operation::from(22), Operation::AuthenticationResult);
        assert_eq!(Operation::from(3), Operation::Application(3));
        assert_eq!(Operation::Application(99).code(), 99);
    }
}
