//! Append-only record of envelopes exchanged over one connection.

use crate::envelope::Envelope;

/// Sent and received envelopes, in order. Nothing is recorded while disabled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageHistory {
    enabled: bool,
    sent: Vec<Envelope>,
    received: Vec<Envelope>,
}

impl MessageHistory {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_sent(&mut self, envelope: &Envelope) {
        if self.enabled {
            self.sent.push(envelope.clone());
        }
    }

    pub fn record_received(&mut self, envelope: &Envelope) {
        if self.enabled {
            self.received.push(envelope.clone());
        }
    }

    pub fn sent(&self) -> &[Envelope] {
        &self.sent
    }

    pub fn received(&self) -> &[Envelope] {
        &self.received
    }
}
