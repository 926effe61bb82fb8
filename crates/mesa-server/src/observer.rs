//! Server-level lifecycle hooks.
//!
//! Observers are registered on the server builder and invoked in
//! registration order from the connection's own task. Hooks must not block.

use mesa_core::Envelope;
use tokio::sync::mpsc;

use crate::connection::ConnectionHandle;

pub trait Observer: Send + Sync + 'static {
    /// Runs before the connection reads its first frame; subscribing to the
    /// connection here sees every event.
    fn on_connection(&self, _connection: &ConnectionHandle) {}

    fn on_authenticated(&self, _connection: &ConnectionHandle) {}

    fn on_message(&self, _connection: &ConnectionHandle, _envelope: &Envelope) {}

    fn on_disconnection(&self, _connection: &ConnectionHandle, _code: u16, _reason: &str) {}
}

/// A lifecycle hook, as a value.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connected(ConnectionHandle),
    Authenticated(ConnectionHandle),
    Message(ConnectionHandle, Envelope),
    Disconnected {
        connection: ConnectionHandle,
        code: u16,
        reason: String,
    },
}

/// Observer that forwards every hook into a channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Observer for ChannelObserver {
    fn on_connection(&self, connection: &ConnectionHandle) {
        let _ = self.tx.send(ServerEvent::Connected(connection.clone()));
    }

    fn on_authenticated(&self, connection: &ConnectionHandle) {
        let _ = self.tx.send(ServerEvent::Authenticated(connection.clone()));
    }

    fn on_message(&self, connection: &ConnectionHandle, envelope: &Envelope) {
        let _ = self
            .tx
            .send(ServerEvent::Message(connection.clone(), envelope.clone()));
    }

    fn on_disconnection(&self, connection: &ConnectionHandle, code: u16, reason: &str) {
        let _ = self.tx.send(ServerEvent::Disconnected {
            connection: connection.clone(),
            code,
            reason: reason.to_string(),
        });
    }
}
