//! One accepted socket and everything that happens on it.
//!
//! Each connection runs as its own task. The task exclusively owns the
//! socket, the heartbeat state, the history and the authentication state;
//! everything else talks to it through a [`ConnectionHandle`], which queues
//! commands onto the task and reads a published status snapshot.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use mesa_core::{ConnectionState, Envelope, Error, Hello, Identity, MessageHistory, Operation, op};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::auth::{AuthCompletion, AuthOutcome};
use crate::heartbeat::{HeartbeatAction, Supervisor, next_tick};
use crate::server::ServerContext;

/// Close code sent when authentication fails and the server is set to disconnect.
pub const POLICY_VIOLATION: u16 = 1008;
pub const NORMAL_CLOSURE: u16 = 1000;
const NO_STATUS: u16 = 1005;
const ABNORMAL_CLOSURE: u16 = 1006;

const EVENT_CAPACITY: usize = 256;
/// How long a close waits for the peer's answering close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Process-unique connection number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a connection's externally visible state.
#[derive(Debug, Clone)]
pub struct Status {
    pub state: ConnectionState,
    pub identity: Option<Identity>,
    pub identity_data: Option<Value>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: ConnectionState::Open,
            identity: None,
            identity_data: None,
        }
    }
}

/// Connection-local lifecycle notifications.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// An application envelope arrived.
    Message(Envelope),
    Authenticated(Identity),
    Disconnected { code: u16, reason: String },
}

pub(crate) enum Command {
    Send {
        envelope: Envelope,
        local_only: bool,
    },
    /// A pre-encoded frame routed here by the delivery bridge.
    Deliver(Arc<str>),
    Disconnect {
        code: u16,
        reason: String,
    },
    AuthCompleted(AuthOutcome),
    AuthAbandoned,
    UpdateIdentityData {
        data: Value,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    History(oneshot::Sender<MessageHistory>),
}

/// Cheap, cloneable handle to a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    pub fn identity(&self) -> Option<Identity> {
        self.status.borrow().identity.clone()
    }

    pub fn identity_data(&self) -> Option<Value> {
        self.status.borrow().identity_data.clone()
    }

    /// Send an application envelope.
    ///
    /// Once authenticated, and with a delivery bridge configured, the
    /// envelope is published to the connection's identity so every
    /// connection of that identity receives it, in any process.
    pub fn send(&self, envelope: Envelope) -> Result<(), Error> {
        self.command(Command::Send {
            envelope,
            local_only: false,
        })
    }

    /// Send an application envelope on this socket only, bypassing the bridge.
    pub fn send_local(&self, envelope: Envelope) -> Result<(), Error> {
        self.command(Command::Send {
            envelope,
            local_only: true,
        })
    }

    /// Close with a normal closure code. A no-op once closed.
    pub fn disconnect(&self) {
        self.disconnect_with(NORMAL_CLOSURE, "");
    }

    pub fn disconnect_with(&self, code: u16, reason: impl Into<String>) {
        let _ = self.command(Command::Disconnect {
            code,
            reason: reason.into(),
        });
    }

    /// Replace the identity data of an authenticated connection.
    pub async fn update_identity_data(&self, data: Value) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::UpdateIdentityData { data, reply })?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// A copy of the sent and received history.
    pub async fn history(&self) -> Result<MessageHistory, Error> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::History(reply))?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Observe this connection's events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Wait until the connection has fully closed.
    pub async fn closed(&self) {
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| s.state.is_closed()).await;
    }

    pub(crate) fn deliver(&self, frame: Arc<str>) -> bool {
        self.commands.send(Command::Deliver(frame)).is_ok()
    }

    fn command(&self, command: Command) -> Result<(), Error> {
        self.commands
            .send(command)
            .map_err(|_| Error::ConnectionClosed)
    }
}

struct Exit {
    code: u16,
    reason: String,
}

impl Exit {
    fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: ABNORMAL_CLOSURE,
            reason: reason.into(),
        }
    }
}

enum Event {
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Command(Option<Command>),
    Tick,
}

/// The task-side state of one connection.
pub(crate) struct Connection<S> {
    handle: ConnectionHandle,
    ctx: Arc<ServerContext>,
    sink: SplitSink<WebSocketStream<S>, Message>,
    stream: SplitStream<WebSocketStream<S>>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<Status>,
    history: MessageHistory,
    heartbeat: Option<Supervisor>,
    pending_auth: usize,
    stored_identity: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        ws: WebSocketStream<S>,
        ctx: Arc<ServerContext>,
    ) -> (Self, ConnectionHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(Status::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = ConnectionHandle {
            id,
            peer,
            commands: commands_tx,
            status: status_rx,
            events,
        };

        let heartbeat = ctx.config.heartbeat.enabled.then(|| {
            Supervisor::new(
                ctx.config.heartbeat.interval(),
                ctx.config.heartbeat.max_attempts,
            )
        });
        let history = MessageHistory::new(ctx.config.store_messages);
        let (sink, stream) = ws.split();

        let connection = Self {
            handle: handle.clone(),
            ctx,
            sink,
            stream,
            commands,
            status,
            history,
            heartbeat,
            pending_auth: 0,
            stored_identity: false,
        };
        (connection, handle)
    }

    pub(crate) async fn run(mut self) {
        debug!(conn_id = %self.handle.id, peer = ?self.handle.peer, "connection opened");
        let hello = Hello::from_config(&self.ctx.config).to_envelope();
        let exit = match self.write(hello.encode()).await {
            Some(exit) => exit,
            None => self.serve().await,
        };
        self.finish(exit).await;
    }

    async fn serve(&mut self) -> Exit {
        loop {
            let event = tokio::select! {
                frame = self.stream.next() => Event::Frame(frame),
                command = self.commands.recv() => Event::Command(command),
                _ = next_tick(self.heartbeat.as_mut()) => Event::Tick,
            };

            let exit = match event {
                Event::Frame(Some(Ok(message))) => self.on_message(message).await,
                Event::Frame(Some(Err(e))) => Some(Exit::abnormal(e.to_string())),
                Event::Frame(None) => Some(Exit::abnormal("socket closed")),
                Event::Command(Some(command)) => self.on_command(command).await,
                Event::Command(None) => Some(Exit::abnormal("command channel closed")),
                Event::Tick => self.on_tick().await,
            };
            if let Some(exit) = exit {
                return exit;
            }
        }
    }

    async fn on_message(&mut self, message: Message) -> Option<Exit> {
        match message {
            Message::Text(text) => self.on_frame(Envelope::decode(text.as_str())).await,
            Message::Binary(data) => self.on_frame(Envelope::decode_bytes(&data)).await,
            Message::Close(frame) => Some(match frame {
                Some(frame) => Exit {
                    code: u16::from(frame.code),
                    reason: frame.reason.as_str().to_string(),
                },
                None => Exit {
                    code: NO_STATUS,
                    reason: String::new(),
                },
            }),
            // ping/pong are answered by the transport
            _ => None,
        }
    }

    async fn on_frame(&mut self, frame: Result<Envelope, Error>) -> Option<Exit> {
        let envelope = match frame {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn_id = %self.handle.id, error = %e, "dropping malformed frame");
                return None;
            }
        };

        match envelope.operation() {
            Operation::AuthenticationRequest => {
                self.on_authentication_request(envelope.into_payload());
            }
            Operation::HeartbeatAck => {
                if let Some(supervisor) = self.heartbeat.as_mut() {
                    supervisor.state.record_ack(envelope);
                }
            }
            _ => {
                self.history.record_received(&envelope);
                let _ = self
                    .handle
                    .events
                    .send(ConnectionEvent::Message(envelope.clone()));
                for observer in &self.ctx.observers {
                    observer.on_message(&self.handle, &envelope);
                }
            }
        }
        None
    }

    fn on_authentication_request(&mut self, payload: Value) {
        if self.state() == ConnectionState::Authenticated {
            debug!(conn_id = %self.handle.id, "ignoring authentication request on authenticated connection");
            return;
        }
        let Some(callback) = self.ctx.authenticator.clone() else {
            warn!(conn_id = %self.handle.id, "authentication request received but no authenticator is registered");
            return;
        };

        let (done, rx) = AuthCompletion::new(self.handle.id);
        let commands = self.handle.commands.clone();
        tokio::spawn(async move {
            let command = match rx.await {
                Ok(outcome) => Command::AuthCompleted(outcome),
                Err(_) => Command::AuthAbandoned,
            };
            // fails once the connection is gone, which makes late completions no-ops
            let _ = commands.send(command);
        });

        self.pending_auth += 1;
        self.set_state(ConnectionState::Authenticating);
        callback(payload, done);
    }

    async fn on_command(&mut self, command: Command) -> Option<Exit> {
        match command {
            Command::Send {
                envelope,
                local_only,
            } => {
                self.history.record_sent(&envelope);
                self.route(envelope, local_only).await
            }
            Command::Deliver(frame) => self.write(frame.to_string()).await,
            Command::Disconnect { code, reason } => Some(self.close(code, reason).await),
            Command::AuthCompleted(outcome) => self.on_auth_completed(outcome).await,
            Command::AuthAbandoned => {
                self.pending_auth = self.pending_auth.saturating_sub(1);
                self.settle_unauthenticated();
                None
            }
            Command::UpdateIdentityData { data, reply } => {
                let _ = reply.send(self.update_identity_data(data));
                None
            }
            Command::History(reply) => {
                let _ = reply.send(self.history.clone());
                None
            }
        }
    }

    async fn route(&mut self, envelope: Envelope, local_only: bool) -> Option<Exit> {
        let identity = self.status.borrow().identity.clone();
        let bridge = self.ctx.live_bridge().cloned();

        if let (Some(bridge), Some(identity), false) = (bridge.as_ref(), identity, local_only) {
            match bridge.publish(&envelope, vec![identity]).await {
                Ok(()) => return None,
                Err(e) => {
                    warn!(conn_id = %self.handle.id, error = %e, "publish failed, delivering locally");
                }
            }
        } else if self.ctx.bridge.is_some() && !self.is_identified() {
            debug!(conn_id = %self.handle.id, "connection has no identity, cross-process delivery skipped");
        } else if self.ctx.bridge.is_some() && !local_only {
            debug!(conn_id = %self.handle.id, "delivery bridge not subscribed, writing directly");
        }
        self.write(envelope.encode()).await
    }

    async fn on_auth_completed(&mut self, outcome: AuthOutcome) -> Option<Exit> {
        self.pending_auth = self.pending_auth.saturating_sub(1);
        if self.state() == ConnectionState::Authenticated {
            debug!(conn_id = %self.handle.id, "ignoring authentication result, already authenticated");
            return None;
        }

        match outcome {
            Ok((identity, data)) => self.on_authenticated(identity, data).await,
            Err(e) => {
                info!(conn_id = %self.handle.id, error = %e, "authentication failed");
                if self.ctx.config.authentication.disconnect_on_fail {
                    return Some(self.close(POLICY_VIOLATION, e.to_string()).await);
                }
                self.settle_unauthenticated();
                None
            }
        }
    }

    async fn on_authenticated(&mut self, identity: Identity, data: Value) -> Option<Exit> {
        let ctx = Arc::clone(&self.ctx);
        let auth = &ctx.config.authentication;

        self.status.send_modify(|s| {
            s.identity = Some(identity.clone());
            s.identity_data = Some(data.clone());
        });

        if auth.store_connected_identities {
            if let Some(bridge) = &ctx.bridge {
                match bridge.add_connected(&identity).await {
                    Ok(()) => self.stored_identity = true,
                    Err(e) => {
                        warn!(conn_id = %self.handle.id, %identity, error = %e, "could not record connected identity");
                    }
                }
            }
        }

        let ack = if auth.send_identity_data_on_ack {
            Envelope::new(op::AUTHENTICATION_RESULT, data)
        } else {
            Envelope::new(op::AUTHENTICATION_RESULT, json!({}))
        };
        if let Some(exit) = self.write(ack.encode()).await {
            return Some(exit);
        }

        self.set_state(ConnectionState::Authenticated);
        ctx.registry.insert(identity.clone(), self.handle.clone()).await;
        info!(conn_id = %self.handle.id, %identity, "authenticated");

        let _ = self
            .handle
            .events
            .send(ConnectionEvent::Authenticated(identity));
        for observer in &ctx.observers {
            observer.on_authenticated(&self.handle);
        }
        None
    }

    fn update_identity_data(&mut self, data: Value) -> Result<(), Error> {
        if self.state() != ConnectionState::Authenticated {
            return Err(Error::NotAuthenticated);
        }
        if data.is_null() {
            return Err(Error::AuthenticationContractViolation("identity data"));
        }
        self.status.send_modify(|s| s.identity_data = Some(data));
        Ok(())
    }

    async fn on_tick(&mut self) -> Option<Exit> {
        let action = self.heartbeat.as_mut()?.state.tick();
        match action {
            HeartbeatAction::Ping(ping) => self.write(ping.encode()).await,
            HeartbeatAction::Disconnect { attempts } => {
                let reason = Error::HeartbeatTimeout { attempts }.to_string();
                info!(conn_id = %self.handle.id, attempts, "heartbeat timed out");
                Some(self.close(NORMAL_CLOSURE, reason).await)
            }
        }
    }

    async fn write(&mut self, text: String) -> Option<Exit> {
        match self.sink.send(Message::Text(text.into())).await {
            Ok(()) => None,
            Err(e) => {
                debug!(conn_id = %self.handle.id, error = %e, "write failed");
                Some(Exit::abnormal(e.to_string()))
            }
        }
    }

    async fn close(&mut self, code: u16, reason: String) -> Exit {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.clone().into(),
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            debug!(conn_id = %self.handle.id, error = %e, "close frame not sent");
            return Exit { code, reason };
        }

        // read until the peer answers the close
        let stream = &mut self.stream;
        let answered = tokio::time::timeout(CLOSE_TIMEOUT, async {
            while let Some(Ok(message)) = stream.next().await {
                if message.is_close() {
                    break;
                }
            }
        })
        .await;
        if answered.is_err() {
            debug!(conn_id = %self.handle.id, "peer did not answer close frame");
        }
        Exit { code, reason }
    }

    async fn finish(mut self, exit: Exit) {
        self.heartbeat = None;

        let identity = self.status.borrow().identity.clone();
        if let Some(identity) = identity {
            self.ctx.registry.remove(&identity, self.handle.id).await;
            if self.stored_identity {
                if let Some(bridge) = &self.ctx.bridge {
                    if let Err(e) = bridge.remove_connected(&identity).await {
                        warn!(conn_id = %self.handle.id, %identity, error = %e, "could not clear connected identity");
                    }
                }
            }
        }
        self.ctx.connections.write().await.remove(&self.handle.id);
        self.set_state(ConnectionState::Closed);

        info!(conn_id = %self.handle.id, code = exit.code, reason = %exit.reason, "connection closed");
        let _ = self.handle.events.send(ConnectionEvent::Disconnected {
            code: exit.code,
            reason: exit.reason.clone(),
        });
        for observer in &self.ctx.observers {
            observer.on_disconnection(&self.handle, exit.code, &exit.reason);
        }
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn is_identified(&self) -> bool {
        self.status.borrow().identity.is_some()
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|s| s.state = state);
    }

    fn settle_unauthenticated(&self) {
        if self.pending_auth == 0 && self.state() == ConnectionState::Authenticating {
            self.set_state(ConnectionState::Open);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::detached_handle;
    use super::*;

    #[test]
    fn fresh_handle_is_open_and_anonymous() {
        let (handle, _rx) = detached_handle(3);
        assert_eq!(handle.id().get(), 3);
        assert_eq!(handle.state(), ConnectionState::Open);
        assert!(!handle.is_authenticated());
        assert!(handle.identity().is_none());
    }

    #[test]
    fn send_fails_once_task_is_gone() {
        let (handle, rx) = detached_handle(3);
        assert!(handle.send(Envelope::empty(5)).is_ok());
        drop(rx);
        assert_eq!(handle.send(Envelope::empty(5)), Err(Error::ConnectionClosed));
        // disconnecting a dead connection is a no-op
        handle.disconnect();
    }
}
