use std::time::Duration;

use mesa_core::{ClientConfig, Envelope, Error, MessageHistory, Rules};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::driver::{Command, Driver};

const EVENT_CAPACITY: usize = 256;

/// Something that happened on a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A socket opened (initially or after a reconnect).
    Connected,
    /// An application envelope arrived from the server.
    Message(Envelope),
    /// The server acknowledged authentication; carries the ack payload.
    Authenticated(Value),
    Disconnected { code: u16, reason: String },
    Error(Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthenticateOptions {
    /// Send the same request again after every reconnect, before queued
    /// envelopes are flushed.
    pub resync: bool,
}

/// Snapshot of a session's state.
#[derive(Debug, Clone)]
pub struct Status {
    pub connected: bool,
    pub authenticated: bool,
    /// Disconnected for good; nothing more will be sent.
    pub closed: bool,
    /// Envelopes waiting for a socket.
    pub queued: usize,
    /// Rules advertised by the server in its last hello.
    pub rules: Rules,
    pub reconnect_interval: Duration,
    pub authentication_timeout: Duration,
}

/// Handle to a client session. Clones share one connection.
///
/// The session runs until [`Session::disconnect`] is called or every clone
/// is dropped.
#[derive(Clone)]
pub struct Session {
    url: String,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    /// Create a session for `url`. Must be called within a tokio runtime.
    ///
    /// With `auto_connect` set the first connection attempt starts right
    /// away; otherwise nothing happens until [`Session::connect`].
    pub fn new(url: impl Into<String>, config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        let url = url.into();
        if url.is_empty() {
            return Err(Error::InvalidConfig("url cannot be empty".into()));
        }

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(Status {
            connected: false,
            authenticated: false,
            closed: false,
            queued: 0,
            rules: Rules::default(),
            reconnect_interval: config.reconnect_interval(),
            authentication_timeout: config.authentication_timeout(),
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let driver = Driver::new(
            url.clone(),
            commands_rx,
            status,
            events.clone(),
            config.max_queued,
        );
        tokio::spawn(driver.run(config.auto_connect));

        Ok(Self {
            url,
            commands,
            status: status_rx,
            events,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Start connecting and wait for the first socket to open.
    ///
    /// Returns immediately if already connected.
    pub async fn connect(&self) -> Result<(), Error> {
        self.command(Command::Connect)?;
        let mut status = self.status.clone();
        let closed = status
            .wait_for(|s| s.connected || s.closed)
            .await
            .map_err(|_| Error::ConnectionClosed)?
            .closed;
        if closed {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Send an envelope now, or queue it until a socket is open.
    ///
    /// The queue holds at most `max_queued` envelopes; past that the oldest
    /// is dropped with a warning.
    pub fn send(&self, envelope: Envelope) -> Result<(), Error> {
        self.command(Command::Send(envelope))
    }

    /// Ask the server to authenticate this session.
    ///
    /// Resolves with the payload of the server's acknowledgement, or fails
    /// with `AuthenticationTimeout` if none arrives in time.
    pub async fn authenticate(
        &self,
        payload: Value,
        options: AuthenticateOptions,
    ) -> Result<Value, Error> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Authenticate {
            payload,
            resync: options.resync,
            reply,
        })?;
        let timeout = self.status.borrow().authentication_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::AuthenticationTimeout),
        }
    }

    /// Close the socket and stop reconnecting. A no-op once closed.
    pub fn disconnect(&self, code: u16, reason: impl Into<String>) {
        let _ = self.command(Command::Disconnect {
            code,
            reason: reason.into(),
        });
    }

    /// Wait until the session has stopped for good.
    pub async fn closed(&self) {
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| s.closed).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().connected
    }

    pub fn is_authenticated(&self) -> bool {
        self.status.borrow().authenticated
    }

    pub fn rules(&self) -> Rules {
        self.status.borrow().rules.clone()
    }

    pub fn queued(&self) -> usize {
        self.status.borrow().queued
    }

    /// Sent and received history, kept while the server advertises `store_messages`.
    pub async fn history(&self) -> Result<MessageHistory, Error> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::History(reply))?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    fn command(&self, command: Command) -> Result<(), Error> {
        self.commands
            .send(command)
            .map_err(|_| Error::ConnectionClosed)
    }
}
