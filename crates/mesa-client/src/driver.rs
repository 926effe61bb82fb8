//! The task behind a [`Session`](crate::Session).
//!
//! The driver owns the socket, the outbound queue and the pending
//! authentication waiters. It alternates between serving an open socket and
//! waiting out the reconnect interval, and keeps taking commands in both.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use mesa_core::{Envelope, Error, Hello, MessageHistory, Operation, Rule, VERSION, op};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::session::{SessionEvent, Status};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Sink = SplitSink<Socket, Message>;

const NORMAL_CLOSURE: u16 = 1000;
const NO_STATUS: u16 = 1005;
const ABNORMAL_CLOSURE: u16 = 1006;
/// How long a close waits for the server's answering close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) enum Command {
    Connect,
    Send(Envelope),
    Authenticate {
        payload: Value,
        resync: bool,
        reply: oneshot::Sender<Value>,
    },
    Disconnect {
        code: u16,
        reason: String,
    },
    History(oneshot::Sender<MessageHistory>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

enum Attempt {
    Open(Box<Socket>),
    Failed(tokio_tungstenite::tungstenite::Error),
    Stop,
}

struct Exit {
    code: u16,
    reason: String,
    terminal: bool,
}

impl Exit {
    fn lost(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            terminal: false,
        }
    }

    fn terminal(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            terminal: true,
        }
    }
}

enum Event {
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Command(Option<Command>),
}

pub(crate) struct Driver {
    url: String,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<Status>,
    events: broadcast::Sender<SessionEvent>,
    queue: VecDeque<Envelope>,
    max_queued: usize,
    waiters: Vec<oneshot::Sender<Value>>,
    resync: Option<Value>,
    history: MessageHistory,
    /// Sent on the current socket before its hello said whether to keep history.
    unrecorded: Option<Vec<Envelope>>,
}

impl Driver {
    pub(crate) fn new(
        url: String,
        commands: mpsc::UnboundedReceiver<Command>,
        status: watch::Sender<Status>,
        events: broadcast::Sender<SessionEvent>,
        max_queued: usize,
    ) -> Self {
        Self {
            url,
            commands,
            status,
            events,
            queue: VecDeque::new(),
            max_queued,
            waiters: Vec::new(),
            resync: None,
            history: MessageHistory::new(false),
            unrecorded: None,
        }
    }

    pub(crate) async fn run(mut self, auto_connect: bool) {
        if auto_connect || self.wait_for_connect().await == Flow::Continue {
            self.reconnect_loop().await;
        }

        // refuse further commands before reporting closed
        self.commands.close();
        self.status.send_modify(|s| {
            s.connected = false;
            s.authenticated = false;
            s.closed = true;
        });
        debug!(url = %self.url, "session closed");
    }

    async fn wait_for_connect(&mut self) -> Flow {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Connect => return Flow::Continue,
                other => {
                    if self.on_idle_command(other) == Flow::Stop {
                        return Flow::Stop;
                    }
                }
            }
        }
        Flow::Stop
    }

    async fn reconnect_loop(&mut self) {
        loop {
            match self.open().await {
                Attempt::Stop => return,
                Attempt::Failed(e) => {
                    warn!(url = %self.url, error = %e, "connection attempt failed");
                }
                Attempt::Open(socket) => {
                    let exit = self.serve(*socket).await;
                    if exit.terminal {
                        return;
                    }
                    info!(url = %self.url, code = exit.code, reason = %exit.reason, "connection lost");
                }
            }
            if self.pause().await == Flow::Stop {
                return;
            }
        }
    }

    async fn open(&mut self) -> Attempt {
        let connecting = tokio_tungstenite::connect_async(self.url.clone());
        tokio::pin!(connecting);
        loop {
            tokio::select! {
                result = &mut connecting => {
                    return match result {
                        Ok((socket, _response)) => Attempt::Open(Box::new(socket)),
                        Err(e) => Attempt::Failed(e),
                    };
                }
                command = self.commands.recv() => {
                    let flow = match command {
                        Some(command) => self.on_idle_command(command),
                        None => Flow::Stop,
                    };
                    if flow == Flow::Stop {
                        return Attempt::Stop;
                    }
                }
            }
        }
    }

    /// Wait out the reconnect interval.
    async fn pause(&mut self) -> Flow {
        let interval = self.status.borrow().reconnect_interval;
        let sleep = tokio::time::sleep(interval);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Flow::Continue,
                command = self.commands.recv() => {
                    let flow = match command {
                        Some(command) => self.on_idle_command(command),
                        None => Flow::Stop,
                    };
                    if flow == Flow::Stop {
                        return Flow::Stop;
                    }
                }
            }
        }
    }

    /// Handle a command while no socket is open.
    fn on_idle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Connect => {}
            Command::Send(envelope) => self.enqueue(envelope),
            Command::Authenticate {
                payload,
                resync,
                reply,
            } => {
                self.add_waiter(reply);
                if resync {
                    // sent on the next open, ahead of the queue
                    self.resync = Some(payload);
                } else {
                    self.enqueue(Envelope::new(op::AUTHENTICATION_REQUEST, payload));
                }
            }
            Command::Disconnect { code, reason } => {
                let _ = self
                    .events
                    .send(SessionEvent::Disconnected { code, reason });
                return Flow::Stop;
            }
            Command::History(reply) => {
                let _ = reply.send(self.history.clone());
            }
        }
        Flow::Continue
    }

    async fn serve(&mut self, socket: Socket) -> Exit {
        let (mut sink, mut stream) = socket.split();
        self.status.send_modify(|s| s.connected = true);
        info!(url = %self.url, "connected");
        let _ = self.events.send(SessionEvent::Connected);

        self.unrecorded = Some(Vec::new());
        let exit = self.converse(&mut sink, &mut stream).await;
        // no hello on this socket, keep the last known history setting
        for envelope in self.unrecorded.take().unwrap_or_default() {
            self.history.record_sent(&envelope);
        }

        self.status.send_modify(|s| {
            s.connected = false;
            s.authenticated = false;
        });
        let _ = self.events.send(SessionEvent::Disconnected {
            code: exit.code,
            reason: exit.reason.clone(),
        });
        exit
    }

    async fn converse(&mut self, sink: &mut Sink, stream: &mut SplitStream<Socket>) -> Exit {
        if let Some(payload) = self.resync.clone() {
            let request = Envelope::new(op::AUTHENTICATION_REQUEST, payload);
            if let Err(e) = write(sink, &request).await {
                return Exit::lost(ABNORMAL_CLOSURE, e.to_string());
            }
        }

        while let Some(envelope) = self.queue.pop_front() {
            if let Err(e) = write(sink, &envelope).await {
                self.queue.push_front(envelope);
                self.publish_queued();
                return Exit::lost(ABNORMAL_CLOSURE, e.to_string());
            }
            self.record_sent(&envelope);
            self.publish_queued();
        }

        loop {
            let event = tokio::select! {
                frame = stream.next() => Event::Frame(frame),
                command = self.commands.recv() => Event::Command(command),
            };

            let exit = match event {
                Event::Frame(Some(Ok(Message::Text(text)))) => {
                    self.on_frame(sink, Envelope::decode(text.as_str())).await
                }
                Event::Frame(Some(Ok(Message::Binary(data)))) => {
                    self.on_frame(sink, Envelope::decode_bytes(&data)).await
                }
                Event::Frame(Some(Ok(Message::Close(frame)))) => Some(match frame {
                    Some(frame) => Exit::lost(u16::from(frame.code), frame.reason.as_str()),
                    None => Exit::lost(NO_STATUS, ""),
                }),
                Event::Frame(Some(Ok(_))) => None,
                Event::Frame(Some(Err(e))) => Some(Exit::lost(ABNORMAL_CLOSURE, e.to_string())),
                Event::Frame(None) => Some(Exit::lost(ABNORMAL_CLOSURE, "socket closed")),
                Event::Command(Some(command)) => self.on_command(sink, command).await,
                Event::Command(None) => {
                    close(sink, NORMAL_CLOSURE, "session dropped").await;
                    Some(Exit::terminal(NORMAL_CLOSURE, "session dropped"))
                }
            };
            if let Some(exit) = exit {
                if exit.terminal {
                    await_close(stream).await;
                }
                return exit;
            }
        }
    }

    async fn on_frame(&mut self, sink: &mut Sink, frame: Result<Envelope, Error>) -> Option<Exit> {
        let envelope = match frame {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(url = %self.url, error = %e, "dropping malformed frame");
                return None;
            }
        };

        match envelope.operation() {
            Operation::HeartbeatPing => {
                let ack = Envelope::empty(op::HEARTBEAT_ACK);
                if let Err(e) = write(sink, &ack).await {
                    return Some(Exit::lost(ABNORMAL_CLOSURE, e.to_string()));
                }
            }
            Operation::Hello => return self.on_hello(sink, &envelope).await,
            Operation::AuthenticationResult => {
                self.status.send_modify(|s| s.authenticated = true);
                let ack = envelope.into_payload();
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(ack.clone());
                }
                debug!(url = %self.url, "authenticated");
                let _ = self.events.send(SessionEvent::Authenticated(ack));
            }
            _ => {
                self.history.record_received(&envelope);
                let _ = self.events.send(SessionEvent::Message(envelope));
            }
        }
        None
    }

    async fn on_hello(&mut self, sink: &mut Sink, envelope: &Envelope) -> Option<Exit> {
        let hello = match Hello::from_envelope(envelope) {
            Ok(hello) => hello,
            Err(e) => {
                warn!(url = %self.url, error = %e, "ignoring unreadable hello");
                return None;
            }
        };

        let store_messages = hello.rules.contains(Rule::StoreMessages);
        if store_messages != self.history.is_enabled() {
            self.history = MessageHistory::new(store_messages);
        }
        for envelope in self.unrecorded.take().unwrap_or_default() {
            self.history.record_sent(&envelope);
        }
        self.status.send_modify(|s| {
            if let Some(ms) = hello.c_reconnect_interval {
                s.reconnect_interval = std::time::Duration::from_millis(ms);
            }
            if let Some(ms) = hello.c_authentication_timeout {
                s.authentication_timeout = std::time::Duration::from_millis(ms);
            }
            s.rules = hello.rules.clone();
        });

        if hello.rules.contains(Rule::EnforceEqualVersions)
            && hello.version.as_deref() != Some(VERSION)
        {
            let e = Error::VersionMismatch {
                server: hello.version.unwrap_or_else(|| "unknown".into()),
                client: VERSION.to_string(),
            };
            error!(url = %self.url, error = %e, "refusing server");
            let reason = e.to_string();
            let _ = self.events.send(SessionEvent::Error(e));
            close(sink, NORMAL_CLOSURE, &reason).await;
            return Some(Exit::terminal(NORMAL_CLOSURE, reason));
        }
        None
    }

    async fn on_command(&mut self, sink: &mut Sink, command: Command) -> Option<Exit> {
        match command {
            Command::Connect => None,
            Command::Send(envelope) => {
                if let Err(e) = write(sink, &envelope).await {
                    self.enqueue(envelope);
                    return Some(Exit::lost(ABNORMAL_CLOSURE, e.to_string()));
                }
                self.record_sent(&envelope);
                None
            }
            Command::Authenticate {
                payload,
                resync,
                reply,
            } => {
                self.add_waiter(reply);
                if resync {
                    self.resync = Some(payload.clone());
                }
                let request = Envelope::new(op::AUTHENTICATION_REQUEST, payload);
                if let Err(e) = write(sink, &request).await {
                    if !resync {
                        self.enqueue(request);
                    }
                    return Some(Exit::lost(ABNORMAL_CLOSURE, e.to_string()));
                }
                None
            }
            Command::Disconnect { code, reason } => {
                close(sink, code, &reason).await;
                Some(Exit::terminal(code, reason))
            }
            Command::History(reply) => {
                let _ = reply.send(self.history.clone());
                None
            }
        }
    }

    fn enqueue(&mut self, envelope: Envelope) {
        if self.queue.len() >= self.max_queued {
            if let Some(dropped) = self.queue.pop_front() {
                warn!(url = %self.url, op = dropped.op(), max_queued = self.max_queued, "outbound queue full, dropping oldest envelope");
            }
        }
        self.queue.push_back(envelope);
        self.publish_queued();
    }

    fn publish_queued(&self) {
        let queued = self.queue.len();
        self.status.send_modify(|s| s.queued = queued);
    }

    fn add_waiter(&mut self, reply: oneshot::Sender<Value>) {
        self.waiters.retain(|w| !w.is_closed());
        self.waiters.push(reply);
    }

    /// Only application envelopes count as history.
    fn record_sent(&mut self, envelope: &Envelope) {
        if !matches!(envelope.operation(), Operation::Application(_)) {
            return;
        }
        match self.unrecorded.as_mut() {
            Some(unrecorded) => unrecorded.push(envelope.clone()),
            None => self.history.record_sent(envelope),
        }
    }
}

async fn write(sink: &mut Sink, envelope: &Envelope) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    sink.send(Message::Text(envelope.encode().into())).await
}

async fn close(sink: &mut Sink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "close frame not sent");
    }
}

/// Read until the server answers our close frame, or give up after a moment.
async fn await_close(stream: &mut SplitStream<Socket>) {
    let answered = tokio::time::timeout(CLOSE_TIMEOUT, async {
        while let Some(Ok(message)) = stream.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;
    if answered.is_err() {
        debug!("server did not answer close frame");
    }
}
