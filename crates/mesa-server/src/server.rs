//! Accept loop and server-wide state.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mesa_core::{Envelope, Error, Identity, ServerConfig};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::auth::{self, AuthCompletion, AuthenticationCallback, AuthenticationResult};
use crate::bridge::DeliveryBridge;
use crate::connection::{Connection, ConnectionHandle, ConnectionId};
use crate::observer::Observer;
use crate::pubsub::PubSub;
use crate::registry::IdentityRegistry;

/// State shared by every connection of one server.
pub(crate) struct ServerContext {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Arc<IdentityRegistry>,
    pub(crate) bridge: Option<Arc<DeliveryBridge>>,
    pub(crate) observers: Vec<Arc<dyn Observer>>,
    pub(crate) authenticator: Option<AuthenticationCallback>,
    pub(crate) connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    _bridge_task: Option<AbortOnDrop>,
}

impl ServerContext {
    /// The bridge, while its channel subscription is live.
    pub(crate) fn live_bridge(&self) -> Option<&Arc<DeliveryBridge>> {
        self.bridge.as_ref().filter(|bridge| bridge.is_live())
    }
}

pub struct ServerBuilder {
    config: ServerConfig,
    store: Option<Arc<dyn PubSub>>,
    observers: Vec<Arc<dyn Observer>>,
    authenticator: Option<AuthenticationCallback>,
}

impl ServerBuilder {
    /// Route sends through a shared store so they reach other processes.
    pub fn pub_sub(mut self, store: Arc<dyn PubSub>) -> Self {
        self.store = Some(store);
        self
    }

    /// Add an observer. Observers run in the order they were added.
    pub fn observer(mut self, observer: impl Observer) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Register the authentication callback.
    pub fn authenticate<F>(mut self, callback: F) -> Self
    where
        F: Fn(Value, AuthCompletion) + Send + Sync + 'static,
    {
        self.authenticator = Some(Arc::new(callback));
        self
    }

    /// Register an async function as the authentication callback.
    pub fn authenticate_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AuthenticationResult, String>> + Send + 'static,
    {
        self.authenticator = Some(auth::from_async(f));
        self
    }

    /// Validate the configuration and, when a store is set, join its
    /// broadcast channel. Must run inside a tokio runtime.
    ///
    /// An unreachable store does not fail the build: the server starts with
    /// local delivery only and keeps retrying the subscription.
    pub async fn build(self) -> Result<Server, Error> {
        self.config.validate()?;

        let registry = Arc::new(IdentityRegistry::new());
        let (bridge, bridge_task) = match self.store {
            Some(store) => {
                let bridge = Arc::new(DeliveryBridge::new(store, &self.config));
                let records = match bridge.subscribe().await {
                    Ok(records) => {
                        info!(channel = bridge.channel(), "delivery bridge subscribed");
                        Some(records)
                    }
                    Err(e) => {
                        warn!(channel = bridge.channel(), error = %e, "store unavailable, starting with local delivery only");
                        None
                    }
                };
                let task = tokio::spawn(bridge.clone().supervise(registry.clone(), records));
                (Some(bridge), Some(AbortOnDrop(task)))
            }
            None => (None, None),
        };

        let ctx = ServerContext {
            config: self.config,
            registry,
            bridge,
            observers: self.observers,
            authenticator: self.authenticator,
            connections: RwLock::new(HashMap::new()),
            _bridge_task: bridge_task,
        };
        Ok(Server {
            ctx: Arc::new(ctx),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A Mesa server. Clones share the same state.
#[derive(Clone)]
pub struct Server {
    ctx: Arc<ServerContext>,
    next_id: Arc<AtomicU64>,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            store: None,
            observers: Vec::new(),
            authenticator: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.ctx.registry
    }

    pub fn bridge(&self) -> Option<&DeliveryBridge> {
        self.ctx.bridge.as_deref()
    }

    /// Bind and accept WebSocket connections until the listener fails.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on ws://{}", listener.local_addr()?);
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => {
                        server.attach(ws, Some(addr)).await;
                    }
                    Err(e) => warn!("WebSocket handshake with {} failed: {}", addr, e),
                }
            });
        }
    }

    /// Start supervising an already-upgraded socket.
    pub async fn attach<S>(&self, ws: WebSocketStream<S>, peer: Option<SocketAddr>) -> ConnectionHandle
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (connection, handle) = Connection::new(id, peer, ws, self.ctx.clone());

        self.ctx
            .connections
            .write()
            .await
            .insert(id, handle.clone());
        for observer in &self.ctx.observers {
            observer.on_connection(&handle);
        }

        tokio::spawn(connection.run());
        handle
    }

    /// Send to identities wherever they are connected.
    ///
    /// Without a live delivery bridge only local connections are reached.
    /// If the store is unreachable, delivery degrades to local connections.
    pub async fn send_to(&self, recipients: &[Identity], envelope: Envelope) {
        if let Some(bridge) = self.ctx.live_bridge() {
            match bridge.publish(&envelope, recipients.to_vec()).await {
                Ok(()) => return,
                Err(e) => warn!(error = %e, "publish failed, delivering locally"),
            }
        }
        let frame: Arc<str> = Arc::from(envelope.encode());
        for recipient in recipients {
            let delivered = self.ctx.registry.deliver(recipient, &frame).await;
            debug!(%recipient, delivered, "local delivery");
        }
    }

    /// Send to every open connection of this process.
    pub async fn broadcast(&self, envelope: Envelope) {
        for connection in self.connections().await {
            let _ = connection.send_local(envelope.clone());
        }
    }

    pub async fn connections(&self) -> Vec<ConnectionHandle> {
        let mut connections: Vec<ConnectionHandle> =
            self.ctx.connections.read().await.values().cloned().collect();
        connections.sort_by_key(ConnectionHandle::id);
        connections
    }

    pub async fn connection_count(&self) -> usize {
        self.ctx.connections.read().await.len()
    }

    /// Authenticated identities with a connection in this process.
    pub async fn connected_identities(&self) -> Vec<Identity> {
        self.ctx.registry.identities().await
    }
}
