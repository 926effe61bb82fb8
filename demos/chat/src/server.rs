//! Chat nodes.
//!
//! Every node shares one in-memory store, so a user connected to any node
//! hears everyone else. Joins, leaves, and chat lines are addressed by
//! identity and routed through the delivery bridge.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use mesa_core::{Envelope, Identity, ServerConfig};
use mesa_server::{
    AuthCompletion, AuthenticationResult, ChannelObserver, ConnectionHandle, MemoryPubSub, Server,
    ServerEvent,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::protocol::{self, Chat, Login, Notice, Say, Whisper, op};

pub async fn run(addr: SocketAddr, nodes: u16, mut config: ServerConfig) -> anyhow::Result<()> {
    config.authentication.store_connected_identities = true;
    let store = Arc::new(MemoryPubSub::new());

    let mut tasks = JoinSet::new();
    for n in 0..nodes.max(1) {
        let port = addr
            .port()
            .checked_add(n)
            .context("node ports run past 65535")?;
        let node_addr = SocketAddr::new(addr.ip(), port);
        let server = start_node(config.clone(), store.clone()).await?;
        info!(node = n, %node_addr, "starting chat node");
        tasks.spawn(async move { server.listen(node_addr).await });
    }

    while let Some(result) = tasks.join_next().await {
        result??;
    }
    Ok(())
}

async fn start_node(config: ServerConfig, store: Arc<MemoryPubSub>) -> anyhow::Result<Server> {
    let (observer, events) = ChannelObserver::new();
    let server = Server::builder(config)
        .pub_sub(store)
        .observer(observer)
        .authenticate(login)
        .build()
        .await?;
    tokio::spawn(room(server.clone(), events));
    Ok(server)
}

fn login(payload: Value, done: AuthCompletion) {
    let name = serde_json::from_value::<Login>(payload)
        .map(|login| login.name.trim().to_string())
        .unwrap_or_default();
    if name.is_empty() {
        done.reject("a name is required");
        return;
    }
    // the name is the only field, so the result is never incomplete
    let _ = done.succeed(AuthenticationResult::new(name.clone(), json!({ "name": name })));
}

async fn room(server: Server, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::Connected(_) => {}
            ServerEvent::Authenticated(connection) => {
                if let Some(identity) = connection.identity() {
                    announce(&server, format!("{identity} joined")).await;
                }
            }
            ServerEvent::Message(connection, envelope) => {
                on_message(&server, &connection, &envelope).await;
            }
            ServerEvent::Disconnected { connection, .. } => {
                if let Some(identity) = connection.identity() {
                    announce(&server, format!("{identity} left")).await;
                }
            }
        }
    }
}

async fn on_message(server: &Server, connection: &ConnectionHandle, envelope: &Envelope) {
    let Some(from) = connection.identity() else {
        let notice = Notice {
            text: "log in first".into(),
        };
        let _ = connection.send_local(protocol::envelope(op::NOTICE, &notice));
        return;
    };

    match envelope.op() {
        op::SAY => {
            let Some(say) = protocol::body::<Say>(envelope) else {
                return;
            };
            let chat = Chat {
                from: from.to_string(),
                text: say.text,
                private: false,
            };
            let everyone = everyone(server).await;
            server
                .send_to(&everyone, protocol::envelope(op::CHAT, &chat))
                .await;
        }
        op::WHISPER => {
            let Some(whisper) = protocol::body::<Whisper>(envelope) else {
                return;
            };
            let Ok(to) = Identity::new(whisper.to) else {
                return;
            };
            let chat = Chat {
                from: from.to_string(),
                text: whisper.text,
                private: true,
            };
            server
                .send_to(&[to, from], protocol::envelope(op::CHAT, &chat))
                .await;
        }
        other => debug!(conn_id = %connection.id(), op = other, "ignoring unknown chat op"),
    }
}

async fn announce(server: &Server, text: String) {
    let everyone = everyone(server).await;
    server
        .send_to(&everyone, protocol::envelope(op::NOTICE, &Notice { text }))
        .await;
}

/// Everyone logged in on any node.
async fn everyone(server: &Server) -> Vec<Identity> {
    let Some(bridge) = server.bridge() else {
        return server.connected_identities().await;
    };
    match bridge.connected().await {
        Ok(names) => names
            .into_iter()
            .filter_map(|name| Identity::new(name).ok())
            .collect(),
        Err(e) => {
            warn!(error = %e, "connected set unavailable, using local users");
            server.connected_identities().await
        }
    }
}
