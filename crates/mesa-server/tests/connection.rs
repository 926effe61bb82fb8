mod common;

use std::sync::{Arc, Mutex};

use common::{
    Frame, connect, expect_close, expect_silence, next_frame, recv, send, send_raw,
    wait_disconnected, wait_message,
};
use futures_util::SinkExt;
use mesa_core::{ConnectionState, Envelope, Hello, Rule, ServerConfig, VERSION, op};
use mesa_server::{
    ChannelObserver, ConnectionEvent, ConnectionHandle, NORMAL_CLOSURE, Observer, Server,
    ServerEvent,
};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

#[tokio::test]
async fn hello_advertises_configuration() {
    let mut config = ServerConfig::default();
    config.heartbeat.enabled = true;
    config.heartbeat.interval = 2500;
    config.store_messages = true;
    config.client.enforce_equal_versions = true;
    config.client.reconnect_interval = Some(750);
    let server = Server::builder(config).build().await.unwrap();

    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let server_ws = tokio_tungstenite::WebSocketStream::from_raw_socket(
        server_io,
        tokio_tungstenite::tungstenite::protocol::Role::Server,
        None,
    )
    .await;
    let mut peer = tokio_tungstenite::WebSocketStream::from_raw_socket(
        client_io,
        tokio_tungstenite::tungstenite::protocol::Role::Client,
        None,
    )
    .await;
    server.attach(server_ws, None).await;

    let Frame::Envelope(envelope) = next_frame(&mut peer).await else {
        panic!("expected hello");
    };
    assert_eq!(envelope.op(), op::HELLO);
    let hello = Hello::from_envelope(&envelope).unwrap();
    assert_eq!(hello.c_heartbeat_interval, Some(2500));
    assert_eq!(hello.c_reconnect_interval, Some(750));
    assert_eq!(hello.version.as_deref(), Some(VERSION));
    assert!(hello.rules.contains(Rule::StoreMessages));
    assert!(hello.rules.contains(Rule::EnforceEqualVersions));
}

#[tokio::test]
async fn application_messages_reach_observers_and_subscribers() {
    let (observer, mut events) = ChannelObserver::new();
    let server = Server::builder(ServerConfig::default())
        .observer(observer)
        .build()
        .await
        .unwrap();
    let (handle, mut peer) = connect(&server).await;
    let mut local = handle.subscribe();

    send(&mut peer, &Envelope::new(5, json!({"text": "hi"}))).await;

    let message = wait_message(&mut events).await;
    assert_eq!(message.op(), 5);
    assert_eq!(message.payload(), &json!({"text": "hi"}));
    match local.recv().await.unwrap() {
        ConnectionEvent::Message(envelope) => assert_eq!(envelope, message),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn malformed_frames_are_dropped() {
    let (observer, mut events) = ChannelObserver::new();
    let server = Server::builder(ServerConfig::default())
        .observer(observer)
        .build()
        .await
        .unwrap();
    let (handle, mut peer) = connect(&server).await;

    send_raw(&mut peer, "not json").await;
    send_raw(&mut peer, r#"{"d": {"missing": "op"}}"#).await;
    peer.send(Message::Binary(b"\xff\xfe".to_vec().into()))
        .await
        .unwrap();
    send(&mut peer, &Envelope::new(7, json!(null))).await;

    let message = wait_message(&mut events).await;
    assert_eq!(message.op(), 7);
    assert_eq!(handle.state(), ConnectionState::Open);
}

#[tokio::test]
async fn send_writes_to_socket() {
    let server = Server::builder(ServerConfig::default()).build().await.unwrap();
    let (handle, mut peer) = connect(&server).await;

    handle
        .send(Envelope::new(9, json!({"n": 1})))
        .unwrap();
    handle
        .send_local(Envelope::new(9, json!({"n": 2})))
        .unwrap();

    assert_eq!(recv(&mut peer).await.payload(), &json!({"n": 1}));
    assert_eq!(recv(&mut peer).await.payload(), &json!({"n": 2}));
}

#[tokio::test]
async fn history_records_only_when_enabled() {
    for enabled in [false, true] {
        let config = ServerConfig {
            store_messages: enabled,
            ..ServerConfig::default()
        };
        let (observer, mut events) = ChannelObserver::new();
        let server = Server::builder(config)
            .observer(observer)
            .build()
            .await
            .unwrap();
        let (handle, mut peer) = connect(&server).await;

        send(&mut peer, &Envelope::new(5, json!({"n": 1}))).await;
        wait_message(&mut events).await;
        handle.send(Envelope::new(6, json!({"n": 2}))).unwrap();
        recv(&mut peer).await;

        let history = handle.history().await.unwrap();
        assert_eq!(history.is_enabled(), enabled);
        if enabled {
            assert_eq!(history.received(), &[Envelope::new(5, json!({"n": 1}))]);
            assert_eq!(history.sent(), &[Envelope::new(6, json!({"n": 2}))]);
        } else {
            assert!(history.received().is_empty());
            assert!(history.sent().is_empty());
        }
    }
}

#[tokio::test]
async fn server_disconnect_sends_close_once() {
    let (observer, mut events) = ChannelObserver::new();
    let server = Server::builder(ServerConfig::default())
        .observer(observer)
        .build()
        .await
        .unwrap();
    let (handle, mut peer) = connect(&server).await;

    handle.disconnect_with(4001, "bye");
    handle.disconnect();
    assert_eq!(expect_close(&mut peer).await, Some(4001));

    let (code, reason) = wait_disconnected(&mut events).await;
    assert_eq!((code, reason.as_str()), (4001, "bye"));
    handle.closed().await;
    handle.disconnect();
    assert!(handle.send(Envelope::empty(5)).is_err());

    // exactly one disconnection event
    assert!(events.try_recv().is_err());
    assert_eq!(server.connection_count().await, 0);
}

#[tokio::test]
async fn client_close_is_reported() {
    let (observer, mut events) = ChannelObserver::new();
    let server = Server::builder(ServerConfig::default())
        .observer(observer)
        .build()
        .await
        .unwrap();
    let (handle, mut peer) = connect(&server).await;
    let mut local = handle.subscribe();

    peer.close(Some(CloseFrame {
        code: CloseCode::from(4000),
        reason: "leaving".into(),
    }))
    .await
    .unwrap();

    let (code, reason) = wait_disconnected(&mut events).await;
    assert_eq!(code, 4000);
    assert_eq!(reason, "leaving");
    assert_eq!(handle.state(), ConnectionState::Closed);
    assert!(matches!(
        local.recv().await.unwrap(),
        ConnectionEvent::Disconnected { code: 4000, .. }
    ));
}

#[tokio::test]
async fn dropped_socket_is_reported() {
    let (observer, mut events) = ChannelObserver::new();
    let server = Server::builder(ServerConfig::default())
        .observer(observer)
        .build()
        .await
        .unwrap();
    let (handle, peer) = connect(&server).await;
    drop(peer);

    let (code, _) = wait_disconnected(&mut events).await;
    assert_ne!(code, NORMAL_CLOSURE);
    handle.closed().await;
}

struct Recorder {
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl Observer for Recorder {
    fn on_connection(&self, _connection: &ConnectionHandle) {
        self.log.lock().unwrap().push(format!("{} connection", self.label));
    }

    fn on_message(&self, _connection: &ConnectionHandle, envelope: &Envelope) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{} message {}", self.label, envelope.op()));
    }
}

#[tokio::test]
async fn observers_run_in_registration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (observer, mut events) = ChannelObserver::new();
    let server = Server::builder(ServerConfig::default())
        .observer(Recorder {
            label: "first",
            log: log.clone(),
        })
        .observer(Recorder {
            label: "second",
            log: log.clone(),
        })
        .observer(observer)
        .build()
        .await
        .unwrap();
    let (_handle, mut peer) = connect(&server).await;

    send(&mut peer, &Envelope::empty(5)).await;
    wait_message(&mut events).await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "first connection",
            "second connection",
            "first message 5",
            "second message 5",
        ]
    );
}

#[tokio::test]
async fn broadcast_reaches_every_connection() {
    let (observer, mut events) = ChannelObserver::new();
    let server = Server::builder(ServerConfig::default())
        .observer(observer)
        .build()
        .await
        .unwrap();
    let (_a, mut peer_a) = connect(&server).await;
    let (b, mut peer_b) = connect(&server).await;
    assert_eq!(server.connection_count().await, 2);
    assert!(matches!(next_server_event(&mut events).await, ServerEvent::Connected(_)));

    server.broadcast(Envelope::new(8, json!("all"))).await;
    assert_eq!(recv(&mut peer_a).await.payload(), &json!("all"));
    assert_eq!(recv(&mut peer_b).await.payload(), &json!("all"));

    b.disconnect();
    b.closed().await;
    server.broadcast(Envelope::new(8, json!("rest"))).await;
    assert_eq!(recv(&mut peer_a).await.payload(), &json!("rest"));
    expect_silence(&mut peer_a).await;
}

async fn next_server_event(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<ServerEvent>,
) -> ServerEvent {
    common::next_event(events).await
}
