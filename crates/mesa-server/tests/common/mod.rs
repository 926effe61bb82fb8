#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mesa_core::{Envelope, op};
use mesa_server::{ConnectionHandle, Server, ServerEvent};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;

pub type Peer = WebSocketStream<DuplexStream>;

const WAIT: Duration = Duration::from_secs(5);

/// Attach an in-memory socket to `server` and return the client end, with
/// the hello envelope already consumed.
pub async fn connect(server: &Server) -> (ConnectionHandle, Peer) {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let mut peer = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    let handle = server.attach(server_ws, None).await;

    let hello = recv(&mut peer).await;
    assert_eq!(hello.op(), op::HELLO);
    (handle, peer)
}

pub async fn send(peer: &mut Peer, envelope: &Envelope) {
    send_raw(peer, &envelope.encode()).await;
}

pub async fn send_raw(peer: &mut Peer, text: &str) {
    peer.send(Message::Text(text.to_string().into()))
        .await
        .unwrap();
}

#[derive(Debug)]
pub enum Frame {
    Envelope(Envelope),
    Close(Option<u16>),
}

pub async fn next_frame(peer: &mut Peer) -> Frame {
    loop {
        let message = tokio::time::timeout(WAIT, peer.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket ended")
            .expect("socket error");
        match message {
            Message::Text(text) => return Frame::Envelope(Envelope::decode(text.as_str()).unwrap()),
            Message::Close(frame) => {
                // polling again flushes our answering close frame
                let _ = tokio::time::timeout(Duration::from_millis(100), peer.next()).await;
                return Frame::Close(frame.map(|f| u16::from(f.code)));
            }
            _ => continue,
        }
    }
}

pub async fn recv(peer: &mut Peer) -> Envelope {
    match next_frame(peer).await {
        Frame::Envelope(envelope) => envelope,
        Frame::Close(code) => panic!("expected an envelope, socket closed with {code:?}"),
    }
}

pub async fn expect_close(peer: &mut Peer) -> Option<u16> {
    loop {
        if let Frame::Close(code) = next_frame(peer).await {
            return code;
        }
    }
}

/// Assert that no envelope arrives for a while.
pub async fn expect_silence(peer: &mut Peer) {
    if let Ok(Some(Ok(Message::Text(text)))) =
        tokio::time::timeout(Duration::from_millis(200), peer.next()).await
    {
        panic!("unexpected frame: {text}");
    }
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a server event")
        .expect("event channel closed")
}

pub async fn wait_authenticated(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ConnectionHandle {
    loop {
        if let ServerEvent::Authenticated(handle) = next_event(events).await {
            return handle;
        }
    }
}

pub async fn wait_message(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Envelope {
    loop {
        if let ServerEvent::Message(_, envelope) = next_event(events).await {
            return envelope;
        }
    }
}

pub async fn wait_disconnected(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> (u16, String) {
    loop {
        if let ServerEvent::Disconnected { code, reason, .. } = next_event(events).await {
            return (code, reason);
        }
    }
}
