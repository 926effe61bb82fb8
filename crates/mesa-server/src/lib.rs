//! Server side of Mesa.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `server` | Accept loop, builder, server-wide addressing |
//! | `connection` | Per-socket task: dispatch, history, authentication, close |
//! | `heartbeat` | Ping/acknowledgement liveness supervision |
//! | `auth` | Authentication callback and its single-use completion |
//! | `registry` | Identity → local connections |
//! | `bridge` | Cross-process delivery by identity over a shared store |
//! | `pubsub` | Shared store capability and an in-memory implementation |
//! | `observer` | Lifecycle hooks |
//!
//! ## Data Flow
//!
//! frame → `Envelope::decode` → `connection` dispatch by op code →
//! {heartbeat ack | authentication | application message → observers}.
//! Outbound: `ConnectionHandle::send` → history → socket, or `bridge` →
//! every process → `registry` → socket.

pub mod auth;
pub mod bridge;
pub mod connection;
pub mod heartbeat;
pub mod observer;
pub mod pubsub;
pub mod registry;
pub mod server;

pub use auth::{AuthCompletion, AuthenticationCallback, AuthenticationResult};
pub use bridge::DeliveryBridge;
pub use connection::{
    ConnectionEvent, ConnectionHandle, ConnectionId, NORMAL_CLOSURE, POLICY_VIOLATION, Status,
};
pub use heartbeat::{HeartbeatAction, HeartbeatState};
pub use observer::{ChannelObserver, Observer, ServerEvent};
pub use pubsub::{MemoryPubSub, PubSub};
pub use registry::IdentityRegistry;
pub use server::{Server, ServerBuilder};
