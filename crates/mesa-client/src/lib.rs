//! Client side of Mesa.
//!
//! A [`Session`] keeps one logical connection to a server alive across
//! socket drops. Sends made while disconnected are queued and flushed in
//! order once a socket opens again; pings are acknowledged automatically;
//! [`Session::authenticate`] resolves when the server acknowledges the
//! request.
//!
//! ```no_run
//! # async fn demo() -> mesa_core::Result<()> {
//! use mesa_client::{AuthenticateOptions, Session};
//! use mesa_core::{ClientConfig, Envelope};
//! use serde_json::json;
//!
//! let session = Session::new("ws://127.0.0.1:9001", ClientConfig::default())?;
//! let ack = session
//!     .authenticate(json!({"token": "abc"}), AuthenticateOptions { resync: true })
//!     .await?;
//! session.send(Envelope::new(100, json!({"text": "hello"})))?;
//! # let _ = ack;
//! # Ok(())
//! # }
//! ```

mod driver;
mod session;

pub use session::{AuthenticateOptions, Session, SessionEvent, Status};
