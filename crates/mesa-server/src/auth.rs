//! Server half of the authentication handshake.
//!
//! When a client sends an authentication request, the registered callback is
//! handed the request payload and an [`AuthCompletion`]. The application
//! resolves the completion whenever it is ready, from any task. A completion
//! can be resolved once; dropping it unresolved abandons the attempt.

use mesa_core::{Error, Identity};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::error;

use crate::connection::ConnectionId;

/// What a successful authentication callback reports.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticationResult {
    pub identity: String,
    pub identity_data: Value,
}

impl AuthenticationResult {
    pub fn new(identity: impl Into<String>, identity_data: Value) -> Self {
        Self {
            identity: identity.into(),
            identity_data,
        }
    }

    /// Both fields are required: a non-empty identity and non-null data.
    pub(crate) fn validate(self) -> Result<(Identity, Value), Error> {
        let identity = Identity::new(self.identity)
            .map_err(|_| Error::AuthenticationContractViolation("identity"))?;
        if self.identity_data.is_null() {
            return Err(Error::AuthenticationContractViolation("identity data"));
        }
        Ok((identity, self.identity_data))
    }
}

pub(crate) type AuthOutcome = Result<(Identity, Value), Error>;

/// Single-use handle that resolves one authentication attempt.
#[derive(Debug)]
pub struct AuthCompletion {
    connection: ConnectionId,
    tx: oneshot::Sender<AuthOutcome>,
}

impl AuthCompletion {
    pub(crate) fn new(connection: ConnectionId) -> (Self, oneshot::Receiver<AuthOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { connection, tx }, rx)
    }

    /// The connection this attempt belongs to.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Accept the client.
    ///
    /// Returns `AuthenticationContractViolation` if the result lacks an
    /// identity or identity data; the client is not told and stays
    /// unauthenticated.
    pub fn succeed(self, result: AuthenticationResult) -> Result<(), Error> {
        match result.validate() {
            Ok(validated) => {
                // the connection may already be gone, which is fine
                let _ = self.tx.send(Ok(validated));
                Ok(())
            }
            Err(e) => {
                error!(conn_id = %self.connection, error = %e, "invalid authentication result");
                Err(e)
            }
        }
    }

    /// Refuse the client.
    pub fn reject(self, reason: impl Into<String>) {
        let _ = self
            .tx
            .send(Err(Error::AuthenticationRejected(reason.into())));
    }

    /// Resolve with either outcome.
    pub fn complete(self, outcome: Result<AuthenticationResult, String>) -> Result<(), Error> {
        match outcome {
            Ok(result) => self.succeed(result),
            Err(reason) => {
                self.reject(reason);
                Ok(())
            }
        }
    }
}

/// Invoked with the request payload for every authentication request.
pub type AuthenticationCallback = Arc<dyn Fn(Value, AuthCompletion) + Send + Sync>;

/// Adapt an async function into an [`AuthenticationCallback`].
pub fn from_async<F, Fut>(f: F) -> AuthenticationCallback
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AuthenticationResult, String>> + Send + 'static,
{
    Arc::new(move |payload: Value, done: AuthCompletion| {
        let fut = f(payload);
        tokio::spawn(async move {
            // contract violations are already logged by `succeed`
            let _ = done.complete(fut.await);
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_requires_both_fields() {
        assert_eq!(
            AuthenticationResult::new("", json!({"name": "Ann"})).validate(),
            Err(Error::AuthenticationContractViolation("identity"))
        );
        assert_eq!(
            AuthenticationResult::new("u1", Value::Null).validate(),
            Err(Error::AuthenticationContractViolation("identity data"))
        );
        let (identity, data) = AuthenticationResult::new("u1", json!({"name": "Ann"}))
            .validate()
            .unwrap();
        assert_eq!(identity.as_str(), "u1");
        assert_eq!(data, json!({"name": "Ann"}));
    }

    #[tokio::test]
    async fn invalid_result_never_reaches_the_connection() {
        let (done, rx) = AuthCompletion::new(ConnectionId::new(1));
        let err = done
            .succeed(AuthenticationResult::new("u1", Value::Null))
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationContractViolation(_)));
        // sender dropped without a value
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn reject_carries_reason() {
        let (done, rx) = AuthCompletion::new(ConnectionId::new(1));
        done.reject("bad token");
        assert_eq!(
            rx.await.unwrap(),
            Err(Error::AuthenticationRejected("bad token".into()))
        );
    }

    #[tokio::test]
    async fn async_callback_resolves() {
        let callback = from_async(|payload: Value| async move {
            match payload["token"].as_str() {
                Some("abc") => Ok(AuthenticationResult::new("u1", json!({}))),
                _ => Err("unknown token".to_string()),
            }
        });

        let (done, rx) = AuthCompletion::new(ConnectionId::new(7));
        callback(json!({"token": "abc"}), done);
        let (identity, _) = rx.await.unwrap().unwrap();
        assert_eq!(identity.as_str(), "u1");

        let (done, rx) = AuthCompletion::new(ConnectionId::new(8));
        callback(json!({"token": "nope"}), done);
        assert!(matches!(
            rx.await.unwrap(),
            Err(Error::AuthenticationRejected(_))
        ));
    }
}
