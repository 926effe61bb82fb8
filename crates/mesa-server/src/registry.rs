//! Process-local map of authenticated identities to their live connections.

use std::collections::HashMap;
use std::sync::Arc;

use mesa_core::Identity;
use tokio::sync::RwLock;
use tracing::trace;

use crate::connection::{ConnectionHandle, ConnectionId};

/// Identity → connections owned by this process.
///
/// Only authenticated connections are inserted. One identity may hold
/// several connections; each is removed independently on disconnect.
#[derive(Default)]
pub struct IdentityRegistry {
    entries: RwLock<HashMap<Identity, HashMap<ConnectionId, ConnectionHandle>>>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, identity: Identity, connection: ConnectionHandle) {
        let mut entries = self.entries.write().await;
        entries
            .entry(identity)
            .or_default()
            .insert(connection.id(), connection);
    }

    /// Remove one connection's entry. Returns whether it was present.
    pub async fn remove(&self, identity: &Identity, connection: ConnectionId) -> bool {
        let mut entries = self.entries.write().await;
        let Some(connections) = entries.get_mut(identity) else {
            return false;
        };
        let removed = connections.remove(&connection).is_some();
        if connections.is_empty() {
            entries.remove(identity);
        }
        removed
    }

    pub async fn contains(&self, identity: &Identity) -> bool {
        self.entries.read().await.contains_key(identity)
    }

    pub async fn connections(&self, identity: &Identity) -> Vec<ConnectionHandle> {
        self.entries
            .read()
            .await
            .get(identity)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn identities(&self) -> Vec<Identity> {
        let mut identities: Vec<Identity> = self.entries.read().await.keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Write an encoded frame to every local connection of `identity`.
    ///
    /// Returns how many connections it was handed to; zero means this
    /// process does not own the identity.
    pub async fn deliver(&self, identity: &Identity, frame: &Arc<str>) -> usize {
        let entries = self.entries.read().await;
        let Some(connections) = entries.get(identity) else {
            trace!(%identity, "identity not connected here");
            return 0;
        };
        connections
            .values()
            .filter(|c| c.deliver(Arc::clone(frame)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::detached_handle;

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[tokio::test]
    async fn insert_and_remove() {
        let registry = IdentityRegistry::new();
        let (c1, _rx1) = detached_handle(1);
        let (c2, _rx2) = detached_handle(2);
        registry.insert(id("u1"), c1).await;
        registry.insert(id("u1"), c2).await;
        assert_eq!(registry.connections(&id("u1")).await.len(), 2);

        assert!(registry.remove(&id("u1"), ConnectionId::new(1)).await);
        assert!(registry.contains(&id("u1")).await);
        assert!(registry.remove(&id("u1"), ConnectionId::new(2)).await);
        assert!(!registry.contains(&id("u1")).await);
        assert!(!registry.remove(&id("u1"), ConnectionId::new(2)).await);
    }

    #[tokio::test]
    async fn deliver_only_to_owned_identities() {
        let registry = IdentityRegistry::new();
        let (c1, mut rx1) = detached_handle(1);
        registry.insert(id("u1"), c1).await;

        let frame: Arc<str> = Arc::from(r#"{"op":5,"d":{}}"#);
        assert_eq!(registry.deliver(&id("u1"), &frame).await, 1);
        assert_eq!(registry.deliver(&id("ghost"), &frame).await, 0);
        assert!(rx1.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn identities_sorted() {
        let registry = IdentityRegistry::new();
        let (c1, _rx1) = detached_handle(1);
        let (c2, _rx2) = detached_handle(2);
        registry.insert(id("zed"), c1).await;
        registry.insert(id("amy"), c2).await;
        assert_eq!(registry.identities().await, vec![id("amy"), id("zed")]);
    }
}
