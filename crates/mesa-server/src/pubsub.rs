//! Shared store capability used for cross-process delivery.
//!
//! A deployment with several server processes plugs in a store that all of
//! them reach (typically Redis). [`MemoryPubSub`] is an in-process stand-in:
//! several `Server`s in one process can share it, which is also how the
//! multi-process behaviour is tested.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use mesa_core::Error;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 1024;

/// Publish/subscribe plus set operations on an external store.
#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), Error>;

    /// Stream every payload published on `channel` from now on.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, Error>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), Error>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), Error>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, Error>;
}

/// In-process [`PubSub`] backed by broadcast channels.
pub struct MemoryPubSub {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    sets: Mutex<HashMap<String, BTreeSet<String>>>,
    available: AtomicBool,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            sets: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), Error> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::BridgeUnavailable("memory store offline".into()))
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), Error> {
        self.check()?;
        // no subscribers is not an error
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, Error> {
        self.check()?;
        let channel_name = channel.to_string();
        let rx = self.sender(channel).subscribe();
        let stream = futures_util::stream::unfold(rx, move |mut rx| {
            let channel_name = channel_name.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(channel = %channel_name, skipped, "pub/sub subscriber lagged");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), Error> {
        self.check()?;
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), Error> {
        self.check()?;
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(set) = sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, Error> {
        self.check()?;
        let sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        Ok(sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}
