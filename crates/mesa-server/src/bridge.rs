//! Cross-process delivery by identity.
//!
//! Every process subscribes to the same namespaced channel. Publishing
//! addresses a record to identities rather than sockets; each process hands
//! the record to whichever of those identities it holds locally and ignores
//! the rest. There is no ordering across processes and no delivery receipt.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use mesa_core::{DeliveryRecord, Envelope, Error, Identity, ServerConfig};
use tracing::{info, trace, warn};

use crate::pubsub::PubSub;
use crate::registry::IdentityRegistry;

/// Delay between attempts to (re)join the broadcast channel.
const RESUBSCRIBE_INTERVAL: Duration = Duration::from_millis(500);

pub struct DeliveryBridge {
    store: Arc<dyn PubSub>,
    channel: String,
    identities_key: String,
    live: AtomicBool,
}

impl DeliveryBridge {
    pub fn new(store: Arc<dyn PubSub>, config: &ServerConfig) -> Self {
        Self {
            store,
            channel: config.broadcast_channel(),
            identities_key: config.connected_identities_key(),
            live: AtomicBool::new(false),
        }
    }

    /// Whether this process is currently receiving the broadcast channel.
    /// Published records only come back to local sockets while it is.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn identities_key(&self) -> &str {
        &self.identities_key
    }

    pub async fn publish(&self, envelope: &Envelope, recipients: Vec<Identity>) -> Result<(), Error> {
        let record = DeliveryRecord::new(envelope, recipients);
        self.store.publish(&self.channel, record.to_json()).await
    }

    pub async fn add_connected(&self, identity: &Identity) -> Result<(), Error> {
        self.store
            .set_add(&self.identities_key, identity.as_str())
            .await
    }

    pub async fn remove_connected(&self, identity: &Identity) -> Result<(), Error> {
        self.store
            .set_remove(&self.identities_key, identity.as_str())
            .await
    }

    /// Identities currently recorded as connected, across all processes.
    pub async fn connected(&self) -> Result<Vec<String>, Error> {
        self.store.set_members(&self.identities_key).await
    }

    /// Join the channel. The bridge counts as live from here until the
    /// returned stream ends.
    pub(crate) async fn subscribe(&self) -> Result<BoxStream<'static, String>, Error> {
        let records = self.store.subscribe(&self.channel).await?;
        self.live.store(true, Ordering::SeqCst);
        Ok(records)
    }

    /// Keep the channel subscription alive for as long as the task runs.
    ///
    /// `initial` is a subscription already made by the caller. Whenever no
    /// subscription is held the bridge reports itself not live and retries.
    pub(crate) async fn supervise(
        self: Arc<Self>,
        registry: Arc<IdentityRegistry>,
        initial: Option<BoxStream<'static, String>>,
    ) {
        let mut records = initial;
        loop {
            let stream = match records.take() {
                Some(stream) => stream,
                None => match self.subscribe().await {
                    Ok(stream) => {
                        info!(channel = %self.channel, "delivery bridge resubscribed");
                        stream
                    }
                    Err(e) => {
                        warn!(channel = %self.channel, error = %e, "delivery bridge subscription failed, retrying");
                        tokio::time::sleep(RESUBSCRIBE_INTERVAL).await;
                        continue;
                    }
                },
            };

            Self::run(stream, &registry).await;
            self.live.store(false, Ordering::SeqCst);
            warn!(channel = %self.channel, "delivery channel ended, sends stay local until resubscribed");
            tokio::time::sleep(RESUBSCRIBE_INTERVAL).await;
        }
    }

    /// Deliver every record on `records` to the identities this process owns.
    async fn run(records: BoxStream<'static, String>, registry: &IdentityRegistry) {
        let mut records = records;
        while let Some(data) = records.next().await {
            let record = match DeliveryRecord::from_json(&data) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable delivery record");
                    continue;
                }
            };
            let frame: Arc<str> = Arc::from(record.message);
            for recipient in &record.recipients {
                let delivered = registry.deliver(recipient, &frame).await;
                trace!(%recipient, delivered, "delivery record processed");
            }
        }
    }
}
