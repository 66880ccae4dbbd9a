//! DispatchHandle - client interface for feeding and subscribing

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use eyre::{Result, eyre};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::messages::{DispatchMetrics, Inbound};
use super::source::StatusSource;
use crate::registry::SubscriptionRegistry;
use crate::store::StatusStore;
use crate::value::{ChannelEvent, Payload, StatusBatch, StatusKey, StatusMap};

/// Handle for producers and subscribers to interact with the Dispatcher
///
/// Cloneable and usable from any thread. Publishing never blocks; it only
/// enqueues work for the Dispatcher task.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<Inbound>,
    store: StatusStore,
    registry: SubscriptionRegistry,
    source: Option<Arc<dyn StatusSource>>,
    runtime: Option<tokio::runtime::Handle>,
}

impl DispatchHandle {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Inbound>,
        store: StatusStore,
        registry: SubscriptionRegistry,
        source: Option<Arc<dyn StatusSource>>,
        runtime: Option<tokio::runtime::Handle>,
    ) -> Self {
        Self {
            tx,
            store,
            registry,
            source,
            runtime,
        }
    }

    /// Enqueue a status batch
    pub fn publish_status(&self, batch: StatusBatch) -> Result<()> {
        debug!(keys = batch.len(), "DispatchHandle::publish_status: called");
        self.tx
            .send(Inbound::Status {
                batch,
                received_at: Instant::now(),
            })
            .map_err(|_| eyre!("Dispatcher channel closed"))
    }

    /// Enqueue a free-form event on a dotted channel path
    pub fn publish_channel(&self, path: &str, value: serde_json::Value) -> Result<()> {
        debug!(%path, "DispatchHandle::publish_channel: called");
        self.tx
            .send(Inbound::Channel {
                path: path.to_string(),
                value,
            })
            .map_err(|_| eyre!("Dispatcher channel closed"))
    }

    /// Route one monitor payload to the status or channel path
    pub fn deliver(&self, payload: Payload) -> Result<()> {
        if payload.is_status() {
            let batch = payload.into_batch()?;
            self.publish_status(batch)
        } else {
            self.publish_channel(&payload.path, payload.value)
        }
    }

    /// Subscribe `callback` to changes of any key in `keys`
    ///
    /// Keys the store has never seen are fetched from the configured source
    /// in the background and delivered as an ordinary status batch.
    pub fn register_status<I, K, F>(&self, id: &str, keys: I, callback: F) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<StatusKey>,
        F: Fn(&StatusMap) -> Result<()> + Send + Sync + 'static,
    {
        debug!(subscriber = %id, "DispatchHandle::register_status: called");
        let keys = self.registry.register(id, keys, Arc::new(callback))?;

        let missing = self.store.missing(&keys)?;
        if !missing.is_empty() {
            self.backfill(id, missing);
        }
        Ok(())
    }

    fn backfill(&self, id: &str, missing: BTreeSet<StatusKey>) {
        let Some(source) = self.source.clone() else {
            debug!(subscriber = %id, missing = missing.len(), "No status source; skipping backfill");
            return;
        };
        let Some(runtime) = self.runtime.as_ref() else {
            warn!(subscriber = %id, "No async runtime available; skipping backfill");
            return;
        };

        let tx = self.tx.clone();
        let id = id.to_string();
        runtime.spawn(async move {
            debug!(subscriber = %id, keys = missing.len(), "Fetching needed status items");
            match source.fetch(missing.into_iter().collect()).await {
                Ok(batch) if batch.is_empty() => {}
                Ok(batch) => {
                    let _ = tx.send(Inbound::Status {
                        batch,
                        received_at: Instant::now(),
                    });
                }
                Err(e) => error!(subscriber = %id, error = ?e, "Error fetching needed status items"),
            }
        });
    }

    /// Subscribe `callback` to events on any of `channels`
    pub fn register_channel<I, C, F>(&self, id: &str, channels: I, callback: F) -> Result<()>
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
        F: Fn(&ChannelEvent) -> Result<()> + Send + Sync + 'static,
    {
        debug!(subscriber = %id, "DispatchHandle::register_channel: called");
        self.registry.register_channel(id, channels, Arc::new(callback))?;
        Ok(())
    }

    /// Remove every subscription held under `id`
    ///
    /// Callbacks already posted to the owning context still run.
    pub fn unregister(&self, id: &str) -> Result<bool> {
        debug!(subscriber = %id, "DispatchHandle::unregister: called");
        Ok(self.registry.unregister(id)?)
    }

    /// Union of every subscribed channel name
    pub fn channels(&self) -> Result<BTreeSet<String>> {
        Ok(self.registry.channels()?)
    }

    /// Run blocking work on the runtime's worker pool
    ///
    /// For fetches and other slow calls that must stay off the owning
    /// context. Fails when the handle was created outside a runtime.
    pub fn spawn_blocking<F, T>(&self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        debug!("DispatchHandle::spawn_blocking: called");
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| eyre!("No async runtime available for blocking work"))?;
        Ok(runtime.spawn_blocking(f))
    }

    /// Read access to the merged status snapshot
    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    /// Get the Dispatcher's current metrics
    pub async fn metrics(&self) -> Result<DispatchMetrics> {
        debug!("DispatchHandle::metrics: called");
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(Inbound::GetMetrics { reply_tx })
            .map_err(|_| eyre!("Dispatcher channel closed"))?;

        reply_rx.await.map_err(|_| eyre!("Dispatcher dropped metrics request"))
    }
}
