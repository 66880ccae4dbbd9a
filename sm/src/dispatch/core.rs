//! Main Dispatcher task implementation

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use eyre::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::config::DispatchConfig;
use super::handle::DispatchHandle;
use super::messages::{DispatchMetrics, Inbound};
use super::source::StatusSource;
use crate::context::{ContextHandle, panic_message};
use crate::registry::{ChannelCallback, StatusCallback, SubscriptionRegistry};
use crate::store::StatusStore;
use crate::value::{ChannelEvent, StatusBatch, StatusMap};

/// The Dispatcher turns incoming batches into subscriber callbacks
///
/// It is the single consumer of the inbound queue. Each batch is merged into
/// the store, then every subscription whose interest set overlaps the batch
/// gets exactly one callback, posted to the owning context with a projection
/// of its own keys.
pub struct Dispatcher {
    config: DispatchConfig,
    store: StatusStore,
    registry: SubscriptionRegistry,
    context: ContextHandle,
    source: Option<Arc<dyn StatusSource>>,
    tx: mpsc::UnboundedSender<Inbound>,
    rx: mpsc::UnboundedReceiver<Inbound>,
    /// Incremented on the owning context when a callback fails
    failures: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Create a Dispatcher delivering callbacks through `context`
    pub fn new(config: DispatchConfig, context: ContextHandle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            store: StatusStore::new(),
            registry: SubscriptionRegistry::new(),
            context,
            source: None,
            tx,
            rx,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Backfill keys that new subscribers need from `source`
    pub fn with_source(mut self, source: Arc<dyn StatusSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Create a handle for ingestion and registration
    ///
    /// Backfill fetches are spawned on the runtime current at this call, if any.
    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle::new(
            self.tx.clone(),
            self.store.clone(),
            self.registry.clone(),
            self.source.clone(),
            tokio::runtime::Handle::try_current().ok(),
        )
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    /// Run the Dispatcher task
    ///
    /// Consumes the Dispatcher and processes inbound items in arrival order
    /// until `quit` is set or every handle has been dropped. An item already
    /// being processed always completes. Dropping the quit sender without
    /// setting it leaves the loop running until the handles are gone.
    ///
    /// Returns the final metrics, or an error once a poisoned store or
    /// registry lock makes the shared state unusable.
    pub async fn run(self, mut quit: watch::Receiver<bool>) -> Result<DispatchMetrics> {
        let Self {
            config,
            store,
            registry,
            context,
            failures,
            mut rx,
            tx,
            ..
        } = self;
        // Only handles keep the queue open from here on
        drop(tx);

        let core = DispatchCore {
            config,
            store,
            registry,
            context,
            failures,
        };
        let mut metrics = DispatchMetrics::default();

        info!("Dispatcher started");

        let mut quit_open = true;
        loop {
            if *quit.borrow_and_update() {
                break;
            }

            let item = if quit_open {
                tokio::select! {
                    biased;

                    changed = quit.changed() => {
                        if changed.is_err() {
                            debug!("Dispatcher: quit sender dropped, running until handles are gone");
                            quit_open = false;
                        }
                        continue;
                    }

                    item = rx.recv() => item,
                }
            } else {
                rx.recv().await
            };

            let Some(item) = item else {
                debug!("Dispatcher: all handles dropped");
                break;
            };

            if let Err(e) = core.process(item, &mut metrics) {
                error!(error = ?e, "Dispatcher stopping on unusable shared state");
                return Err(e);
            }
        }

        metrics.callback_failures = core.failures.load(Ordering::Relaxed);
        metrics.subscriptions = core.registry.len()?;
        info!(
            batches = metrics.batches_applied,
            callbacks = metrics.callbacks_scheduled,
            "Dispatcher stopped"
        );
        Ok(metrics)
    }
}

/// State the run loop works with once the queue has been taken out
struct DispatchCore {
    config: DispatchConfig,
    store: StatusStore,
    registry: SubscriptionRegistry,
    context: ContextHandle,
    failures: Arc<AtomicU64>,
}

impl DispatchCore {
    /// Process one inbound item
    ///
    /// Errors are lock failures only; a failing subscriber never surfaces here.
    fn process(&self, item: Inbound, metrics: &mut DispatchMetrics) -> Result<()> {
        match item {
            Inbound::Status { batch, received_at } => self.process_status(batch, received_at, metrics),

            Inbound::Channel { path, value } => self.process_channel(&path, value, metrics),

            Inbound::GetMetrics { reply_tx } => {
                let mut snapshot = metrics.clone();
                snapshot.callback_failures = self.failures.load(Ordering::Relaxed);
                snapshot.subscriptions = self.registry.len()?;
                let _ = reply_tx.send(snapshot);
                Ok(())
            }
        }
    }

    fn process_status(&self, batch: StatusBatch, received_at: Instant, metrics: &mut DispatchMetrics) -> Result<()> {
        let start = Instant::now();
        metrics.batches_received += 1;
        debug!(
            keys = batch.len(),
            queued_us = start.duration_since(received_at).as_micros() as u64,
            "Status arrived"
        );

        if batch.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.store.merge(&batch) {
            metrics.batches_dropped += 1;
            return Err(e).context(format!("Failed to apply status batch of {} keys", batch.len()));
        }
        metrics.batches_applied += 1;
        metrics.last_update = Some(start);

        let affected = self
            .registry
            .affected(batch.keys())
            .context("Failed to look up affected subscriptions")?;

        if !affected.is_empty() && self.context.is_stopped() {
            warn!(subscribers = affected.len(), "Owning context stopped; callbacks will not run");
        }

        for sub in affected {
            let projection = self
                .store
                .project(&sub.keys)
                .context(format!("Failed to project status for subscriber '{}'", sub.id))?;

            debug!(subscriber = %sub.id, "Updating subscriber");
            let failures = self.failures.clone();
            let id = sub.id;
            let callback = sub.callback;
            self.context
                .post(move || invoke_status(&id, &callback, &projection, &failures));
            metrics.callbacks_scheduled += 1;
        }

        let elapsed = start.elapsed();
        let limit = self.config.latency_warning();
        if elapsed > limit {
            metrics.latency_warnings += 1;
            warn!(
                "Elapsed update time exceeded limit by {:.2} sec",
                (elapsed - limit).as_secs_f64()
            );
        }
        Ok(())
    }

    fn process_channel(&self, path: &str, value: serde_json::Value, metrics: &mut DispatchMetrics) -> Result<()> {
        metrics.channel_events += 1;

        let Some(event) = ChannelEvent::from_path(path, value) else {
            debug!(%path, "Ignoring channel event without a channel name");
            return Ok(());
        };

        let affected = self
            .registry
            .affected_channels(&event.channel)
            .context("Failed to look up channel subscriptions")?;

        for sub in affected {
            debug!(subscriber = %sub.id, channel = %event.channel, "Forwarding channel event");
            let failures = self.failures.clone();
            let event = event.clone();
            let id = sub.id;
            let callback = sub.callback;
            self.context
                .post(move || invoke_channel(&id, &callback, &event, &failures));
            metrics.callbacks_scheduled += 1;
        }
        Ok(())
    }
}

/// Run a status callback, containing errors and panics to this subscriber
fn invoke_status(id: &str, callback: &StatusCallback, projection: &StatusMap, failures: &AtomicU64) {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(projection))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            failures.fetch_add(1, Ordering::Relaxed);
            error!(subscriber = %id, error = ?e, "Error making callback to subscriber");
        }
        Err(payload) => {
            failures.fetch_add(1, Ordering::Relaxed);
            error!(subscriber = %id, panic = %panic_message(&*payload), "Subscriber callback panicked");
        }
    }
}

fn invoke_channel(id: &str, callback: &ChannelCallback, event: &ChannelEvent, failures: &AtomicU64) {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            failures.fetch_add(1, Ordering::Relaxed);
            error!(subscriber = %id, channel = %event.channel, error = ?e, "Error making channel callback");
        }
        Err(payload) => {
            failures.fetch_add(1, Ordering::Relaxed);
            error!(
                subscriber = %id,
                channel = %event.channel,
                panic = %panic_message(&*payload),
                "Channel callback panicked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::context::{self, ContextQueue};
    use crate::value::StatusValue;

    type Calls = Arc<Mutex<Vec<(String, StatusMap)>>>;

    fn recorder(calls: &Calls, id: &str) -> impl Fn(&StatusMap) -> eyre::Result<()> + Send + Sync + 'static {
        let calls = calls.clone();
        let id = id.to_string();
        move |map: &StatusMap| {
            calls.lock().unwrap().push((id.clone(), map.clone()));
            Ok(())
        }
    }

    fn batch(items: &[(&str, StatusValue)]) -> StatusBatch {
        items.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    /// Process everything sent so far, then run the posted callbacks
    async fn settle(handle: &DispatchHandle, queue: &mut ContextQueue) {
        // Metrics requests are answered in order, after all earlier items
        handle.metrics().await.unwrap();
        queue.drain_pending();
    }

    type RunTask = tokio::task::JoinHandle<Result<DispatchMetrics>>;

    fn start() -> (DispatchHandle, ContextQueue, watch::Sender<bool>, RunTask) {
        let (ctx, queue) = context::channel();
        queue.identify();
        let dispatcher = Dispatcher::new(DispatchConfig::default(), ctx);
        let handle = dispatcher.handle();
        let (quit_tx, quit_rx) = watch::channel(false);
        let task = tokio::spawn(dispatcher.run(quit_rx));
        (handle, queue, quit_tx, task)
    }

    #[tokio::test]
    async fn test_example_scenario() {
        let (handle, mut queue, quit_tx, task) = start();
        let calls: Calls = Arc::default();

        handle.register_status("S1", ["A.X", "A.Y"], recorder(&calls, "S1")).unwrap();
        handle.register_status("S2", ["B.Z"], recorder(&calls, "S2")).unwrap();

        handle
            .publish_status(batch(&[("A.X", StatusValue::Int(1)), ("B.Z", StatusValue::Int(2))]))
            .unwrap();
        settle(&handle, &mut queue).await;

        {
            let calls = calls.lock().unwrap();
            assert_eq!(calls.len(), 2);
            assert_eq!(calls[0].0, "S1");
            assert_eq!(calls[0].1["A.X"], StatusValue::Int(1));
            assert_eq!(calls[0].1["A.Y"], StatusValue::NoData);
            assert_eq!(calls[1].0, "S2");
            assert_eq!(calls[1].1.len(), 1);
            assert_eq!(calls[1].1["B.Z"], StatusValue::Int(2));
        }

        handle.publish_status(batch(&[("A.Y", StatusValue::Int(5))])).unwrap();
        settle(&handle, &mut queue).await;

        {
            let calls = calls.lock().unwrap();
            assert_eq!(calls.len(), 3);
            assert_eq!(calls[2].0, "S1");
            assert_eq!(calls[2].1["A.X"], StatusValue::Int(1));
            assert_eq!(calls[2].1["A.Y"], StatusValue::Int(5));
        }

        quit_tx.send(true).unwrap();
        let metrics = task.await.unwrap().unwrap();
        assert_eq!(metrics.batches_applied, 2);
        assert_eq!(metrics.callbacks_scheduled, 3);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let (handle, mut queue, quit_tx, task) = start();
        let calls: Calls = Arc::default();
        handle.register_status("S1", ["A.X"], recorder(&calls, "S1")).unwrap();

        handle.publish_status(StatusBatch::new()).unwrap();
        settle(&handle, &mut queue).await;
        assert!(calls.lock().unwrap().is_empty());

        quit_tx.send(true).unwrap();
        let metrics = task.await.unwrap().unwrap();
        assert_eq!(metrics.batches_received, 1);
        assert_eq!(metrics.batches_applied, 0);
        assert!(metrics.last_update.is_none());
    }

    #[tokio::test]
    async fn test_failing_callback_is_isolated() {
        let (handle, mut queue, quit_tx, task) = start();
        let calls: Calls = Arc::default();

        handle.register_status("S1", ["K"], recorder(&calls, "S1")).unwrap();
        handle
            .register_status("S2", ["K"], |_: &StatusMap| Err(eyre::eyre!("widget exploded")))
            .unwrap();
        handle
            .register_status("S3", ["K"], |_: &StatusMap| -> eyre::Result<()> { panic!("bad widget") })
            .unwrap();
        handle.register_status("S4", ["K"], recorder(&calls, "S4")).unwrap();

        handle.publish_status(batch(&[("K", StatusValue::Int(1))])).unwrap();
        settle(&handle, &mut queue).await;
        handle.publish_status(batch(&[("K", StatusValue::Int(2))])).unwrap();
        settle(&handle, &mut queue).await;

        let ids: Vec<String> = calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(ids, vec!["S1", "S4", "S1", "S4"]);

        let metrics = handle.metrics().await.unwrap();
        assert_eq!(metrics.callback_failures, 4);

        quit_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_channel_fan_out() {
        let (handle, mut queue, quit_tx, task) = start();
        let events = Arc::new(Mutex::new(Vec::new()));

        let seen = events.clone();
        handle
            .register_channel("alarm", ["alarm"], move |ev: &ChannelEvent| {
                seen.lock().unwrap().push(ev.clone());
                Ok(())
            })
            .unwrap();

        handle.publish_channel("mon.alarm.TSC", json!({"level": "warn"})).unwrap();
        handle.publish_channel("mon.sound", json!("beep")).unwrap();
        handle.publish_channel("alarm", json!(1)).unwrap();
        settle(&handle, &mut queue).await;

        {
            let events = events.lock().unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].channel, "alarm");
            assert_eq!(events[0].path, "mon.alarm.TSC");
            assert_eq!(events[0].value, json!({"level": "warn"}));
        }

        quit_tx.send(true).unwrap();
        let metrics = task.await.unwrap().unwrap();
        assert_eq!(metrics.channel_events, 3);
        assert_eq!(metrics.callbacks_scheduled, 1);
    }

    #[tokio::test]
    async fn test_latency_warning_counted() {
        let (ctx, mut queue) = context::channel();
        queue.identify();
        let config = DispatchConfig {
            latency_warning_ms: 0,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(config, ctx);
        let handle = dispatcher.handle();
        let (_quit_tx, quit_rx) = watch::channel(false);
        let task = tokio::spawn(dispatcher.run(quit_rx));

        handle.register_status("S1", ["K"], |_: &StatusMap| Ok(())).unwrap();
        handle.publish_status(batch(&[("K", StatusValue::Int(1))])).unwrap();
        settle(&handle, &mut queue).await;

        drop(handle);
        let metrics = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(metrics.latency_warnings, 1);
    }

    #[tokio::test]
    async fn test_run_ends_when_handles_dropped() {
        let (handle, _queue, _quit_tx, task) = start();
        handle.publish_status(batch(&[("K", StatusValue::Int(1))])).unwrap();
        drop(handle);

        let metrics = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(metrics.batches_applied, 1);
    }

    #[tokio::test]
    async fn test_run_survives_dropped_quit_sender() {
        let (handle, mut queue, quit_tx, task) = start();
        let calls: Calls = Arc::default();
        handle.register_status("S1", ["K"], recorder(&calls, "S1")).unwrap();

        drop(quit_tx);
        tokio::task::yield_now().await;

        handle.publish_status(batch(&[("K", StatusValue::Int(1))])).unwrap();
        settle(&handle, &mut queue).await;
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(!task.is_finished());

        drop(handle);
        let metrics = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(metrics.batches_applied, 1);
    }

    #[tokio::test]
    async fn test_poisoned_store_stops_run() {
        let (ctx, mut queue) = context::channel();
        queue.identify();
        let dispatcher = Dispatcher::new(DispatchConfig::default(), ctx);
        let handle = dispatcher.handle();
        let calls: Calls = Arc::default();
        handle.register_status("S1", ["K"], recorder(&calls, "S1")).unwrap();

        dispatcher.store().poison();
        let (_quit_tx, quit_rx) = watch::channel(false);
        let task = tokio::spawn(dispatcher.run(quit_rx));

        handle.publish_status(batch(&[("K", StatusValue::Int(1))])).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        let err = result.unwrap_err();
        assert!(format!("{:?}", err).contains("poisoned"), "unexpected error: {:?}", err);

        // Nothing was posted for the dropped batch
        queue.drain_pending();
        assert!(calls.lock().unwrap().is_empty());
        assert!(handle.metrics().await.is_err());
    }
}
