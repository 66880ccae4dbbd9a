//! Message types for the Dispatcher

use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::value::StatusBatch;

/// Work items on the dispatcher's inbound queue
#[derive(Debug)]
pub enum Inbound {
    /// A batch of status updates
    Status { batch: StatusBatch, received_at: Instant },

    /// A free-form event on a dotted channel path
    Channel { path: String, value: serde_json::Value },

    /// Get current metrics
    GetMetrics { reply_tx: oneshot::Sender<DispatchMetrics> },
}

/// Dispatcher metrics for observability
#[derive(Debug, Clone, Default)]
pub struct DispatchMetrics {
    pub batches_received: u64,
    pub batches_applied: u64,
    /// Batches that failed to merge
    pub batches_dropped: u64,
    pub channel_events: u64,
    pub callbacks_scheduled: u64,
    /// Callbacks that returned an error or panicked on the owning context
    pub callback_failures: u64,
    pub latency_warnings: u64,
    /// Status plus channel subscriptions currently registered
    pub subscriptions: usize,
    /// When the last non-empty batch was applied
    pub last_update: Option<Instant>,
}

impl DispatchMetrics {
    /// Time since the last applied batch, for a stale-feed indicator
    pub fn since_last_update(&self) -> Option<Duration> {
        self.last_update.map(|t| t.elapsed())
    }

    /// True when nothing has been applied within `threshold`
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.since_last_update().is_none_or(|age| age > threshold)
    }
}
