//! Single-callback-context executor
//!
//! All subscriber callbacks run on one designated thread, the owning
//! context. Any thread may submit work through a [`ContextHandle`]; only the
//! owner of the [`ContextQueue`] executes it, strictly one task at a time and
//! in submission order.
//!
//! ```text
//!  producer threads                      owning context
//!  ────────────────                      ──────────────
//!  handle.post(f) ──┐                    queue.identify()
//!  handle.call(f) ──┼──► unbounded FIFO ──► queue.drain(timeout) ─► f()
//!  handle.post(g) ──┘                                            ─► g()
//! ```
//!
//! A `call` made on the owning thread runs inline; from anywhere else it
//! blocks until the owner has run the task, bounded by the call timeout.
//! Once the queue is shut down or dropped, pending and future calls fail with
//! [`ContextError::Stopped`] instead of blocking.

mod error;
mod handle;
mod queue;

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use std::thread::ThreadId;

use tokio::sync::mpsc;

pub use error::ContextError;
pub use handle::{ContextHandle, TaskHandle};
pub use queue::ContextQueue;

/// A unit of work queued for the owning context
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// State shared by the handle side and the queue side
#[derive(Debug, Default)]
pub(crate) struct Shared {
    /// Thread recorded by `ContextQueue::identify`
    pub(crate) owner: RwLock<Option<ThreadId>>,
    /// Set once the queue has been shut down or dropped
    pub(crate) stopped: AtomicBool,
}

impl Shared {
    pub(crate) fn is_owner(&self) -> bool {
        let current = std::thread::current().id();
        self.owner.read().map(|owner| *owner == Some(current)).unwrap_or(false)
    }
}

/// Create a connected handle/queue pair
pub fn channel() -> (ContextHandle, ContextQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());
    (ContextHandle::new(tx, shared.clone()), ContextQueue::new(rx, shared))
}

/// Human-readable text from a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
