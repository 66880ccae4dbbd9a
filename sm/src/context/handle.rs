//! ContextHandle - submit work to the owning context from any thread

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, mpsc as std_mpsc};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::error::ContextError;
use super::{Job, Shared, panic_message};

/// Default bound on a cross-thread `call`
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Cloneable submission side of the executor
#[derive(Clone)]
pub struct ContextHandle {
    tx: mpsc::UnboundedSender<Job>,
    shared: Arc<Shared>,
    /// Bound on a blocking `call`; None waits indefinitely
    call_timeout: Option<Duration>,
}

impl ContextHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Job>, shared: Arc<Shared>) -> Self {
        Self {
            tx,
            shared,
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
        }
    }

    /// Set the bound applied by [`call`](Self::call)
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Queue `f` for the owning context and return immediately
    ///
    /// Even on the owning thread the task is deferred to the next drain, so
    /// it stays ordered behind everything queued before it.
    pub fn post<F, T>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = std_mpsc::sync_channel(1);
        let job: Job = Box::new(move || {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(f)).map_err(|p| ContextError::Panicked(panic_message(&*p)));
            if let Err(ref e) = outcome {
                error!(error = %e, "Context task failed");
            }
            // The submitter may have stopped waiting
            let _ = result_tx.send(outcome);
        });

        if self.tx.send(job).is_err() {
            // Job and its result sender are dropped here; the handle reports Stopped
            debug!("ContextHandle::post: context queue closed");
        }

        TaskHandle {
            rx: result_rx,
            shared: self.shared.clone(),
        }
    }

    /// Run `f` on the owning context and return its result
    ///
    /// Inline when already on the owning thread; otherwise blocks for at
    /// most the configured call timeout.
    pub fn call<F, T>(&self, f: F) -> Result<T, ContextError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.call_within(f, self.call_timeout)
    }

    /// Like [`call`](Self::call) with an explicit bound
    pub fn call_within<F, T>(&self, f: F, timeout: Option<Duration>) -> Result<T, ContextError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.shared.is_owner() {
            return panic::catch_unwind(AssertUnwindSafe(f)).map_err(|p| ContextError::Panicked(panic_message(&*p)));
        }
        if self.is_stopped() {
            return Err(ContextError::Stopped);
        }
        self.post(f).wait(timeout)
    }

    /// True when the current thread is the owning context
    pub fn is_context_thread(&self) -> bool {
        self.shared.is_owner()
    }

    pub fn assert_context_thread(&self) -> Result<(), ContextError> {
        if self.is_context_thread() {
            Ok(())
        } else {
            Err(ContextError::NotContextThread)
        }
    }

    pub fn assert_not_context_thread(&self) -> Result<(), ContextError> {
        if self.is_context_thread() {
            Err(ContextError::ContextThread)
        } else {
            Ok(())
        }
    }

    /// True once the owning context has shut down
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

/// Result slot of a posted task
pub struct TaskHandle<T> {
    rx: std_mpsc::Receiver<Result<T, ContextError>>,
    shared: Arc<Shared>,
}

impl<T> TaskHandle<T> {
    /// Block until the task has run, for at most `timeout` if given
    ///
    /// Fails with `ContextThread` instead of deadlocking when called on the
    /// owning thread before the task has run.
    pub fn wait(self, timeout: Option<Duration>) -> Result<T, ContextError> {
        match self.rx.try_recv() {
            Ok(outcome) => return outcome,
            Err(std_mpsc::TryRecvError::Disconnected) => return Err(ContextError::Stopped),
            Err(std_mpsc::TryRecvError::Empty) => {}
        }
        if self.shared.is_owner() {
            return Err(ContextError::ContextThread);
        }

        match timeout {
            Some(limit) => match self.rx.recv_timeout(limit) {
                Ok(outcome) => outcome,
                Err(std_mpsc::RecvTimeoutError::Timeout) => Err(ContextError::Timeout(limit)),
                Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(ContextError::Stopped),
            },
            None => self.rx.recv().unwrap_or(Err(ContextError::Stopped)),
        }
    }

    /// The result if the task has already run; yields it only once
    pub fn try_result(&self) -> Option<Result<T, ContextError>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(std_mpsc::TryRecvError::Empty) => None,
            Err(std_mpsc::TryRecvError::Disconnected) => Some(Err(ContextError::Stopped)),
        }
    }
}
