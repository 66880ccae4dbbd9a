//! ContextQueue - the owning context's side of the executor

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{ContextError, Job, Shared};

/// Receiving side of the executor, drained only by the owning context
///
/// Every drain checks that it runs on the thread recorded by `identify`.
/// Off that thread nothing is executed and the call is refused.
pub struct ContextQueue {
    rx: mpsc::UnboundedReceiver<Job>,
    shared: Arc<Shared>,
    /// Every handle has been dropped and the queue is empty
    closed: bool,
    /// Timer runtime for blocking waits, built on first use
    waiter: Option<Runtime>,
}

impl ContextQueue {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Job>, shared: Arc<Shared>) -> Self {
        Self {
            rx,
            shared,
            closed: false,
            waiter: None,
        }
    }

    /// Record the calling thread as the owning context
    pub fn identify(&self) {
        let current = std::thread::current().id();
        match self.shared.owner.write() {
            Ok(mut owner) => *owner = Some(current),
            Err(_) => warn!("ContextQueue::identify: owner lock poisoned"),
        }
        info!(thread = ?current, "Owning context identified");
    }

    fn check_owner(&self, op: &str) -> Result<(), ContextError> {
        if self.shared.is_owner() {
            return Ok(());
        }
        error!(
            thread = ?std::thread::current().id(),
            "ContextQueue::{}: called off the owning context; nothing run",
            op
        );
        Err(ContextError::NotContextThread)
    }

    fn check_outside_runtime(op: &str) -> Result<(), ContextError> {
        if Handle::try_current().is_err() {
            return Ok(());
        }
        error!("ContextQueue::{}: blocking wait attempted inside an async runtime", op);
        Err(ContextError::Runtime("blocking wait inside an async runtime".to_string()))
    }

    /// Run every task queued at the time of the call, without waiting
    ///
    /// Tasks queued while draining wait for the next drain. Returns 0 and
    /// runs nothing when called off the owning context.
    pub fn drain_pending(&mut self) -> usize {
        if self.check_owner("drain_pending").is_err() {
            return 0;
        }

        let queued = self.rx.len();
        let mut ran = 0;
        while ran < queued {
            match self.rx.try_recv() {
                Ok(job) => {
                    job();
                    ran += 1;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        ran
    }

    /// Block at most `timeout` for work, then run everything queued
    ///
    /// Must be called on the owning context, outside any async runtime.
    pub fn drain(&mut self, timeout: Duration) -> Result<usize, ContextError> {
        self.check_owner("drain")?;
        if !self.rx.is_empty() {
            return Ok(self.drain_pending());
        }
        if self.closed {
            return Ok(0);
        }
        Self::check_outside_runtime("drain")?;

        let waiter = match self.waiter.take() {
            Some(waiter) => waiter,
            None => Builder::new_current_thread()
                .enable_time()
                .build()
                .map_err(|e| ContextError::Runtime(e.to_string()))?,
        };
        let rx = &mut self.rx;
        let received = waiter.block_on(async { tokio::time::timeout(timeout, rx.recv()).await });
        self.waiter = Some(waiter);

        match received {
            Ok(Some(job)) => {
                job();
                Ok(1 + self.drain_pending())
            }
            Ok(None) => {
                debug!("ContextQueue::drain: all handles dropped");
                self.closed = true;
                Ok(0)
            }
            Err(_) => Ok(0),
        }
    }

    /// Make the calling thread the owning context and serve it
    ///
    /// Blocks until `quit` is set or every handle is gone. A dropped quit
    /// sender leaves the loop serving until the handles go away. Fails
    /// without running anything when called inside an async runtime.
    pub fn run_blocking(&mut self, quit: watch::Receiver<bool>, poll_timeout: Duration) -> Result<(), ContextError> {
        Self::check_outside_runtime("run_blocking")?;
        self.identify();
        info!("Context loop started");

        while !*quit.borrow() && !self.closed {
            self.drain(poll_timeout)?;
        }

        // Work queued before quit still runs
        let ran = self.drain_pending();
        info!(final_tasks = ran, "Context loop stopped");
        Ok(())
    }

    /// True once every handle has been dropped and nothing is left to run
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop accepting work and discard whatever is still queued
    ///
    /// Callers blocked in `call` or `TaskHandle::wait` get `Stopped`.
    pub fn shutdown(mut self) -> usize {
        self.shared.stopped.store(true, Ordering::Release);
        self.rx.close();
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        info!(discarded, "Owning context shut down");
        discarded
    }
}

impl Drop for ContextQueue {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Some(waiter) = self.waiter.take() {
            waiter.shutdown_background();
        }
    }
}
