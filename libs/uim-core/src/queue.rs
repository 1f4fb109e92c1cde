//! Bounded background queue for deferred calls.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::AsyncConfig;
use crate::error::UimError;

/// Deferred unit of work.
pub type Task = BoxFuture<'static, ()>;

struct Running {
    sender: mpsc::Sender<Task>,
    workers: Vec<JoinHandle<()>>,
}

/// Fixed worker pool draining a bounded task queue.
///
/// Tasks submitted before [`enable`](Self::enable) or after
/// [`shutdown`](Self::shutdown) are rejected with
/// `SDK.AsyncFunctionNotEnabled`.
#[derive(Default)]
pub struct DispatchQueue {
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl DispatchQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Start the workers. A second call while running only logs a warning.
    ///
    /// # Errors
    ///
    /// Returns `SDK.InvalidConfig` when called outside a Tokio runtime or
    /// with a zero queue size or worker count.
    pub fn enable(&self, config: &AsyncConfig) -> Result<(), UimError> {
        let mut running = self.running.lock();
        if running.is_some() {
            tracing::warn!("async dispatch queue is already enabled");
            return Ok(());
        }
        if config.queue_size == 0 || config.workers == 0 {
            return Err(UimError::invalid_config(
                "async queue size and worker count must be positive",
            ));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            UimError::invalid_config(format!("async dispatch needs a Tokio runtime: {e}"))
        })?;

        let (sender, receiver) = mpsc::channel::<Task>(config.queue_size);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let workers = (0..config.workers)
            .map(|worker| runtime.spawn(work(worker, Arc::clone(&receiver))))
            .collect();

        tracing::debug!(
            queue_size = config.queue_size,
            workers = config.workers,
            "async dispatch queue enabled"
        );
        *running = Some(Running { sender, workers });
        Ok(())
    }

    /// Queue `task`, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `SDK.AsyncFunctionNotEnabled` when the queue is not running.
    pub async fn submit(&self, task: Task) -> Result<(), UimError> {
        let sender = self
            .running
            .lock()
            .as_ref()
            .map(|running| running.sender.clone())
            .ok_or_else(UimError::async_not_enabled)?;
        sender
            .send(task)
            .await
            .map_err(|_| UimError::async_not_enabled())
    }

    /// Close the queue and wait for the workers to finish what was queued.
    pub async fn shutdown(&self) {
        let Some(Running { sender, workers }) = self.running.lock().take() else {
            return;
        };
        drop(sender);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "async dispatch worker ended abnormally");
            }
        }
        tracing::debug!("async dispatch queue shut down");
    }
}

async fn work(worker: usize, receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(task) = next else {
            break;
        };
        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            tracing::warn!(worker, "async task panicked");
        }
    }
}
