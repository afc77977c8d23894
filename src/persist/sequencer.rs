//! Persistence Sequencer
//!
//! Strict FIFO queue of blocking storage writes. Every enqueued write runs
//! on the tokio blocking pool after all previously enqueued writes have
//! finished, so storage sees mutations in issuance order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

use crate::domain::PersistenceSignal;
use crate::error::{Error, Result};

type TaskChain = Shared<BoxFuture<'static, ()>>;

struct Inner {
    /// Queued or running writes
    pending: Mutex<usize>,
    completed: AtomicU64,
    failed: AtomicU64,
    signal: Option<Arc<dyn PersistenceSignal>>,
}

impl Inner {
    fn begin(&self) {
        let mut pending = self.pending.lock();
        *pending += 1;
        if *pending == 1 {
            self.set_persisting(true);
        }
    }

    fn finish(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.set_persisting(false);
        }
    }

    fn set_persisting(&self, persisting: bool) {
        if let Some(signal) = &self.signal {
            signal.set_persisting(persisting);
        }
    }
}

/// Ordered queue of blocking storage writes
pub struct PersistenceSequencer {
    handle: Handle,
    /// Completion of the most recently enqueued write
    last: Mutex<TaskChain>,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PersistenceSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceSequencer")
            .field("pending", &self.pending())
            .field("completed", &self.completed_writes())
            .field("failed", &self.failed_writes())
            .finish()
    }
}

impl PersistenceSequencer {
    /// Create a sequencer on the current tokio runtime.
    pub fn new(signal: Option<Arc<dyn PersistenceSignal>>) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Runtime(format!("no tokio runtime available: {}", e)))?;
        Ok(Self::with_handle(handle, signal))
    }

    pub fn with_handle(handle: Handle, signal: Option<Arc<dyn PersistenceSignal>>) -> Self {
        Self {
            handle,
            last: Mutex::new(futures::future::ready(()).boxed().shared()),
            inner: Arc::new(Inner {
                pending: Mutex::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                signal,
            }),
        }
    }

    /// Schedule `write` after every write enqueued before it.
    ///
    /// A write returning an error (or panicking) is logged and counted; the
    /// queue moves on to the next write.
    pub fn enqueue<F>(&self, label: &'static str, write: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut last = self.last.lock();
        let previous = last.clone();
        let inner = self.inner.clone();
        inner.begin();

        let task = self.handle.spawn(async move {
            previous.await;
            trace!(label, "Running queued write");
            match tokio::task::spawn_blocking(write).await {
                Ok(Ok(())) => {
                    inner.completed.fetch_add(1, Ordering::Relaxed);
                    debug!(label, "Queued write completed");
                }
                Ok(Err(e)) => {
                    inner.failed.fetch_add(1, Ordering::Relaxed);
                    error!(label, error = %e, "Queued write failed");
                }
                Err(e) => {
                    inner.failed.fetch_add(1, Ordering::Relaxed);
                    error!(label, error = %e, "Queued write panicked");
                }
            }
            inner.finish();
        });

        *last = async move {
            let _ = task.await;
        }
        .boxed()
        .shared();
    }

    /// Schedule `work` like [`enqueue`](Self::enqueue) and hand its result
    /// back to the caller, who owns any error it returns.
    pub fn submit<T, F>(
        &self,
        label: &'static str,
        work: F,
    ) -> impl std::future::Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(label, move || {
            let _ = tx.send(work());
            Ok(())
        });
        async move { rx.await.map_err(|_| Error::PersistenceClosed { label })? }
    }

    /// Resolves once every write enqueued so far has finished.
    pub async fn flush(&self) {
        let last = self.last.lock().clone();
        last.await;
    }

    /// Number of queued or running writes
    pub fn pending(&self) -> usize {
        *self.inner.pending.lock()
    }

    pub fn completed_writes(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    pub fn failed_writes(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }
}
