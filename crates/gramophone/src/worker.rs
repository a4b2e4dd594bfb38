use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

/// Why a job context stopped. Operator cancellation and process
/// shutdown travel over the same token, so the cause is carried
/// alongside it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    #[error("job canceled")]
    Job,

    #[error("shutting down")]
    Shutdown,
}

/// Cancellation context threaded through every I/O operation of one job.
#[derive(Debug, Clone)]
pub struct JobCtx {
    token: CancellationToken,
    shutdown: CancellationToken,
    cause: Arc<OnceLock<Interrupted>>,
}

impl JobCtx {
    fn new(shutdown: CancellationToken) -> Self {
        Self {
            token: shutdown.child_token(),
            shutdown,
            cause: Arc::new(OnceLock::new()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// The cause behind a cancelled context. Explicit causes win;
    /// otherwise a cancelled parent means the process is going down.
    pub fn interruption(&self) -> Interrupted {
        if let Some(cause) = self.cause.get() {
            return *cause;
        }
        if self.shutdown.is_cancelled() {
            Interrupted::Shutdown
        } else {
            Interrupted::Job
        }
    }

    /// Drives `fut` until it finishes or the context is cancelled.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.interruption()),
            out = fut => Ok(out),
        }
    }

    fn cancel(&self, cause: Interrupted) {
        self.cause.set(cause).ok();
        self.token.cancel();
    }
}

/// Single-slot admission gate: at most one job context is live at any
/// time. The slot is released when the [`JobSlot`] drops, on every exit
/// path including panics.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    slot: Arc<Semaphore>,
    current: Mutex<Option<JobCtx>>,
    shutdown: CancellationToken,
}

pub struct JobSlot {
    inner: Arc<WorkerInner>,
    ctx: JobCtx,
    _permit: OwnedSemaphorePermit,
}

impl Worker {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                slot: Arc::new(Semaphore::new(1)),
                current: Mutex::new(None),
                shutdown,
            }),
        }
    }

    /// Claims the job slot if it is free.
    pub fn try_acquire(&self) -> Option<JobSlot> {
        let permit = match self.inner.slot.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return None,
            Err(TryAcquireError::Closed) => return None,
        };
        let ctx = JobCtx::new(self.inner.shutdown.clone());
        *self.inner.current.lock().unwrap() = Some(ctx.clone());
        Some(JobSlot {
            inner: self.inner.clone(),
            ctx,
            _permit: permit,
        })
    }

    /// Cancels the running job, if any, with the explicit job cause.
    /// Calling it again before the next acquire is a no-op.
    pub fn cancel(&self) -> bool {
        let current = self.inner.current.lock().unwrap();
        match current.as_ref() {
            Some(ctx) if !ctx.is_cancelled() => {
                ctx.cancel(Interrupted::Job);
                true
            }
            _ => false,
        }
    }

    pub fn running(&self) -> bool {
        self.inner.slot.available_permits() == 0
    }
}

impl JobSlot {
    pub fn ctx(&self) -> &JobCtx {
        &self.ctx
    }
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        // cancel() must be a no-op between jobs
        *self.inner.current.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn admission_is_single_slot() {
        let worker = Worker::new(CancellationToken::new());
        let first = worker.try_acquire();
        assert!(first.is_some());
        assert!(worker.try_acquire().is_none());
        assert!(worker.running());

        drop(first);
        assert!(!worker.running());
        assert!(worker.try_acquire().is_some());
    }

    #[tokio::test]
    async fn concurrent_acquire_yields_one_winner() {
        let worker = Worker::new(CancellationToken::new());
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        // slots are returned, not dropped, so no task can win a slot
        // another one released
        let mut handles = Vec::new();
        for _ in 0..16 {
            let worker = worker.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                worker.try_acquire()
            }));
        }

        let mut slots = Vec::new();
        for handle in handles {
            if let Some(slot) = handle.await.unwrap() {
                slots.push(slot);
            }
        }
        assert_eq!(slots.len(), 1);
    }

    #[tokio::test]
    async fn cancel_carries_the_job_cause() {
        let worker = Worker::new(CancellationToken::new());
        let slot = worker.try_acquire().unwrap();
        let ctx = slot.ctx().clone();

        assert!(worker.cancel());
        // a second cancel on the same job is a no-op
        assert!(!worker.cancel());

        let out = ctx
            .guard(tokio::time::sleep(Duration::from_secs(60)))
            .await;
        assert_eq!(out, Err(Interrupted::Job));
        assert_eq!(ctx.interruption(), Interrupted::Job);
    }

    #[tokio::test]
    async fn shutdown_carries_the_shutdown_cause() {
        let shutdown = CancellationToken::new();
        let worker = Worker::new(shutdown.clone());
        let slot = worker.try_acquire().unwrap();
        let ctx = slot.ctx().clone();

        shutdown.cancel();
        let out = ctx
            .guard(tokio::time::sleep(Duration::from_secs(60)))
            .await;
        assert_eq!(out, Err(Interrupted::Shutdown));
    }

    #[tokio::test]
    async fn cancel_after_release_is_a_no_op() {
        let worker = Worker::new(CancellationToken::new());
        let slot = worker.try_acquire().unwrap();
        drop(slot);
        assert!(!worker.cancel());
    }
}
