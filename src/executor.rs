use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::task::JoinSet;
use tracing::warn;

use crate::error::{Error, Result};

/// Outcome of draining a queue through a [`WorkerPool`].
#[derive(Debug, Default)]
pub struct PoolReport {
    /// Jobs that ran to completion, successfully or not.
    pub completed: usize,
    /// Jobs never started because the pool was cancelled.
    pub skipped: usize,
    /// The error that cancelled the pool, if any.
    pub error: Option<Error>,
}

/// Fixed-size pool of async workers pulling jobs from a shared queue.
///
/// A job that returns `Err` cancels the pool: queued jobs are dropped,
/// jobs already running on other workers finish normally.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `task` over every job and wait for all workers to stop.
    pub async fn run<T, F, Fut>(&self, jobs: Vec<T>, task: F) -> PoolReport
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if jobs.is_empty() {
            return PoolReport::default();
        }

        let workers = self.concurrency.min(jobs.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let cancelled = Arc::new(AtomicBool::new(false));
        let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let task = Arc::new(task);

        let mut set = JoinSet::new();
        for _ in 0..workers {
            let queue = queue.clone();
            let cancelled = cancelled.clone();
            let first_error = first_error.clone();
            let task = task.clone();
            set.spawn(async move {
                let mut completed = 0usize;
                loop {
                    if cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some(job) = next else {
                        break;
                    };
                    let outcome = (*task)(job).await;
                    completed += 1;
                    if let Err(e) = outcome {
                        cancelled.store(true, Ordering::SeqCst);
                        first_error
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get_or_insert(e);
                        break;
                    }
                }
                completed
            });
        }

        let mut report = PoolReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(completed) => report.completed += completed,
                Err(e) => {
                    warn!("sync worker stopped abnormally: {e}");
                    cancelled.store(true, Ordering::SeqCst);
                    first_error
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_or_insert(Error::Worker(e.to_string()));
                }
            }
        }

        report.skipped =
            queue.lock().unwrap_or_else(PoisonError::into_inner).len();
        report.error = first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        report
    }
}
