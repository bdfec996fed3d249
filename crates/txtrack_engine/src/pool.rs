//! Fixed-size worker pool with a completion barrier.

use crate::coordination::RollbackFlag;
use crate::error::{ConfigError, IndexResult, TrackError, TrackResult};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Default)]
struct Outcome {
    outstanding: usize,
    failures: Vec<String>,
}

/// Counts outstanding jobs and wakes the submitter when the last finishes.
#[derive(Default)]
struct Completion {
    outcome: Mutex<Outcome>,
    done: Condvar,
}

impl Completion {
    fn begin(&self, jobs: usize) {
        self.outcome.lock().outstanding += jobs;
    }

    fn finish(&self, failure: Option<String>) {
        let mut outcome = self.outcome.lock();
        if let Some(message) = failure {
            outcome.failures.push(message);
        }
        outcome.outstanding -= 1;
        if outcome.outstanding == 0 {
            self.done.notify_all();
        }
    }

    fn wait(&self) -> Vec<String> {
        let mut outcome = self.outcome.lock();
        while outcome.outstanding > 0 {
            self.done.wait(&mut outcome);
        }
        std::mem::take(&mut outcome.failures)
    }
}

/// Runs node sub-batches on a fixed number of threads.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    rollback: RollbackFlag,
    threads: usize,
}

impl WorkerPool {
    /// Creates a pool of `threads` workers sharing `rollback`.
    pub fn new(threads: usize, rollback: RollbackFlag) -> TrackResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("txtrack-worker-{i}"))
            .build()
            .map_err(|e| ConfigError::OutOfRange(format!("worker pool: {e}")))?;
        Ok(Self {
            pool,
            rollback,
            threads,
        })
    }

    /// Returns the number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs every job and blocks until all of them have completed.
    ///
    /// Jobs still queued when `cancel` fires are skipped. Any failed or
    /// panicked job raises the rollback flag and the call returns
    /// [`TrackError::WorkerFailure`].
    pub fn run_all<J>(&self, jobs: Vec<J>, cancel: &CancellationToken) -> TrackResult<()>
    where
        J: FnOnce() -> IndexResult<()> + Send + 'static,
    {
        if jobs.is_empty() {
            return Ok(());
        }

        let completion = Arc::new(Completion::default());
        completion.begin(jobs.len());
        debug!(jobs = jobs.len(), "submitting node batches");

        for job in jobs {
            let completion = Arc::clone(&completion);
            let cancel = cancel.clone();
            self.pool.spawn(move || {
                if cancel.is_cancelled() {
                    completion.finish(None);
                    return;
                }
                let failure = match catch_unwind(AssertUnwindSafe(job)) {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some("worker panicked".to_string()),
                };
                completion.finish(failure);
            });
        }

        let failures = completion.wait();
        if let Some(first) = failures.first() {
            warn!(failed = failures.len(), error = %first, "node batches failed; requesting rollback");
            self.rollback.request();
            return Err(TrackError::WorkerFailure {
                failed: failures.len(),
                message: first.clone(),
            });
        }
        if cancel.is_cancelled() {
            return Err(TrackError::Cancelled);
        }
        Ok(())
    }
}
