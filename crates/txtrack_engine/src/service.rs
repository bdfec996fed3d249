//! Periodic scheduling of tracker cycles.

use crate::client::{IndexServer, RepositoryClient};
use crate::error::TrackError;
use crate::store::StateStore;
use crate::tracker::Tracker;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a scheduled tracker stopped.
#[derive(Debug)]
pub enum ServiceExit {
    /// The cancellation token fired.
    Cancelled,
    /// A cycle failed in a way that retrying cannot fix.
    Fatal(TrackError),
}

/// Handle to a running tracker loop.
pub struct TrackerService {
    handle: JoinHandle<ServiceExit>,
    cancel: CancellationToken,
}

impl TrackerService {
    /// Starts running cycles every `interval` on the current runtime.
    ///
    /// Cycles run on the blocking pool. A tick that arrives while a cycle is
    /// still running is skipped. Retryable failures are logged and the next
    /// tick tries again; fatal ones stop the loop.
    ///
    /// The service runs under a child of `cancel`, which is cancelled when
    /// the loop exits for any reason.
    pub fn spawn<R, I, S>(
        tracker: Arc<Tracker<R, I, S>>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self
    where
        R: RepositoryClient + 'static,
        I: IndexServer + 'static,
        S: StateStore + 'static,
    {
        let cancel = cancel.child_token();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = interval.as_millis() as u64, "tracker service started");

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let tracker = Arc::clone(&tracker);
                let cycle_token = token.clone();
                let result =
                    tokio::task::spawn_blocking(move || tracker.run_cycle(&cycle_token)).await;

                match result {
                    Ok(Ok(report)) => {
                        debug!(cycle = report.cycle, up_to_date = report.up_to_date, "scheduled cycle done");
                    }
                    Ok(Err(TrackError::Cancelled)) => break,
                    Ok(Err(TrackError::CycleInProgress)) => {
                        debug!("previous cycle still running");
                    }
                    Ok(Err(e)) if e.is_fatal() => {
                        error!(error = %e, "tracker service stopping");
                        token.cancel();
                        return ServiceExit::Fatal(e);
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "cycle failed; retrying next tick");
                    }
                    Err(join) => {
                        error!(error = %join, "cycle task panicked");
                    }
                }
            }

            info!("tracker service stopped");
            ServiceExit::Cancelled
        });

        Self { handle, cancel }
    }

    /// Returns the token that stops this service and fires when it stops.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns true once the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancels the loop and waits for it to exit.
    pub async fn shutdown(self) -> ServiceExit {
        self.cancel.cancel();
        self.join().await
    }

    /// Waits for the loop to exit on its own.
    pub async fn join(self) -> ServiceExit {
        match self.handle.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(error = %e, "tracker service task failed");
                ServiceExit::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::memory::{MemoryIndex, MemoryRepository};
    use crate::store::MemoryStateStore;
    use txtrack_protocol::{NodeMutation, Transaction};

    #[tokio::test]
    async fn runs_cycles_until_cancelled() {
        let repo = MemoryRepository::new();
        repo.add_transaction(
            Transaction::new(1, 100, 1, 0),
            vec![NodeMutation::updated(10, 1, 1, "a")],
        );
        let index = Arc::new(MemoryIndex::new());
        let tracker = Arc::new(
            Tracker::new(
                TrackerConfig::new().with_worker_threads(1),
                Arc::new(repo),
                Arc::clone(&index),
                MemoryStateStore::new(),
            )
            .unwrap(),
        );

        let service = TrackerService::spawn(
            Arc::clone(&tracker),
            Duration::from_millis(10),
            CancellationToken::new(),
        );
        for _ in 0..200 {
            if tracker.stats().cycles_completed >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(matches!(service.shutdown().await, ServiceExit::Cancelled));
        assert!(tracker.stats().cycles_completed >= 2);
        assert!(index.has_marker(1));
    }

    #[tokio::test]
    async fn consistency_failure_stops_the_loop() {
        let repo = MemoryRepository::new();
        repo.add_transaction(Transaction::new(1, 100, 0, 0), Vec::new());
        let index = Arc::new(MemoryIndex::new());
        index.add_raw_marker(Transaction::new(9, 900, 0, 0));
        let tracker = Arc::new(
            Tracker::new(
                TrackerConfig::new().with_worker_threads(1),
                Arc::new(repo),
                index,
                MemoryStateStore::new(),
            )
            .unwrap(),
        );

        let service =
            TrackerService::spawn(Arc::clone(&tracker), Duration::from_millis(10), CancellationToken::new());
        let exit = tokio::time::timeout(Duration::from_secs(5), service.join())
            .await
            .unwrap();

        assert!(matches!(exit, ServiceExit::Fatal(TrackError::Consistency(_))));
        assert!(tracker.halted_reason().is_some());
    }
}
