//! Time-window transaction fetching.

use crate::client::{Capabilities, RepositoryClient};
use crate::config::TrackerConfig;
use crate::coordination::check_cancelled;
use crate::error::TrackResult;
use crate::history::BoundedHistory;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use txtrack_protocol::{Transaction, TransactionPage, TransactionQuery};

/// Pulls transactions from the repository in commit-time windows.
///
/// Each call steps forward from a start time until a window yields something
/// new, the end time is reached, or the repository has nothing further.
#[derive(Debug, Clone, Copy)]
pub struct WindowFetcher {
    caps: Capabilities,
    time_step_ms: u64,
    max_results: usize,
}

impl WindowFetcher {
    /// Creates a fetcher from the tracker configuration.
    pub fn new(config: &TrackerConfig, caps: Capabilities) -> Self {
        Self {
            caps,
            time_step_ms: config.time_step_ms().max(1),
            max_results: config.max_window_results,
        }
    }

    fn window<R>(&self, repo: &R, from: u64) -> TrackResult<TransactionPage>
    where
        R: RepositoryClient + ?Sized,
    {
        let to = from.saturating_add(self.time_step_ms);
        debug!(from, to, "listing transaction window");
        Ok(repo.list_transactions(&TransactionQuery::commit_window(from, to, self.max_results))?)
    }

    /// Returns the next window of transactions at or after `from`.
    ///
    /// A start of 0 issues a single window. Otherwise empty windows are
    /// skipped while `from < end_time`, and windows already held by `history`
    /// are skipped as stale repeats. Stepping stops once the start passes the
    /// repository's reported maximum commit time.
    pub fn fetch<R>(
        &self,
        repo: &R,
        from: u64,
        end_time: u64,
        history: &BoundedHistory,
        cancel: &CancellationToken,
    ) -> TrackResult<TransactionPage>
    where
        R: RepositoryClient + ?Sized,
    {
        check_cancelled(cancel)?;
        if from == 0 {
            return self.window(repo, 0);
        }

        let mut start = from;
        loop {
            check_cancelled(cancel)?;

            let mut page = self.window(repo, start)?;
            start = start.saturating_add(self.time_step_ms);

            if page.is_empty() && self.caps.next_commit_time {
                match repo.next_commit_time_after(start)? {
                    Some(next) => {
                        info!(from = start, to = next, "advancing transactions");
                        page = self.window(repo, next)?;
                        start = next.saturating_add(self.time_step_ms);
                    }
                    None => return Ok(page),
                }
            }

            let stale = !page.is_empty() && history.already_found(&page.transactions);
            let keep_stepping = (page.is_empty() && start < end_time) || stale;
            if !keep_stepping {
                return Ok(page);
            }

            match page.max_commit_time_in_repo {
                Some(max) if start > max => {
                    return Ok(TransactionPage::empty(
                        page.max_commit_time_in_repo,
                        page.max_tx_id_in_repo,
                    ));
                }
                None if page.is_empty() => return Ok(page),
                _ => {}
            }
        }
    }

    /// Like [`fetch`](Self::fetch), clamped to a DB id range shard.
    ///
    /// With the commit time range service, the start is raised to the
    /// shard's first commit time. When the shard has no transactions at or
    /// after the start, the page is replaced by a single synthetic marker
    /// for the repository's latest transaction so the cursor can advance
    /// without reprocessing anything.
    pub fn fetch_for_shard<R>(
        &self,
        repo: &R,
        shard_range: Option<(u64, u64)>,
        from: u64,
        end_time: u64,
        history: &BoundedHistory,
        cancel: &CancellationToken,
    ) -> TrackResult<TransactionPage>
    where
        R: RepositoryClient + ?Sized,
    {
        let Some((start_id, end_id)) = shard_range.filter(|_| self.caps.commit_time_range) else {
            return self.fetch(repo, from, end_time, history, cancel);
        };

        let mut from = from;
        let mut out_of_range = false;
        match repo.commit_time_range(start_id, end_id)? {
            None => {
                debug!(start_id, end_id, "no nodes in shard range; indexing only latest transaction");
                out_of_range = true;
            }
            Some((min, max)) => {
                if from > max {
                    debug!(start_id, end_id, from, max, "past last commit in shard range; indexing only latest transaction");
                    out_of_range = true;
                }
                if from < min {
                    debug!(from, to = min, "skipping transactions before shard range");
                    from = min;
                }
            }
        }

        let page = self.fetch(repo, from, end_time, history, cancel)?;
        if !out_of_range {
            return Ok(page);
        }

        match (page.max_tx_id_in_repo, page.max_commit_time_in_repo) {
            (Some(id), Some(commit_time)) => Ok(TransactionPage::new(
                vec![Transaction::marker(id, commit_time)],
                Some(commit_time),
                Some(id),
            )),
            _ => Ok(TransactionPage::empty(
                page.max_commit_time_in_repo,
                page.max_tx_id_in_repo,
            )),
        }
    }
}
