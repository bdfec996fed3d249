//! Startup consistency checks between repository and index.

use crate::client::{optional, Capabilities, IndexServer, RepositoryClient};
use crate::config::TrackerConfig;
use crate::error::{ConsistencyError, TrackResult};
use crate::state::TrackerState;
use tracing::{error, info, warn};
use txtrack_protocol::{TransactionPage, TransactionQuery};

/// Outcome of the first transaction check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstTxCheck {
    /// The index was empty; nothing to verify.
    NotRequired,
    /// Verified in an earlier run.
    AlreadyChecked,
    /// The repository's first transaction is in the index exactly once.
    Verified {
        /// Transaction id.
        tx_id: u64,
        /// Commit time.
        commit_time_ms: u64,
    },
    /// The first transaction is in the index more than once.
    Duplicate {
        /// Transaction id.
        tx_id: u64,
        /// Number of markers found.
        count: u64,
    },
    /// The shard's node range has no transactions yet.
    EmptyShard,
    /// The repository returned no transaction in the probed id range.
    NoTransactions,
}

/// Outcome of the last transaction check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastTxCheck {
    /// The index was empty; nothing to verify.
    NotRequired,
    /// Verified in an earlier run.
    AlreadyChecked,
    /// The index is not ahead of the repository.
    Verified {
        /// Newest commit time in the index, if any marker exists.
        index_commit_time_ms: Option<u64>,
        /// Newest commit time in the repository.
        repo_commit_time_ms: u64,
    },
    /// The repository did not report its maxima.
    Unknown,
}

/// Result of a consistency audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditReport {
    /// First transaction check.
    pub first: FirstTxCheck,
    /// Last transaction check.
    pub last: LastTxCheck,
}

/// Verifies that the index was built from the repository it is tracking.
///
/// Runs once per process, before the first cycle tracks anything.
#[derive(Debug, Clone)]
pub struct ConsistencyAuditor {
    caps: Capabilities,
    initial_tx_range: std::ops::Range<u64>,
}

impl ConsistencyAuditor {
    /// Creates an auditor.
    pub fn new(config: &TrackerConfig, caps: Capabilities) -> Self {
        Self {
            caps,
            initial_tx_range: config.initial_tx_range.clone(),
        }
    }

    fn first_in_range<R>(&self, repo: &R, from_commit_time: Option<u64>) -> TrackResult<TransactionPage>
    where
        R: RepositoryClient + ?Sized,
    {
        let query = TransactionQuery {
            from_commit_time,
            ..TransactionQuery::id_range(self.initial_tx_range.start, self.initial_tx_range.end, 1)
        };
        Ok(repo.list_transactions(&query)?)
    }

    /// Audits `state`, returning the updated state and what was found.
    ///
    /// A mismatch that retrying cannot fix is returned as
    /// [`TrackError::Consistency`](crate::TrackError::Consistency).
    pub fn audit<R, I>(
        &self,
        repo: &R,
        index: &I,
        shard_range: Option<(u64, u64)>,
        state: TrackerState,
    ) -> TrackResult<(TrackerState, AuditReport)>
    where
        R: RepositoryClient + ?Sized,
        I: IndexServer + ?Sized,
    {
        let mut state = state;
        let mut report = AuditReport {
            first: FirstTxCheck::AlreadyChecked,
            last: LastTxCheck::AlreadyChecked,
        };
        let mut first_page = None;

        if state.cursor().is_origin() {
            state = state.with_first_checked().with_last_checked();
            report = AuditReport {
                first: FirstTxCheck::NotRequired,
                last: LastTxCheck::NotRequired,
            };
            info!("no transactions found; no verification required");

            let page = self.first_in_range(repo, None)?;
            if let Some(first) = page.first() {
                state = state
                    .with_last_good(first.commit_time_ms)
                    .with_server_maxima(&page);
            }
            first_page = Some(page);
        }

        if !state.checked_first_transaction_time {
            let min_commit_time = match shard_range.filter(|_| self.caps.commit_time_range) {
                Some((start, end)) => repo.commit_time_range(start, end)?.map(|(min, _)| min),
                None => Some(0),
            };

            report.first = match min_commit_time {
                None => FirstTxCheck::EmptyShard,
                Some(min) => {
                    let page = self.first_in_range(repo, Some(min))?;
                    match page.first() {
                        None => FirstTxCheck::NoTransactions,
                        Some(first) => {
                            let count =
                                index.doc_count_for_transaction(first.id, first.commit_time_ms)?;
                            match count {
                                0 => {
                                    error!(
                                        tx_id = first.id,
                                        commit_time_ms = first.commit_time_ms,
                                        "first transaction was not found with the correct timestamp; \
                                         index and repository do not match"
                                    );
                                    return Err(ConsistencyError::FirstTransactionMissing {
                                        tx_id: first.id,
                                        commit_time_ms: first.commit_time_ms,
                                    }
                                    .into());
                                }
                                1 => {
                                    state = state.with_first_checked();
                                    info!(tx_id = first.id, "verified first transaction and timestamp in index");
                                    FirstTxCheck::Verified {
                                        tx_id: first.id,
                                        commit_time_ms: first.commit_time_ms,
                                    }
                                }
                                count => {
                                    warn!(tx_id = first.id, count, "duplicate initial transaction found with correct timestamp");
                                    FirstTxCheck::Duplicate {
                                        tx_id: first.id,
                                        count,
                                    }
                                }
                            }
                        }
                    }
                }
            };
        }

        if !state.checked_last_transaction_time {
            let page = match first_page {
                Some(page) => page,
                None => self.first_in_range(repo, None)?,
            };
            state = state.with_server_maxima(&page);

            report.last = match (page.max_commit_time_in_repo, page.max_tx_id_in_repo) {
                (Some(repo_commit_time_ms), Some(repo_tx_id)) => {
                    let max_in_index = optional(index.max_transaction_in_index())?;
                    match max_in_index {
                        Some(max) if max.commit_time_ms > repo_commit_time_ms => {
                            error!(
                                index_tx_id = max.id,
                                index_commit_time_ms = max.commit_time_ms,
                                repo_tx_id,
                                repo_commit_time_ms,
                                "last transaction in index is later than in repository"
                            );
                            return Err(ConsistencyError::IndexAheadOfRepository {
                                index_tx_id: max.id,
                                index_commit_time_ms: max.commit_time_ms,
                                repo_tx_id,
                                repo_commit_time_ms,
                            }
                            .into());
                        }
                        max => {
                            state = state.with_last_checked();
                            info!("verified last transaction timestamp in index not later than repository");
                            LastTxCheck::Verified {
                                index_commit_time_ms: max.map(|m| m.commit_time_ms),
                                repo_commit_time_ms,
                            }
                        }
                    }
                }
                _ => LastTxCheck::Unknown,
            };
        }

        Ok((state, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardConfig;
    use crate::error::TrackError;
    use crate::memory::{MemoryIndex, MemoryRepository};
    use txtrack_protocol::{Cursor, NodeMutation, Transaction};

    fn repo() -> MemoryRepository {
        let repo = MemoryRepository::new();
        repo.add_transaction(
            Transaction::new(1, 100, 1, 0),
            vec![NodeMutation::updated(10, 1, 1, "a")],
        );
        repo.add_transaction(
            Transaction::new(2, 200, 2, 0),
            vec![
                NodeMutation::updated(20, 2, 1, "b"),
                NodeMutation::updated(21, 2, 1, "c"),
            ],
        );
        repo
    }

    fn auditor() -> ConsistencyAuditor {
        ConsistencyAuditor::new(&TrackerConfig::new(), Capabilities::all())
    }

    #[test]
    fn empty_index_seeds_from_first_transaction() {
        let (state, report) = auditor()
            .audit(&repo(), &MemoryIndex::new(), None, TrackerState::default())
            .unwrap();

        assert_eq!(report.first, FirstTxCheck::NotRequired);
        assert_eq!(report.last, LastTxCheck::NotRequired);
        assert_eq!(state.last_good_tx_commit_time_in_index, 100);
        assert_eq!(state.last_tx_commit_time_on_server, 200);
        assert_eq!(state.last_tx_id_on_server, 2);
        assert!(state.checked_first_transaction_time);
        assert!(state.checked_last_transaction_time);
    }

    #[test]
    fn first_transaction_verified() {
        let index = MemoryIndex::new();
        index.index_transaction(&Transaction::new(1, 100, 1, 0), false).unwrap();
        let state = TrackerState::from_cursor(Cursor::new(100, 1));

        let (state, report) = auditor().audit(&repo(), &index, None, state).unwrap();
        assert_eq!(
            report.first,
            FirstTxCheck::Verified {
                tx_id: 1,
                commit_time_ms: 100
            }
        );
        assert!(matches!(report.last, LastTxCheck::Verified { .. }));
        assert!(state.checked_first_transaction_time);
    }

    #[test]
    fn missing_first_transaction_is_fatal() {
        let index = MemoryIndex::new();
        index.index_transaction(&Transaction::new(1, 999, 1, 0), false).unwrap();
        let state = TrackerState::from_cursor(Cursor::new(999, 1));

        let err = auditor().audit(&repo(), &index, None, state).unwrap_err();
        assert!(matches!(
            err,
            TrackError::Consistency(ConsistencyError::FirstTransactionMissing { tx_id: 1, .. })
        ));
    }

    #[test]
    fn duplicate_first_transaction_is_a_warning() {
        let index = MemoryIndex::new();
        index.add_raw_marker(Transaction::new(1, 100, 1, 0));
        index.add_raw_marker(Transaction::new(1, 100, 1, 0));
        let state = TrackerState::from_cursor(Cursor::new(100, 1));

        let (state, report) = auditor().audit(&repo(), &index, None, state).unwrap();
        assert_eq!(report.first, FirstTxCheck::Duplicate { tx_id: 1, count: 2 });
        assert!(!state.checked_first_transaction_time);
    }

    #[test]
    fn index_ahead_of_repository_is_fatal() {
        let index = MemoryIndex::new();
        index.index_transaction(&Transaction::new(1, 100, 1, 0), false).unwrap();
        index.index_transaction(&Transaction::new(9, 5_000, 1, 0), false).unwrap();
        let state = TrackerState::from_cursor(Cursor::new(5_000, 9));

        let err = auditor().audit(&repo(), &index, None, state).unwrap_err();
        assert!(matches!(
            err,
            TrackError::Consistency(ConsistencyError::IndexAheadOfRepository { .. })
        ));
    }

    #[test]
    fn empty_shard_skips_first_check() {
        let config = TrackerConfig::new().with_shard(ShardConfig::db_id_range(1_000, 2_000));
        let auditor = ConsistencyAuditor::new(&config, Capabilities::all());
        let state = TrackerState::from_cursor(Cursor::new(200, 2));

        let (state, report) = auditor
            .audit(&repo(), &MemoryIndex::new(), Some((1_000, 2_000)), state)
            .unwrap();
        assert_eq!(report.first, FirstTxCheck::EmptyShard);
        assert!(!state.checked_first_transaction_time);
    }

    #[test]
    fn checked_state_skips_everything() {
        let state = TrackerState::from_cursor(Cursor::new(100, 1))
            .with_first_checked()
            .with_last_checked();
        let repo = repo();
        let (_, report) = auditor()
            .audit(&repo, &MemoryIndex::new(), None, state)
            .unwrap();
        assert_eq!(report.first, FirstTxCheck::AlreadyChecked);
        assert_eq!(report.last, LastTxCheck::AlreadyChecked);
        assert_eq!(repo.transaction_queries(), 0);
    }
}
