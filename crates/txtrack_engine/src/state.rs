//! Tracker state.

use crate::config::TrackerConfig;
use txtrack_protocol::{Cursor, Transaction, TransactionPage};

/// Synchronization progress of one tracker.
///
/// The state is an immutable value: every step returns a new state and the
/// tracking loop decides which one to keep. Only the cursor part
/// (`last_indexed_*`) is persisted; the remaining fields are rebuilt when the
/// process starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerState {
    /// Id of the last fully applied transaction.
    pub last_indexed_tx_id: u64,
    /// Commit time of the last fully applied transaction. Never decreases.
    pub last_indexed_tx_commit_time: u64,
    /// Commit time before which the index is known to have no holes.
    pub last_good_tx_commit_time_in_index: u64,
    /// Highest transaction id seen on the repository.
    pub last_tx_id_on_server: u64,
    /// Highest commit time seen on the repository.
    pub last_tx_commit_time_on_server: u64,
    /// The repository's first transaction was found in the index.
    pub checked_first_transaction_time: bool,
    /// The index was found not to be ahead of the repository.
    pub checked_last_transaction_time: bool,
    /// Transactions committed after this time are left for a later cycle.
    pub time_to_stop_indexing: u64,
    /// Completed cycles since the process started.
    pub cycle_count: u64,
}

impl TrackerState {
    /// Rebuilds the state from a persisted cursor.
    pub fn from_cursor(cursor: Cursor) -> Self {
        Self {
            last_indexed_tx_id: cursor.tx_id,
            last_indexed_tx_commit_time: cursor.commit_time_ms,
            last_good_tx_commit_time_in_index: cursor.commit_time_ms,
            ..Self::default()
        }
    }

    /// Returns the durable cursor.
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.last_indexed_tx_commit_time, self.last_indexed_tx_id)
    }

    /// Prepares the state for a new cycle starting at `now_ms`.
    ///
    /// Moves the no-holes mark `hole_retention` behind the cursor so the
    /// cycle re-scans transactions whose visibility lagged their commit, and
    /// stops the cycle at `now_ms - lag`.
    pub fn continue_cycle(self, now_ms: u64, config: &TrackerConfig) -> Self {
        let mut next = self;
        if self.last_indexed_tx_commit_time > 0 {
            next.last_good_tx_commit_time_in_index = self
                .last_indexed_tx_commit_time
                .saturating_sub(config.hole_retention_ms());
        }
        next.time_to_stop_indexing = now_ms.saturating_sub(config.lag_ms());
        next
    }

    /// Commit time the first fetch window of a cycle starts at.
    pub fn fetch_start(&self) -> u64 {
        if self.last_indexed_tx_commit_time == 0 {
            self.last_good_tx_commit_time_in_index
        } else {
            self.last_good_tx_commit_time_in_index
                .min(self.last_indexed_tx_commit_time)
        }
    }

    /// Returns true if `tx` is at or behind the cursor's commit time.
    pub fn covers(&self, tx: &Transaction) -> bool {
        tx.commit_time_ms <= self.last_indexed_tx_commit_time
    }

    /// Records `tx` as fully applied.
    ///
    /// The cursor only moves forward in `(commit_time, id)` order.
    pub fn with_indexed(self, tx: &Transaction) -> Self {
        self.with_cursor(Cursor::at(tx))
    }

    /// Merges a cursor reached by a completed flush.
    pub fn with_cursor(self, cursor: Cursor) -> Self {
        let merged = self.cursor().max(cursor);
        Self {
            last_indexed_tx_id: merged.tx_id,
            last_indexed_tx_commit_time: merged.commit_time_ms,
            ..self
        }
    }

    /// Records the repository maxima reported with a page.
    pub fn with_server_maxima(self, page: &TransactionPage) -> Self {
        Self {
            last_tx_commit_time_on_server: page
                .max_commit_time_in_repo
                .unwrap_or(self.last_tx_commit_time_on_server),
            last_tx_id_on_server: page.max_tx_id_in_repo.unwrap_or(self.last_tx_id_on_server),
            ..self
        }
    }

    /// Sets the no-holes mark.
    pub fn with_last_good(self, commit_time_ms: u64) -> Self {
        Self {
            last_good_tx_commit_time_in_index: commit_time_ms,
            ..self
        }
    }

    /// Marks the first transaction check as done.
    pub fn with_first_checked(self) -> Self {
        Self {
            checked_first_transaction_time: true,
            ..self
        }
    }

    /// Marks the last transaction check as done.
    pub fn with_last_checked(self) -> Self {
        Self {
            checked_last_transaction_time: true,
            ..self
        }
    }

    /// Counts a completed cycle.
    pub fn next_cycle(self) -> Self {
        Self {
            cycle_count: self.cycle_count + 1,
            ..self
        }
    }
}
