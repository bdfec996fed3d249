//! Repository transactions.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A committed repository transaction.
///
/// Transactions are totally ordered by `(commit_time_ms, id)`; the id breaks
/// ties between transactions that share a commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    /// Repository transaction id.
    pub id: u64,
    /// Commit time in milliseconds since the epoch.
    pub commit_time_ms: u64,
    /// Number of node updates in the transaction.
    pub updates: u64,
    /// Number of node deletes in the transaction.
    pub deletes: u64,
}

impl Transaction {
    /// Creates a new transaction.
    pub fn new(id: u64, commit_time_ms: u64, updates: u64, deletes: u64) -> Self {
        Self {
            id,
            commit_time_ms,
            updates,
            deletes,
        }
    }

    /// Creates a marker transaction carrying no changes.
    pub fn marker(id: u64, commit_time_ms: u64) -> Self {
        Self::new(id, commit_time_ms, 0, 0)
    }

    /// Returns the number of node mutations (updates + deletes).
    pub fn change_count(&self) -> u64 {
        self.updates + self.deletes
    }

    /// Returns true if the transaction touches at least one node.
    pub fn has_changes(&self) -> bool {
        self.change_count() > 0
    }

    /// Returns true if `self` sorts strictly after `(commit_time_ms, id)`.
    pub fn is_after(&self, commit_time_ms: u64, id: u64) -> bool {
        (self.commit_time_ms, self.id) > (commit_time_ms, id)
    }
}

impl PartialOrd for Transaction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Transaction {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.commit_time_ms, self.id, self.updates, self.deletes).cmp(&(
            other.commit_time_ms,
            other.id,
            other.updates,
            other.deletes,
        ))
    }
}

/// A page of transactions returned by the repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPage {
    /// Transactions in ascending `(commit_time_ms, id)` order.
    pub transactions: Vec<Transaction>,
    /// Highest commit time in the repository at query time.
    pub max_commit_time_in_repo: Option<u64>,
    /// Highest transaction id in the repository at query time.
    pub max_tx_id_in_repo: Option<u64>,
}

impl TransactionPage {
    /// Creates a new page.
    pub fn new(
        transactions: Vec<Transaction>,
        max_commit_time_in_repo: Option<u64>,
        max_tx_id_in_repo: Option<u64>,
    ) -> Self {
        Self {
            transactions,
            max_commit_time_in_repo,
            max_tx_id_in_repo,
        }
    }

    /// Creates an empty page that still carries the repository maxima.
    pub fn empty(max_commit_time_in_repo: Option<u64>, max_tx_id_in_repo: Option<u64>) -> Self {
        Self::new(Vec::new(), max_commit_time_in_repo, max_tx_id_in_repo)
    }

    /// Returns true if the page holds no transactions.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Returns the number of transactions in the page.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Returns the first transaction.
    pub fn first(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// Returns the last transaction.
    pub fn last(&self) -> Option<&Transaction> {
        self.transactions.last()
    }

    /// Returns the summed change count of all transactions.
    pub fn change_count(&self) -> u64 {
        self.transactions.iter().map(Transaction::change_count).sum()
    }
}

/// Parameters for listing transactions.
///
/// Both bounds are half-open: `from` is inclusive, `to` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionQuery {
    /// Inclusive lower commit time bound.
    pub from_commit_time: Option<u64>,
    /// Inclusive lower transaction id bound.
    pub from_tx_id: Option<u64>,
    /// Exclusive upper commit time bound.
    pub to_commit_time: Option<u64>,
    /// Exclusive upper transaction id bound.
    pub to_tx_id: Option<u64>,
    /// Maximum number of transactions to return.
    pub max_results: usize,
}

impl TransactionQuery {
    /// Lists transactions committed in `[from, to)`.
    pub fn commit_window(from: u64, to: u64, max_results: usize) -> Self {
        Self {
            from_commit_time: Some(from),
            to_commit_time: Some(to),
            max_results,
            ..Self::default()
        }
    }

    /// Lists transactions committed at or after `from`.
    pub fn from_commit_time(from: u64, max_results: usize) -> Self {
        Self {
            from_commit_time: Some(from),
            max_results,
            ..Self::default()
        }
    }

    /// Lists transactions with ids in `[from, to)`.
    pub fn id_range(from: u64, to: u64, max_results: usize) -> Self {
        Self {
            from_tx_id: Some(from),
            to_tx_id: Some(to),
            max_results,
            ..Self::default()
        }
    }

    /// Looks up a single transaction by id.
    pub fn single(id: u64) -> Self {
        Self::id_range(id, id.saturating_add(1), 1)
    }

    /// Returns true if `tx` satisfies every bound of the query.
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.from_commit_time.map_or(true, |t| tx.commit_time_ms >= t)
            && self.to_commit_time.map_or(true, |t| tx.commit_time_ms < t)
            && self.from_tx_id.map_or(true, |id| tx.id >= id)
            && self.to_tx_id.map_or(true, |id| tx.id < id)
    }
}
