//! Diagnostic reports.

use std::collections::BTreeSet;
use txtrack_protocol::NodeStatus;

/// Result of looking a node's transaction up in the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbTxLookup {
    /// The node was found; holds its transaction id.
    Found(u64),
    /// The repository has no such node.
    Missing,
    /// The repository could not be asked.
    Failed(String),
}

/// What the repository knows about a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    /// Node id.
    pub node_id: u64,
    /// Status in the repository; `Unknown` unless found.
    pub db_status: NodeStatus,
    /// Transaction lookup result.
    pub db_tx: DbTxLookup,
}

/// Bounds for an index health check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckIndexBounds {
    /// Stop after this transaction id.
    pub to_tx: Option<u64>,
    /// Start at this commit time instead of the first transaction.
    pub from_time: Option<u64>,
    /// Stop after this commit time.
    pub to_time: Option<u64>,
}

/// Comparison of repository transactions against index markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexHealthReport {
    /// Transactions seen in the repository.
    pub db_transaction_count: u64,
    /// Lowest repository transaction id seen.
    pub min_tx_id: Option<u64>,
    /// Highest repository transaction id seen.
    pub max_tx_id: Option<u64>,
    /// Markers in the index, within the id bounds.
    pub index_transaction_count: u64,
    /// Repository transactions without a marker.
    pub missing_from_index: Vec<u64>,
    /// Markers without a repository transaction.
    pub unknown_in_index: Vec<u64>,
}

impl IndexHealthReport {
    /// Compares repository ids with the markers found in the same id range.
    pub fn compare(db_ids: &BTreeSet<u64>, index_ids: impl IntoIterator<Item = u64>) -> Self {
        let index_ids: BTreeSet<u64> = index_ids.into_iter().collect();
        Self {
            db_transaction_count: db_ids.len() as u64,
            min_tx_id: db_ids.first().copied(),
            max_tx_id: db_ids.last().copied(),
            index_transaction_count: index_ids.len() as u64,
            missing_from_index: db_ids.difference(&index_ids).copied().collect(),
            unknown_in_index: index_ids.difference(db_ids).copied().collect(),
        }
    }

    /// Returns true if repository and index agree.
    pub fn is_healthy(&self) -> bool {
        self.missing_from_index.is_empty() && self.unknown_in_index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_finds_both_differences() {
        let db: BTreeSet<u64> = [1, 2, 3, 5].into_iter().collect();
        let report = IndexHealthReport::compare(&db, [1, 3, 4, 5]);

        assert_eq!(report.db_transaction_count, 4);
        assert_eq!(report.index_transaction_count, 4);
        assert_eq!(report.min_tx_id, Some(1));
        assert_eq!(report.max_tx_id, Some(5));
        assert_eq!(report.missing_from_index, vec![2]);
        assert_eq!(report.unknown_in_index, vec![4]);
        assert!(!report.is_healthy());
    }

    #[test]
    fn empty_is_healthy() {
        let report = IndexHealthReport::compare(&BTreeSet::new(), []);
        assert!(report.is_healthy());
        assert_eq!(report.min_tx_id, None);
    }
}
