//! Boundary traits for the upstream repository and the search index.

use crate::config::TrackerConfig;
use crate::error::{IndexError, IndexResult, RepositoryError, RepositoryResult};
use tracing::{error, info, warn};
use txtrack_protocol::{NodeMutation, NodeQuery, Transaction, TransactionPage, TransactionQuery};

/// Client for the transactional content repository.
///
/// This trait abstracts the repository API, allowing for different
/// implementations (HTTP, in-memory for testing, recorded snapshots).
pub trait RepositoryClient: Send + Sync {
    /// Lists transactions matching `query` in `(commit_time, id)` order.
    fn list_transactions(&self, query: &TransactionQuery) -> RepositoryResult<TransactionPage>;

    /// Lists node mutations matching `query`.
    fn list_nodes(&self, query: &NodeQuery, max_results: usize)
        -> RepositoryResult<Vec<NodeMutation>>;

    /// Returns the first commit time at or after `from`, if any.
    ///
    /// Optional; the default reports the service as unsupported.
    fn next_commit_time_after(&self, _from: u64) -> RepositoryResult<Option<u64>> {
        Err(RepositoryError::Unsupported("next commit time"))
    }

    /// Returns the min and max commit times of transactions touching nodes
    /// in `[from_node, to_node)`, or `None` when no such node exists.
    ///
    /// Optional; the default reports the service as unsupported.
    fn commit_time_range(
        &self,
        _from_node: u64,
        _to_node: u64,
    ) -> RepositoryResult<Option<(u64, u64)>> {
        Err(RepositoryError::Unsupported("commit time range"))
    }
}

/// The search index the tracker writes to.
pub trait IndexServer: Send + Sync {
    /// Indexes a single node.
    fn index_node(&self, node: &NodeMutation, is_reindex: bool) -> IndexResult<()>;

    /// Indexes a batch of nodes.
    fn index_nodes(&self, nodes: &[NodeMutation], is_reindex: bool) -> IndexResult<()>;

    /// Writes the marker document for a fully applied transaction.
    fn index_transaction(&self, tx: &Transaction, is_reindex: bool) -> IndexResult<()>;

    /// Removes every document belonging to a transaction, marker included.
    fn delete_by_transaction_id(&self, tx_id: u64) -> IndexResult<()>;

    /// Removes a node document.
    fn delete_by_node_id(&self, node_id: u64) -> IndexResult<()>;

    /// Reindexes every node matched by `query`.
    fn reindex_by_query(&self, query: &str) -> IndexResult<()>;

    /// Returns true if the transaction marker is present.
    ///
    /// With `use_cache`, transactions indexed but not yet visible to
    /// searchers count as present.
    fn transaction_present(&self, tx_id: u64, use_cache: bool) -> IndexResult<bool>;

    /// Returns the newest transaction marker in the index.
    fn max_transaction_in_index(&self) -> IndexResult<Option<Transaction>>;

    /// Counts transaction markers with the given id and commit time.
    fn doc_count_for_transaction(&self, tx_id: u64, commit_time_ms: u64) -> IndexResult<u64>;

    /// Lists marker ids in `[from, to]`.
    fn indexed_transaction_ids(&self, from: u64, to: u64) -> IndexResult<Vec<u64>>;

    /// Returns the highest node id the index can hold, if capped.
    fn index_cap(&self) -> IndexResult<Option<u64>> {
        Ok(None)
    }

    /// Forgets the cache of processed-but-invisible transactions.
    fn clear_processed_transactions(&self) {}
}

/// Optional repository services, resolved once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `next_commit_time_after` is available.
    pub next_commit_time: bool,
    /// `commit_time_range` is available.
    pub commit_time_range: bool,
}

impl Capabilities {
    /// Capabilities with every optional service disabled.
    pub fn none() -> Self {
        Self::default()
    }

    /// Capabilities with every optional service enabled.
    pub fn all() -> Self {
        Self {
            next_commit_time: true,
            commit_time_range: true,
        }
    }

    /// Probes the repository for optional services.
    ///
    /// A missing service is logged and disabled; probing never fails.
    /// The commit time range service is only probed for DB id range shards.
    pub fn probe<R: RepositoryClient + ?Sized>(repo: &R, config: &TrackerConfig) -> Self {
        let mut caps = Self::none();

        if config.probe_next_commit_time {
            caps.next_commit_time = probe_service("next commit time", repo.next_commit_time_after(0));
        }
        if config.probe_commit_time_range && config.shard.method.is_db_id_range() {
            caps.commit_time_range = probe_service("commit time range", repo.commit_time_range(0, 0));
        }

        info!(
            next_commit_time = caps.next_commit_time,
            commit_time_range = caps.commit_time_range,
            "resolved repository capabilities"
        );
        caps
    }
}

fn probe_service<T>(name: &str, result: RepositoryResult<T>) -> bool {
    match result {
        Ok(_) => true,
        Err(RepositoryError::Unsupported(_)) => {
            warn!(service = name, "repository service not available; scanning full windows");
            false
        }
        Err(e) => {
            error!(service = name, error = %e, "checking repository service failed");
            false
        }
    }
}

/// Treats an unsupported index operation as absent.
pub(crate) fn optional<T>(result: IndexResult<Option<T>>) -> IndexResult<Option<T>> {
    match result {
        Err(IndexError::Unsupported(_)) => Ok(None),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardConfig;
    use crate::memory::MemoryRepository;

    #[test]
    fn probe_detects_services() {
        let repo = MemoryRepository::new();
        let config = TrackerConfig::new().with_shard(ShardConfig::db_id_range(0, 1000));
        assert_eq!(Capabilities::probe(&repo, &config), Capabilities::all());
    }

    #[test]
    fn probe_degrades_when_services_missing() {
        let repo = MemoryRepository::new().without_services();
        let config = TrackerConfig::new().with_shard(ShardConfig::db_id_range(0, 1000));
        assert_eq!(Capabilities::probe(&repo, &config), Capabilities::none());
    }

    #[test]
    fn probe_honours_toggles_and_shard_method() {
        let repo = MemoryRepository::new();
        let caps = Capabilities::probe(&repo, &TrackerConfig::new());
        assert!(caps.next_commit_time);
        assert!(!caps.commit_time_range);

        let caps = Capabilities::probe(&repo, &TrackerConfig::new().with_service_probes(false));
        assert_eq!(caps, Capabilities::none());
    }
}
