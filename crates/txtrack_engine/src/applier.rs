//! Batch application of transactions to the index.

use crate::client::{IndexServer, RepositoryClient};
use crate::config::TrackerConfig;
use crate::coordination::{check_cancelled, IndexWriteLock};
use crate::error::TrackResult;
use crate::pool::WorkerPool;
use crate::router::ShardRouter;
use crate::state::TrackerState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use txtrack_protocol::{NodeMutation, NodeQuery, StoreRef, Transaction};

/// What a flush applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushOutcome {
    /// Transactions whose markers were written.
    pub transactions: u64,
    /// Node mutations sent to the index.
    pub nodes: u64,
    /// Summed update and delete counts of the flushed transactions.
    pub changes: u64,
    /// Time spent applying nodes.
    pub node_elapsed: Duration,
}

/// Applies working batches of transactions.
///
/// Node mutations go to the worker pool first. Transaction markers are only
/// written, and the cursor only moved, after every node sub-batch of the
/// flush has completed.
pub struct BatchApplier<I: IndexServer + 'static> {
    index: Arc<I>,
    pool: WorkerPool,
    write_lock: IndexWriteLock,
    node_batch_size: usize,
    batch_threshold: u64,
    store: StoreRef,
}

impl<I: IndexServer + 'static> BatchApplier<I> {
    /// Creates an applier.
    pub fn new(
        config: &TrackerConfig,
        index: Arc<I>,
        pool: WorkerPool,
        write_lock: IndexWriteLock,
    ) -> Self {
        Self {
            index,
            pool,
            write_lock,
            node_batch_size: config.node_batch_size.max(1),
            batch_threshold: config.batch_threshold,
            store: config.store.clone(),
        }
    }

    /// Returns true once `batch` holds more changes than the threshold.
    pub fn should_flush(&self, batch: &[Transaction]) -> bool {
        change_count(batch) > self.batch_threshold
    }

    /// Fetches, routes and applies the node mutations of `txs`.
    ///
    /// Blocks until every sub-batch has completed.
    pub fn apply_nodes<R>(
        &self,
        repo: &R,
        router: &ShardRouter,
        txs: &[Transaction],
        cancel: &CancellationToken,
    ) -> TrackResult<u64>
    where
        R: RepositoryClient + ?Sized,
    {
        let ids: Vec<u64> = txs.iter().filter(|t| t.has_changes()).map(|t| t.id).collect();
        if ids.is_empty() {
            return Ok(0);
        }
        check_cancelled(cancel)?;

        let query = NodeQuery::for_transactions(ids, self.store.clone())
            .with_shard_property(router.config().shard_property.clone());
        let nodes = router.route_all(repo.list_nodes(&query, usize::MAX)?);
        let count = nodes.len() as u64;
        debug!(transactions = txs.len(), nodes = count, "applying node batch");

        self.pool.run_all(self.sub_batches(nodes), cancel)?;
        Ok(count)
    }

    fn sub_batches(
        &self,
        nodes: Vec<NodeMutation>,
    ) -> Vec<impl FnOnce() -> crate::error::IndexResult<()> + Send + 'static> {
        nodes
            .chunks(self.node_batch_size)
            .map(|chunk| {
                let index = Arc::clone(&self.index);
                let chunk = chunk.to_vec();
                move || index.index_nodes(&chunk, true)
            })
            .collect()
    }

    /// Writes markers for `txs` and folds them into the cursor.
    ///
    /// Runs under the index write lock.
    pub fn commit_markers(
        &self,
        txs: &[Transaction],
        state: TrackerState,
    ) -> TrackResult<TrackerState> {
        let _guard = self.write_lock.lock();
        let mut state = state;
        for tx in txs {
            self.index.index_transaction(tx, true)?;
            state = state.with_indexed(tx);
        }
        Ok(state)
    }

    /// Applies a working batch end to end.
    pub fn flush<R>(
        &self,
        repo: &R,
        router: &ShardRouter,
        txs: &[Transaction],
        state: TrackerState,
        cancel: &CancellationToken,
    ) -> TrackResult<(TrackerState, FlushOutcome)>
    where
        R: RepositoryClient + ?Sized,
    {
        if txs.is_empty() {
            return Ok((state, FlushOutcome::default()));
        }

        let started = Instant::now();
        let nodes = self.apply_nodes(repo, router, txs, cancel)?;
        let node_elapsed = started.elapsed();

        check_cancelled(cancel)?;
        let state = self.commit_markers(txs, state)?;

        Ok((
            state,
            FlushOutcome {
                transactions: txs.len() as u64,
                nodes,
                changes: change_count(txs),
                node_elapsed,
            },
        ))
    }
}

fn change_count(txs: &[Transaction]) -> u64 {
    txs.iter().map(Transaction::change_count).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardConfig;
    use crate::coordination::RollbackFlag;
    use crate::error::TrackError;
    use crate::memory::{MemoryIndex, MemoryRepository};
    use txtrack_protocol::{Cursor, NodeStatus};

    fn setup(config: &TrackerConfig) -> (Arc<MemoryIndex>, BatchApplier<MemoryIndex>, RollbackFlag) {
        let index = Arc::new(MemoryIndex::new());
        let rollback = RollbackFlag::new();
        let pool = WorkerPool::new(2, rollback.clone()).unwrap();
        let applier = BatchApplier::new(config, Arc::clone(&index), pool, IndexWriteLock::new());
        (index, applier, rollback)
    }

    fn repo() -> MemoryRepository {
        let repo = MemoryRepository::new();
        repo.add_transaction(
            Transaction::new(1, 100, 1, 0),
            vec![NodeMutation::updated(10, 1, 1, "a")],
        );
        repo.add_transaction(
            Transaction::new(2, 200, 2, 1),
            vec![
                NodeMutation::updated(20, 2, 1, "b"),
                NodeMutation::updated(21, 2, 1, "c"),
                NodeMutation::deleted(10, 2, 1, "a"),
            ],
        );
        repo
    }

    #[test]
    fn flush_applies_nodes_then_markers() {
        let config = TrackerConfig::new().with_node_batch_size(1);
        let (index, applier, _) = setup(&config);
        let repo = repo();
        let router = ShardRouter::new(ShardConfig::unsharded(), true);

        let txs = repo.transactions();
        let (state, outcome) = applier
            .flush(&repo, &router, &txs, TrackerState::default(), &CancellationToken::new())
            .unwrap();

        assert_eq!(state.cursor(), Cursor::new(200, 2));
        assert_eq!(outcome.transactions, 2);
        assert_eq!(outcome.nodes, 4);
        assert_eq!(outcome.changes, 4);
        assert_eq!(index.marker_ids(), vec![1, 2]);
        assert_eq!(index.batches_applied(), 4);
    }

    #[test]
    fn failure_leaves_cursor_and_markers_untouched() {
        let (index, applier, rollback) = setup(&TrackerConfig::new());
        index.reject_node(21);
        let repo = repo();
        let router = ShardRouter::new(ShardConfig::unsharded(), true);

        let err = applier
            .flush(
                &repo,
                &router,
                &repo.transactions(),
                TrackerState::default(),
                &CancellationToken::new(),
            )
            .unwrap_err();

        assert!(matches!(err, TrackError::WorkerFailure { .. }));
        assert!(rollback.is_set());
        assert!(index.marker_ids().is_empty());
    }

    #[test]
    fn routes_non_owned_nodes() {
        let (index, applier, _) = setup(&TrackerConfig::new());
        let repo = repo();
        let router = ShardRouter::new(ShardConfig::db_id_range(0, 20), true);

        applier
            .apply_nodes(&repo, &router, &repo.transactions()[..1], &CancellationToken::new())
            .unwrap();
        assert_eq!(index.node(10).map(|n| n.status), Some(NodeStatus::Updated));

        let tx2 = [Transaction::new(2, 200, 2, 1)];
        applier
            .apply_nodes(&repo, &router, &tx2, &CancellationToken::new())
            .unwrap();
        assert_eq!(index.node(20).map(|n| n.status), Some(NodeStatus::NonShardUpdated));
    }

    #[test]
    fn threshold_is_exclusive() {
        let config = TrackerConfig::new().with_batch_threshold(3);
        let (_, applier, _) = setup(&config);
        assert!(!applier.should_flush(&[Transaction::new(1, 1, 2, 1)]));
        assert!(applier.should_flush(&[Transaction::new(1, 1, 2, 2)]));
    }

    #[test]
    fn empty_transactions_only_write_markers() {
        let (index, applier, _) = setup(&TrackerConfig::new());
        let repo = MemoryRepository::new();
        let router = ShardRouter::new(ShardConfig::unsharded(), true);

        let (state, outcome) = applier
            .flush(
                &repo,
                &router,
                &[Transaction::marker(7, 700)],
                TrackerState::default(),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(outcome.nodes, 0);
        assert_eq!(state.cursor(), Cursor::new(700, 7));
        assert!(index.has_marker(7));
    }
}
