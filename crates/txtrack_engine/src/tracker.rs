//! The metadata tracker.

use crate::applier::{BatchApplier, FlushOutcome};
use crate::auditor::{AuditReport, ConsistencyAuditor};
use crate::client::{optional, Capabilities, IndexServer, RepositoryClient};
use crate::config::TrackerConfig;
use crate::coordination::{check_cancelled, IndexWriteLock, RollbackFlag};
use crate::error::{TrackError, TrackResult};
use crate::fetcher::WindowFetcher;
use crate::history::BoundedHistory;
use crate::maintenance::{MaintenanceContext, MaintenanceHandle, MaintenanceQueue, MaintenanceReport};
use crate::pool::WorkerPool;
use crate::report::{CheckIndexBounds, DbTxLookup, IndexHealthReport, NodeReport};
use crate::router::ShardRouter;
use crate::state::TrackerState;
use crate::store::StateStore;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};
use txtrack_protocol::{Cursor, NodeMutation, NodeQuery, NodeStatus, Transaction, TransactionQuery};

/// Source of the current wall-clock time in milliseconds.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

fn system_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Statistics about tracking.
#[derive(Debug, Clone, Default)]
pub struct TrackerStats {
    /// Cycles completed successfully.
    pub cycles_completed: u64,
    /// Cycles that ended in an error.
    pub cycles_failed: u64,
    /// Transactions whose markers were written.
    pub transactions_indexed: u64,
    /// Update and delete units of those transactions.
    pub transaction_changes: u64,
    /// Node mutations sent to the index.
    pub nodes_indexed: u64,
    /// Maintenance actions carried out.
    pub maintenance_actions: u64,
    /// Time spent applying node batches.
    pub node_time: Duration,
    /// When the last successful cycle finished.
    pub last_cycle: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// What one cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Cycle number, starting at 0.
    pub cycle: u64,
    /// Consistency audit outcome, if the audit ran.
    pub audit: Option<AuditReport>,
    /// Maintenance work done.
    pub maintenance: MaintenanceReport,
    /// Transaction windows fetched.
    pub windows: u64,
    /// Transactions applied.
    pub transactions_indexed: u64,
    /// Node mutations applied.
    pub nodes_indexed: u64,
    /// The cycle stopped at a transaction younger than the lag.
    pub up_to_date: bool,
    /// Cursor at the end of the cycle.
    pub cursor: Cursor,
    /// Wall time of the cycle.
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct TrackOutcome {
    windows: u64,
    transactions: u64,
    changes: u64,
    nodes: u64,
    up_to_date: bool,
}

impl TrackOutcome {
    fn add(&mut self, flush: &FlushOutcome) {
        self.transactions += flush.transactions;
        self.changes += flush.changes;
        self.nodes += flush.nodes;
    }
}

/// Keeps an index in step with a transactional repository.
///
/// Each call to [`run_cycle`](Self::run_cycle) audits (on the first cycle),
/// drains maintenance requests, then applies every new transaction in
/// commit order. The cursor is saved after each flushed batch and never
/// moves past a transaction whose nodes have not all been applied.
pub struct Tracker<R, I, S>
where
    R: RepositoryClient + 'static,
    I: IndexServer + 'static,
    S: StateStore,
{
    config: TrackerConfig,
    caps: Capabilities,
    repo: Arc<R>,
    index: Arc<I>,
    store: S,
    applier: BatchApplier<I>,
    fetcher: WindowFetcher,
    auditor: ConsistencyAuditor,
    router: RwLock<ShardRouter>,
    maintenance: MaintenanceQueue,
    state: RwLock<Option<TrackerState>>,
    stats: RwLock<TrackerStats>,
    halted: RwLock<Option<String>>,
    cycle_guard: Mutex<()>,
    write_lock: IndexWriteLock,
    rollback: RollbackFlag,
    clock: Clock,
}

impl<R, I, S> Tracker<R, I, S>
where
    R: RepositoryClient + 'static,
    I: IndexServer + 'static,
    S: StateStore,
{
    /// Creates a tracker, probing the repository for optional services.
    pub fn new(config: TrackerConfig, repo: Arc<R>, index: Arc<I>, store: S) -> TrackResult<Self> {
        let caps = Capabilities::probe(repo.as_ref(), &config);
        Self::with_capabilities(config, caps, repo, index, store)
    }

    /// Creates a tracker with capabilities resolved by the caller.
    pub fn with_capabilities(
        config: TrackerConfig,
        caps: Capabilities,
        repo: Arc<R>,
        index: Arc<I>,
        store: S,
    ) -> TrackResult<Self> {
        config.validate()?;

        let write_lock = IndexWriteLock::new();
        let rollback = RollbackFlag::new();
        let pool = WorkerPool::new(config.worker_threads, rollback.clone())?;
        let applier = BatchApplier::new(&config, Arc::clone(&index), pool, write_lock.clone());

        Ok(Self {
            fetcher: WindowFetcher::new(&config, caps),
            auditor: ConsistencyAuditor::new(&config, caps),
            router: RwLock::new(ShardRouter::new(config.shard.clone(), config.cascade_enabled)),
            maintenance: MaintenanceQueue::new(),
            state: RwLock::new(None),
            stats: RwLock::new(TrackerStats::default()),
            halted: RwLock::new(None),
            cycle_guard: Mutex::new(()),
            clock: Arc::new(system_clock),
            config,
            caps,
            repo,
            index,
            store,
            applier,
            write_lock,
            rollback,
        })
    }

    /// Replaces the wall clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Returns the resolved repository capabilities.
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Returns the current state, or `None` if it will be reloaded.
    pub fn state(&self) -> Option<TrackerState> {
        *self.state.read()
    }

    /// Returns the current stats.
    pub fn stats(&self) -> TrackerStats {
        self.stats.read().clone()
    }

    /// Returns the lock shared with the commit component.
    pub fn write_lock(&self) -> IndexWriteLock {
        self.write_lock.clone()
    }

    /// Returns the rollback flag shared with the commit component.
    pub fn rollback_flag(&self) -> RollbackFlag {
        self.rollback.clone()
    }

    /// Returns a handle for queueing maintenance requests.
    pub fn maintenance_handle(&self) -> MaintenanceHandle {
        self.maintenance.handle()
    }

    /// Returns true if maintenance requests are waiting.
    pub fn has_maintenance(&self) -> bool {
        self.maintenance.has_maintenance()
    }

    /// Returns the reason the tracker halted, if it did.
    pub fn halted_reason(&self) -> Option<String> {
        self.halted.read().clone()
    }

    /// Lets a halted tracker run again and forces a fresh audit.
    pub fn reset_halt(&self) {
        if let Some(reason) = self.halted.write().take() {
            info!(%reason, "tracker halt cleared");
        }
        *self.state.write() = None;
    }

    /// Discards in-memory progress after an index rollback.
    ///
    /// The next cycle reloads the cursor from the state store. Pending
    /// maintenance is dropped and the index forgets transactions it has
    /// processed but not yet made visible.
    pub fn invalidate_state(&self) {
        info!("invalidating tracker state");
        *self.state.write() = None;
        self.maintenance.clear();
        self.index.clear_processed_transactions();
    }

    /// Runs one tracking cycle.
    ///
    /// Fails with [`TrackError::CycleInProgress`] if another cycle is
    /// running, and with [`TrackError::Halted`] after a consistency failure
    /// until [`reset_halt`](Self::reset_halt) is called.
    pub fn run_cycle(&self, cancel: &CancellationToken) -> TrackResult<CycleReport> {
        let _cycle = self.cycle_guard.try_lock().ok_or(TrackError::CycleInProgress)?;

        if let Some(reason) = self.halted_reason() {
            return Err(TrackError::Halted { reason });
        }

        let cycle = self.state().map_or(0, |s| s.cycle_count);
        let span = info_span!("cycle", n = cycle);
        let _enter = span.enter();
        let started = Instant::now();

        match self.cycle(cancel, started) {
            Ok(report) => {
                let mut stats = self.stats.write();
                stats.cycles_completed += 1;
                stats.maintenance_actions += report.maintenance.total();
                stats.last_cycle = Some(Instant::now());
                stats.last_error = None;
                info!(
                    transactions = report.transactions_indexed,
                    nodes = report.nodes_indexed,
                    windows = report.windows,
                    tx_id = report.cursor.tx_id,
                    commit_time_ms = report.cursor.commit_time_ms,
                    "cycle complete"
                );
                Ok(report)
            }
            Err(e) => {
                if let TrackError::Consistency(ref inner) = e {
                    error!(error = %inner, "halting tracker");
                    *self.halted.write() = Some(inner.to_string());
                } else if matches!(e, TrackError::Cancelled) {
                    info!("cycle cancelled");
                } else {
                    warn!(error = %e, retryable = e.is_retryable(), "cycle failed");
                }
                let mut stats = self.stats.write();
                stats.cycles_failed += 1;
                stats.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn cycle(&self, cancel: &CancellationToken, started: Instant) -> TrackResult<CycleReport> {
        check_cancelled(cancel)?;

        if self.rollback.clear() {
            info!("index was rolled back; reloading state");
            *self.state.write() = None;
            self.index.clear_processed_transactions();
        }

        let state = match self.state() {
            Some(state) => state,
            None => self.load_state()?,
        };
        let mut state = state.continue_cycle((self.clock)(), &self.config);
        *self.state.write() = Some(state);

        let mut audit = None;
        // An empty index is audited again so the first transaction to arrive seeds the scan start.
        if state.cycle_count == 0 || state.cursor().is_origin() {
            let range = self.router.read().range();
            let (audited, report) =
                self.auditor
                    .audit(self.repo.as_ref(), self.index.as_ref(), range, state)?;
            state = audited;
            audit = Some(report);
            *self.state.write() = Some(state);
        }

        self.expand_shard_range()?;

        let maintenance = {
            let router = self.router.read().clone();
            let ctx = MaintenanceContext {
                repo: self.repo.as_ref(),
                index: self.index.as_ref(),
                router: &router,
                store: &self.config.store,
            };
            self.maintenance.process(&ctx, cancel)?
        };

        let (state, outcome) =
            self.track_transactions(state, &maintenance.purged_transaction_ids, cancel)?;
        let state = state.next_cycle();
        *self.state.write() = Some(state);

        Ok(CycleReport {
            cycle: state.cycle_count - 1,
            audit,
            maintenance,
            windows: outcome.windows,
            transactions_indexed: outcome.transactions,
            nodes_indexed: outcome.nodes,
            up_to_date: outcome.up_to_date,
            cursor: state.cursor(),
            duration: started.elapsed(),
        })
    }

    /// Rebuilds the state from the store, falling back to the index.
    fn load_state(&self) -> TrackResult<TrackerState> {
        if let Some(cursor) = self.store.load()? {
            debug!(tx_id = cursor.tx_id, commit_time_ms = cursor.commit_time_ms, "loaded cursor");
            return Ok(TrackerState::from_cursor(cursor));
        }
        match optional(self.index.max_transaction_in_index())? {
            Some(tx) => {
                debug!(tx_id = tx.id, "no stored cursor; resuming from newest marker in index");
                Ok(TrackerState::from_cursor(Cursor::at(&tx)))
            }
            None => Ok(TrackerState::default()),
        }
    }

    fn expand_shard_range(&self) -> TrackResult<()> {
        if self.router.read().range().is_none() {
            return Ok(());
        }
        if let Some(cap) = self.index.index_cap()? {
            self.router.write().expand_to(cap);
        }
        Ok(())
    }

    /// Walks new transactions from the state's fetch start.
    ///
    /// Transactions in `purged` were removed by maintenance this cycle and
    /// are only recorded in history.
    fn track_transactions(
        &self,
        state: TrackerState,
        purged: &BTreeSet<u64>,
        cancel: &CancellationToken,
    ) -> TrackResult<(TrackerState, TrackOutcome)> {
        let router = self.router.read().clone();
        let shard_range = router.range();
        let mut state = state;
        let mut history = BoundedHistory::new(self.config.history_capacity);
        let mut outcome = TrackOutcome::default();
        let mut previous_last: Option<Transaction> = None;

        loop {
            check_cancelled(cancel)?;
            if self.rollback.is_set() {
                return Err(TrackError::RolledBack);
            }

            let from = history.next_start(state.fetch_start());
            let page = self.fetcher.fetch_for_shard(
                self.repo.as_ref(),
                shard_range,
                from,
                state.time_to_stop_indexing,
                &history,
                cancel,
            )?;
            outcome.windows += 1;
            state = state.with_server_maxima(&page);

            let (Some(first), Some(last)) = (page.first(), page.last()) else {
                debug!(from, "no transactions found");
                break;
            };
            if previous_last.as_ref() == Some(last) {
                debug!(tx_id = last.id, "no new transactions");
                break;
            }
            previous_last = Some(*last);
            debug!(first = first.id, last = last.id, count = page.len(), "scanning transactions");

            let mut batch = Vec::new();
            for tx in &page.transactions {
                check_cancelled(cancel)?;

                if purged.contains(&tx.id) {
                    debug!(tx_id = tx.id, "skipping transaction purged this cycle");
                    history.push(*tx);
                    continue;
                }
                if state.covers(tx) && self.index.transaction_present(tx.id, true)? {
                    history.push(*tx);
                    continue;
                }
                if tx.commit_time_ms > state.time_to_stop_indexing {
                    outcome.up_to_date = true;
                    break;
                }

                batch.push(*tx);
                if self.applier.should_flush(&batch) {
                    state = self.flush(&router, &batch, state, &mut history, &mut outcome, cancel)?;
                    batch.clear();
                }
            }
            if !batch.is_empty() {
                state = self.flush(&router, &batch, state, &mut history, &mut outcome, cancel)?;
            }

            if outcome.up_to_date {
                break;
            }
        }

        Ok((state, outcome))
    }

    fn flush(
        &self,
        router: &ShardRouter,
        batch: &[Transaction],
        state: TrackerState,
        history: &mut BoundedHistory,
        outcome: &mut TrackOutcome,
        cancel: &CancellationToken,
    ) -> TrackResult<TrackerState> {
        let (state, flushed) = self
            .applier
            .flush(self.repo.as_ref(), router, batch, state, cancel)?;
        self.store.save(&state.cursor())?;
        *self.state.write() = Some(state);

        for tx in batch {
            history.push(*tx);
        }
        outcome.add(&flushed);
        {
            let mut stats = self.stats.write();
            stats.transactions_indexed += flushed.transactions;
            stats.transaction_changes += flushed.changes;
            stats.nodes_indexed += flushed.nodes;
            stats.node_time += flushed.node_elapsed;
        }
        debug!(
            transactions = flushed.transactions,
            nodes = flushed.nodes,
            tx_id = state.last_indexed_tx_id,
            "batch flushed"
        );
        Ok(state)
    }

    /// Looks a node up in the repository.
    pub fn check_node(&self, node_id: u64) -> NodeReport {
        match self.repo.list_nodes(&NodeQuery::for_node(node_id), 1) {
            Ok(nodes) => match nodes.first() {
                Some(node) => NodeReport {
                    node_id,
                    db_status: node.status,
                    db_tx: DbTxLookup::Found(node.txn_id),
                },
                None => NodeReport {
                    node_id,
                    db_status: NodeStatus::Unknown,
                    db_tx: DbTxLookup::Missing,
                },
            },
            Err(e) => NodeReport {
                node_id,
                db_status: NodeStatus::Unknown,
                db_tx: DbTxLookup::Failed(e.to_string()),
            },
        }
    }

    /// Returns every node mutation of a transaction.
    pub fn full_nodes_for_transaction(&self, tx_id: u64) -> TrackResult<Vec<NodeMutation>> {
        let query = NodeQuery::for_transactions(vec![tx_id], self.config.store.clone());
        Ok(self.repo.list_nodes(&query, usize::MAX)?)
    }

    /// Compares repository transactions with the markers in the index.
    pub fn check_index(
        &self,
        bounds: CheckIndexBounds,
        cancel: &CancellationToken,
    ) -> TrackResult<IndexHealthReport> {
        let range = &self.config.initial_tx_range;
        let first = self
            .repo
            .list_transactions(&TransactionQuery::id_range(range.start, range.end, 1))?;
        let mut from = bounds
            .from_time
            .unwrap_or_else(|| first.first().map_or(0, |t| t.commit_time_ms));
        let end_time = (self.clock)().saturating_add(self.config.hole_retention_ms());

        let mut history = BoundedHistory::new(self.config.history_capacity);
        let mut db_ids = BTreeSet::new();

        'walk: loop {
            let page = self
                .fetcher
                .fetch(self.repo.as_ref(), from, end_time, &history, cancel)?;
            let mut progressed = false;
            for tx in &page.transactions {
                if bounds.to_time.is_some_and(|t| tx.commit_time_ms > t)
                    || bounds.to_tx.is_some_and(|id| tx.id > id)
                {
                    break 'walk;
                }
                progressed |= db_ids.insert(tx.id);
                from = tx.commit_time_ms;
                history.push(*tx);
            }
            if !progressed {
                break;
            }
        }

        let indexed = match (db_ids.first(), db_ids.last()) {
            (Some(&lo), Some(&hi)) => self.index.indexed_transaction_ids(lo, hi)?,
            _ => Vec::new(),
        };
        let report = IndexHealthReport::compare(&db_ids, indexed);
        info!(
            db_transactions = report.db_transaction_count,
            missing = report.missing_from_index.len(),
            unknown = report.unknown_in_index.len(),
            "index check complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryIndex, MemoryRepository};
    use crate::store::MemoryStateStore;

    type MemoryTracker = Tracker<MemoryRepository, MemoryIndex, MemoryStateStore>;

    fn tracker(repo: MemoryRepository) -> (MemoryTracker, Arc<MemoryIndex>) {
        let index = Arc::new(MemoryIndex::new());
        let tracker = Tracker::new(
            TrackerConfig::new().with_worker_threads(2),
            Arc::new(repo),
            Arc::clone(&index),
            MemoryStateStore::new(),
        )
        .unwrap();
        (tracker, index)
    }

    fn two_transactions() -> MemoryRepository {
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

    #[test]
    fn first_cycle_indexes_everything() {
        let (tracker, index) = tracker(two_transactions());
        let report = tracker.run_cycle(&CancellationToken::new()).unwrap();

        assert_eq!(report.cycle, 0);
        assert!(report.audit.is_some());
        assert_eq!(report.transactions_indexed, 2);
        assert_eq!(report.nodes_indexed, 3);
        assert_eq!(report.cursor, Cursor::new(200, 2));
        assert_eq!(index.marker_ids(), vec![1, 2]);
        assert_eq!(index.node_count(), 3);

        let stats = tracker.stats();
        assert_eq!(stats.cycles_completed, 1);
        assert_eq!(stats.transactions_indexed, 2);
    }

    #[test]
    fn second_cycle_skips_indexed_transactions() {
        let (tracker, index) = tracker(two_transactions());
        let cancel = CancellationToken::new();
        tracker.run_cycle(&cancel).unwrap();
        let batches = index.batches_applied();

        let report = tracker.run_cycle(&cancel).unwrap();
        assert!(report.audit.is_none());
        assert_eq!(report.transactions_indexed, 0);
        assert_eq!(index.batches_applied(), batches);
        assert_eq!(tracker.state().map(|s| s.cycle_count), Some(2));
    }

    #[test]
    fn cancelled_cycle_does_nothing() {
        let (tracker, index) = tracker(two_transactions());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(tracker.run_cycle(&cancel), Err(TrackError::Cancelled)));
        assert!(index.marker_ids().is_empty());
        assert_eq!(tracker.stats().cycles_failed, 1);
    }

    #[test]
    fn overlapping_cycle_is_refused() {
        let (tracker, _) = tracker(two_transactions());
        let _held = tracker.cycle_guard.lock();
        assert!(matches!(
            tracker.run_cycle(&CancellationToken::new()),
            Err(TrackError::CycleInProgress)
        ));
    }

    #[test]
    fn check_node_reports_lookup() {
        let (tracker, _) = tracker(two_transactions());

        let found = tracker.check_node(20);
        assert_eq!(found.db_tx, DbTxLookup::Found(2));
        assert_eq!(found.db_status, NodeStatus::Updated);
        assert_eq!(tracker.check_node(999).db_tx, DbTxLookup::Missing);

        tracker.repo.set_available(false);
        assert!(matches!(tracker.check_node(20).db_tx, DbTxLookup::Failed(_)));
    }

    #[test]
    fn full_nodes_for_transaction_lists_all() {
        let (tracker, _) = tracker(two_transactions());
        let nodes = tracker.full_nodes_for_transaction(2).unwrap();
        assert_eq!(nodes.iter().map(|n| n.id).collect::<Vec<_>>(), vec![20, 21]);
    }

    #[test]
    fn check_index_reports_gaps() {
        let (tracker, index) = tracker(two_transactions());
        let cancel = CancellationToken::new();
        index.index_transaction(&Transaction::new(1, 100, 1, 0), false).unwrap();
        index.add_raw_marker(Transaction::new(3, 150, 0, 0));

        let report = tracker.check_index(CheckIndexBounds::default(), &cancel).unwrap();
        assert_eq!(report.db_transaction_count, 2);
        assert_eq!(report.missing_from_index, vec![2]);
        assert_eq!(report.unknown_in_index, Vec::<u64>::new());
    }

    #[test]
    fn invalidate_state_forces_reload() {
        let (tracker, _) = tracker(two_transactions());
        tracker.run_cycle(&CancellationToken::new()).unwrap();
        tracker.maintenance_handle().reindex_node(10);

        tracker.invalidate_state();
        assert!(tracker.state().is_none());
        assert!(!tracker.has_maintenance());

        let report = tracker.run_cycle(&CancellationToken::new()).unwrap();
        assert_eq!(report.cycle, 0);
        assert_eq!(report.cursor, Cursor::new(200, 2));
    }
}
