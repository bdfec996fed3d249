//! In-memory repository and index for testing and replay.

use crate::client::{IndexServer, RepositoryClient};
use crate::error::{IndexError, IndexResult, RepositoryError, RepositoryResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use txtrack_protocol::{
    NodeMutation, NodeQuery, Transaction, TransactionPage, TransactionQuery,
};

/// An in-memory repository.
///
/// Transactions are kept in `(commit_time, id)` order. Optional services
/// can be switched off to exercise the degraded scanning paths.
pub struct MemoryRepository {
    transactions: RwLock<Vec<Transaction>>,
    nodes: RwLock<Vec<NodeMutation>>,
    services: bool,
    available: AtomicBool,
    transaction_queries: AtomicU64,
}

impl MemoryRepository {
    /// Creates an empty repository with every optional service.
    pub fn new() -> Self {
        Self {
            transactions: RwLock::new(Vec::new()),
            nodes: RwLock::new(Vec::new()),
            services: true,
            available: AtomicBool::new(true),
            transaction_queries: AtomicU64::new(0),
        }
    }

    /// Disables the optional services.
    pub fn without_services(mut self) -> Self {
        self.services = false;
        self
    }

    /// Adds a transaction and its node mutations.
    pub fn add_transaction(&self, tx: Transaction, nodes: Vec<NodeMutation>) {
        let mut txs = self.transactions.write();
        let pos = txs.partition_point(|t| t < &tx);
        txs.insert(pos, tx);
        self.nodes.write().extend(nodes);
    }

    /// Removes a transaction and its nodes.
    pub fn remove_transaction(&self, tx_id: u64) {
        self.transactions.write().retain(|t| t.id != tx_id);
        self.nodes.write().retain(|n| n.txn_id != tx_id);
    }

    /// Simulates the repository going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns how many times transactions were listed.
    pub fn transaction_queries(&self) -> u64 {
        self.transaction_queries.load(Ordering::SeqCst)
    }

    /// Returns all transactions.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions.read().clone()
    }

    fn check_available(&self) -> RepositoryResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RepositoryError::unavailable("repository offline"))
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl RepositoryClient for MemoryRepository {
    fn list_transactions(&self, query: &TransactionQuery) -> RepositoryResult<TransactionPage> {
        self.check_available()?;
        self.transaction_queries.fetch_add(1, Ordering::SeqCst);

        let txs = self.transactions.read();
        let max_commit_time = txs.iter().map(|t| t.commit_time_ms).max();
        let max_tx_id = txs.iter().map(|t| t.id).max();
        let found = txs
            .iter()
            .filter(|t| query.matches(t))
            .take(query.max_results)
            .copied()
            .collect();

        Ok(TransactionPage::new(found, max_commit_time, max_tx_id))
    }

    fn list_nodes(
        &self,
        query: &NodeQuery,
        max_results: usize,
    ) -> RepositoryResult<Vec<NodeMutation>> {
        self.check_available()?;
        Ok(self
            .nodes
            .read()
            .iter()
            .filter(|n| query.matches(n))
            .take(max_results)
            .cloned()
            .collect())
    }

    fn next_commit_time_after(&self, from: u64) -> RepositoryResult<Option<u64>> {
        if !self.services {
            return Err(RepositoryError::Unsupported("next commit time"));
        }
        self.check_available()?;
        Ok(self
            .transactions
            .read()
            .iter()
            .map(|t| t.commit_time_ms)
            .find(|&t| t >= from))
    }

    fn commit_time_range(
        &self,
        from_node: u64,
        to_node: u64,
    ) -> RepositoryResult<Option<(u64, u64)>> {
        if !self.services {
            return Err(RepositoryError::Unsupported("commit time range"));
        }
        self.check_available()?;

        let tx_ids: HashSet<u64> = self
            .nodes
            .read()
            .iter()
            .filter(|n| n.id >= from_node && n.id < to_node)
            .map(|n| n.txn_id)
            .collect();
        let txs = self.transactions.read();
        let times = txs
            .iter()
            .filter(|t| tx_ids.contains(&t.id))
            .map(|t| t.commit_time_ms);
        let min = times.clone().min();
        let max = times.max();
        Ok(min.zip(max))
    }
}

/// A point-in-time copy of the index contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSnapshot {
    /// Node documents by node id.
    pub nodes: BTreeMap<u64, NodeMutation>,
    /// Transaction markers by transaction id.
    pub markers: BTreeMap<u64, Vec<Transaction>>,
}

/// An in-memory search index.
///
/// Node documents are keyed by node id; applying a delete removes the
/// document. Transaction markers are keyed by transaction id.
pub struct MemoryIndex {
    nodes: RwLock<BTreeMap<u64, NodeMutation>>,
    markers: RwLock<BTreeMap<u64, Vec<Transaction>>>,
    processed: RwLock<HashSet<u64>>,
    queries: RwLock<Vec<String>>,
    rejected_nodes: RwLock<BTreeSet<u64>>,
    index_cap: RwLock<Option<u64>>,
    available: AtomicBool,
    batches_applied: AtomicU64,
}

impl MemoryIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            markers: RwLock::new(BTreeMap::new()),
            processed: RwLock::new(HashSet::new()),
            queries: RwLock::new(Vec::new()),
            rejected_nodes: RwLock::new(BTreeSet::new()),
            index_cap: RwLock::new(None),
            available: AtomicBool::new(true),
            batches_applied: AtomicU64::new(0),
        }
    }

    /// Makes batches containing `node_id` fail.
    pub fn reject_node(&self, node_id: u64) {
        self.rejected_nodes.write().insert(node_id);
    }

    /// Stops rejecting every node.
    pub fn accept_all(&self) {
        self.rejected_nodes.write().clear();
    }

    /// Simulates the index going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Sets the reported index cap.
    pub fn set_index_cap(&self, cap: Option<u64>) {
        *self.index_cap.write() = cap;
    }

    /// Adds a marker without replacing existing ones for the same id.
    pub fn add_raw_marker(&self, tx: Transaction) {
        self.markers.write().entry(tx.id).or_default().push(tx);
    }

    /// Returns the node document for `node_id`.
    pub fn node(&self, node_id: u64) -> Option<NodeMutation> {
        self.nodes.read().get(&node_id).cloned()
    }

    /// Returns the number of node documents.
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Returns true if a marker exists for `tx_id`.
    pub fn has_marker(&self, tx_id: u64) -> bool {
        self.markers.read().contains_key(&tx_id)
    }

    /// Returns the ids of every transaction marker.
    pub fn marker_ids(&self) -> Vec<u64> {
        self.markers.read().keys().copied().collect()
    }

    /// Returns the reindex queries received.
    pub fn reindexed_queries(&self) -> Vec<String> {
        self.queries.read().clone()
    }

    /// Returns how many node batches were applied.
    pub fn batches_applied(&self) -> u64 {
        self.batches_applied.load(Ordering::SeqCst)
    }

    /// Returns a copy of the index contents.
    pub fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            nodes: self.nodes.read().clone(),
            markers: self.markers.read().clone(),
        }
    }

    fn check_available(&self) -> IndexResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(IndexError::unavailable("index offline"))
        }
    }

    fn apply(&self, node: &NodeMutation) {
        let mut nodes = self.nodes.write();
        if node.status.is_removal() {
            nodes.remove(&node.id);
        } else {
            nodes.insert(node.id, node.clone());
        }
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexServer for MemoryIndex {
    fn index_node(&self, node: &NodeMutation, _is_reindex: bool) -> IndexResult<()> {
        self.check_available()?;
        if self.rejected_nodes.read().contains(&node.id) {
            return Err(IndexError::Rejected {
                node_id: node.id,
                reason: "rejected by test index".into(),
            });
        }
        self.apply(node);
        Ok(())
    }

    fn index_nodes(&self, nodes: &[NodeMutation], _is_reindex: bool) -> IndexResult<()> {
        self.check_available()?;
        {
            let rejected = self.rejected_nodes.read();
            if let Some(node) = nodes.iter().find(|n| rejected.contains(&n.id)) {
                return Err(IndexError::Rejected {
                    node_id: node.id,
                    reason: "rejected by test index".into(),
                });
            }
        }
        for node in nodes {
            self.apply(node);
        }
        self.batches_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn index_transaction(&self, tx: &Transaction, _is_reindex: bool) -> IndexResult<()> {
        self.check_available()?;
        self.markers.write().insert(tx.id, vec![*tx]);
        self.processed.write().insert(tx.id);
        Ok(())
    }

    fn delete_by_transaction_id(&self, tx_id: u64) -> IndexResult<()> {
        self.check_available()?;
        self.markers.write().remove(&tx_id);
        self.processed.write().remove(&tx_id);
        self.nodes.write().retain(|_, n| n.txn_id != tx_id);
        Ok(())
    }

    fn delete_by_node_id(&self, node_id: u64) -> IndexResult<()> {
        self.check_available()?;
        self.nodes.write().remove(&node_id);
        Ok(())
    }

    fn reindex_by_query(&self, query: &str) -> IndexResult<()> {
        self.check_available()?;
        self.queries.write().push(query.to_string());
        Ok(())
    }

    fn transaction_present(&self, tx_id: u64, use_cache: bool) -> IndexResult<bool> {
        self.check_available()?;
        if use_cache && self.processed.read().contains(&tx_id) {
            return Ok(true);
        }
        Ok(self.markers.read().contains_key(&tx_id))
    }

    fn max_transaction_in_index(&self) -> IndexResult<Option<Transaction>> {
        self.check_available()?;
        Ok(self.markers.read().values().flatten().max().copied())
    }

    fn doc_count_for_transaction(&self, tx_id: u64, commit_time_ms: u64) -> IndexResult<u64> {
        self.check_available()?;
        Ok(self.markers.read().get(&tx_id).map_or(0, |markers| {
            markers
                .iter()
                .filter(|m| m.commit_time_ms == commit_time_ms)
                .count() as u64
        }))
    }

    fn indexed_transaction_ids(&self, from: u64, to: u64) -> IndexResult<Vec<u64>> {
        self.check_available()?;
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self.markers.read().range(from..=to).map(|(id, _)| *id).collect())
    }

    fn index_cap(&self) -> IndexResult<Option<u64>> {
        Ok(*self.index_cap.read())
    }

    fn clear_processed_transactions(&self) {
        self.processed.write().clear();
    }
}
