//! On-demand purge, reindex and index requests.

use crate::client::{IndexServer, RepositoryClient};
use crate::coordination::check_cancelled;
use crate::error::TrackResult;
use crate::router::ShardRouter;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use txtrack_protocol::{NodeMutation, NodeQuery, StoreRef, TransactionQuery};

/// What to do with a maintenance target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaintenanceAction {
    /// Remove from the index.
    Purge,
    /// Remove, then apply again from the repository.
    Reindex,
    /// Apply from the repository.
    Index,
}

/// What a maintenance request applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MaintenanceTarget {
    /// A transaction and all of its nodes.
    Transaction(u64),
    /// A single node.
    Node(u64),
    /// Every node matching an index query.
    Query(String),
}

/// A queued maintenance request.
///
/// Only meaningful combinations can be built; queries can only be
/// reindexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceRequest {
    action: MaintenanceAction,
    target: MaintenanceTarget,
}

impl MaintenanceRequest {
    /// Purge a transaction.
    pub fn purge_transaction(tx_id: u64) -> Self {
        Self {
            action: MaintenanceAction::Purge,
            target: MaintenanceTarget::Transaction(tx_id),
        }
    }

    /// Purge a node.
    pub fn purge_node(node_id: u64) -> Self {
        Self {
            action: MaintenanceAction::Purge,
            target: MaintenanceTarget::Node(node_id),
        }
    }

    /// Reindex a transaction.
    pub fn reindex_transaction(tx_id: u64) -> Self {
        Self {
            action: MaintenanceAction::Reindex,
            target: MaintenanceTarget::Transaction(tx_id),
        }
    }

    /// Reindex a node.
    pub fn reindex_node(node_id: u64) -> Self {
        Self {
            action: MaintenanceAction::Reindex,
            target: MaintenanceTarget::Node(node_id),
        }
    }

    /// Reindex every node matching `query`.
    pub fn reindex_query(query: impl Into<String>) -> Self {
        Self {
            action: MaintenanceAction::Reindex,
            target: MaintenanceTarget::Query(query.into()),
        }
    }

    /// Index a transaction.
    pub fn index_transaction(tx_id: u64) -> Self {
        Self {
            action: MaintenanceAction::Index,
            target: MaintenanceTarget::Transaction(tx_id),
        }
    }

    /// Index a node.
    pub fn index_node(node_id: u64) -> Self {
        Self {
            action: MaintenanceAction::Index,
            target: MaintenanceTarget::Node(node_id),
        }
    }

    /// Returns the action.
    pub fn action(&self) -> MaintenanceAction {
        self.action
    }

    /// Returns the target.
    pub fn target(&self) -> &MaintenanceTarget {
        &self.target
    }

    /// Position of the request's class in the processing order.
    fn rank(&self) -> u8 {
        use MaintenanceAction::*;
        use MaintenanceTarget::*;
        match (&self.action, &self.target) {
            (Purge, Transaction(_)) => 0,
            (Purge, Node(_)) => 1,
            (Reindex, Transaction(_)) => 2,
            (Reindex, Node(_)) => 3,
            (Reindex, Query(_)) => 4,
            (Index, Transaction(_)) => 5,
            (Index, Node(_)) => 6,
            (Purge, Query(_)) | (Index, Query(_)) => 7,
        }
    }
}

impl fmt::Display for MaintenanceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            MaintenanceAction::Purge => "purge",
            MaintenanceAction::Reindex => "reindex",
            MaintenanceAction::Index => "index",
        };
        match &self.target {
            MaintenanceTarget::Transaction(id) => write!(f, "{action} transaction {id}"),
            MaintenanceTarget::Node(id) => write!(f, "{action} node {id}"),
            MaintenanceTarget::Query(q) => write!(f, "{action} query {q:?}"),
        }
    }
}

/// Cloneable producer side of the maintenance queue.
#[derive(Debug, Clone)]
pub struct MaintenanceHandle {
    sender: UnboundedSender<MaintenanceRequest>,
    pending: Arc<AtomicUsize>,
}

impl MaintenanceHandle {
    /// Queues a request. Returns false if the tracker is gone.
    pub fn submit(&self, request: MaintenanceRequest) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(request).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Queues a transaction purge.
    pub fn purge_transaction(&self, tx_id: u64) -> bool {
        self.submit(MaintenanceRequest::purge_transaction(tx_id))
    }

    /// Queues a node purge.
    pub fn purge_node(&self, node_id: u64) -> bool {
        self.submit(MaintenanceRequest::purge_node(node_id))
    }

    /// Queues a transaction reindex.
    pub fn reindex_transaction(&self, tx_id: u64) -> bool {
        self.submit(MaintenanceRequest::reindex_transaction(tx_id))
    }

    /// Queues a node reindex.
    pub fn reindex_node(&self, node_id: u64) -> bool {
        self.submit(MaintenanceRequest::reindex_node(node_id))
    }

    /// Queues a reindex by query.
    pub fn reindex_query(&self, query: impl Into<String>) -> bool {
        self.submit(MaintenanceRequest::reindex_query(query))
    }

    /// Queues a transaction index.
    pub fn index_transaction(&self, tx_id: u64) -> bool {
        self.submit(MaintenanceRequest::index_transaction(tx_id))
    }

    /// Queues a node index.
    pub fn index_node(&self, node_id: u64) -> bool {
        self.submit(MaintenanceRequest::index_node(node_id))
    }

    /// Returns the number of requests not yet taken by a cycle.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Counts of maintenance work done in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Transactions purged.
    pub purged_transactions: u64,
    /// Nodes purged.
    pub purged_nodes: u64,
    /// Transactions reindexed.
    pub reindexed_transactions: u64,
    /// Nodes reindexed.
    pub reindexed_nodes: u64,
    /// Reindex queries run.
    pub reindexed_queries: u64,
    /// Transactions indexed.
    pub indexed_transactions: u64,
    /// Nodes indexed.
    pub indexed_nodes: u64,
    /// Transactions requested but not found in the repository.
    pub missing_transactions: u64,
    /// Requests dropped because the same id was purged this cycle.
    pub superseded: u64,
    /// Ids of the transactions purged this cycle.
    pub purged_transaction_ids: BTreeSet<u64>,
}

impl MaintenanceReport {
    /// Returns the number of actions carried out.
    pub fn total(&self) -> u64 {
        self.purged_transactions
            + self.purged_nodes
            + self.reindexed_transactions
            + self.reindexed_nodes
            + self.reindexed_queries
            + self.indexed_transactions
            + self.indexed_nodes
    }
}

/// Everything a maintenance pass needs to reach.
pub struct MaintenanceContext<'a, R: ?Sized, I: ?Sized> {
    /// Repository to read transactions and nodes from.
    pub repo: &'a R,
    /// Index to write to.
    pub index: &'a I,
    /// Routing for nodes applied by id.
    pub router: &'a ShardRouter,
    /// Tracked store.
    pub store: &'a StoreRef,
}

/// Consumer side of the maintenance queue, owned by the tracker.
pub struct MaintenanceQueue {
    receiver: Mutex<UnboundedReceiver<MaintenanceRequest>>,
    handle: MaintenanceHandle,
}

impl MaintenanceQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            receiver: Mutex::new(receiver),
            handle: MaintenanceHandle {
                sender,
                pending: Arc::new(AtomicUsize::new(0)),
            },
        }
    }

    /// Returns a producer handle.
    pub fn handle(&self) -> MaintenanceHandle {
        self.handle.clone()
    }

    /// Returns true if any request is waiting.
    pub fn has_maintenance(&self) -> bool {
        self.handle.pending() > 0
    }

    /// Takes everything queued so far, in processing order.
    pub fn drain(&self) -> Vec<MaintenanceRequest> {
        let mut receiver = self.receiver.lock();
        let mut requests = Vec::new();
        while let Ok(request) = receiver.try_recv() {
            self.handle.pending.fetch_sub(1, Ordering::SeqCst);
            requests.push(request);
        }
        requests.sort_by_key(MaintenanceRequest::rank);
        requests
    }

    /// Drops all queued requests, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped = self.drain();
        for request in &dropped {
            info!(%request, "clearing scheduled maintenance work");
        }
        dropped.len()
    }

    /// Processes a snapshot of the queue.
    ///
    /// Requests left unprocessed because of an error or cancellation are
    /// queued again for the next cycle.
    pub fn process<R, I>(
        &self,
        ctx: &MaintenanceContext<'_, R, I>,
        cancel: &CancellationToken,
    ) -> TrackResult<MaintenanceReport>
    where
        R: RepositoryClient + ?Sized,
        I: IndexServer + ?Sized,
    {
        let requests = self.drain();
        let mut report = MaintenanceReport::default();
        let mut purged_txs = HashSet::new();
        let mut purged_nodes = HashSet::new();

        let mut remaining = requests.into_iter();
        while let Some(request) = remaining.next() {
            let result = check_cancelled(cancel).and_then(|()| {
                apply(ctx, &request, &mut purged_txs, &mut purged_nodes, &mut report)
            });
            if let Err(e) = result {
                self.handle.submit(request);
                for request in remaining {
                    self.handle.submit(request);
                }
                return Err(e);
            }
        }

        Ok(report)
    }
}

impl Default for MaintenanceQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn apply<R, I>(
    ctx: &MaintenanceContext<'_, R, I>,
    request: &MaintenanceRequest,
    purged_txs: &mut HashSet<u64>,
    purged_nodes: &mut HashSet<u64>,
    report: &mut MaintenanceReport,
) -> TrackResult<()>
where
    R: RepositoryClient + ?Sized,
    I: IndexServer + ?Sized,
{
    use MaintenanceAction::*;
    use MaintenanceTarget::*;

    match (&request.action, &request.target) {
        (Purge, Transaction(id)) => {
            ctx.index.delete_by_transaction_id(*id)?;
            purged_txs.insert(*id);
            report.purged_transactions += 1;
            report.purged_transaction_ids.insert(*id);
            info!(tx_id = id, "purged transaction");
        }
        (Purge, Node(id)) => {
            ctx.index.delete_by_node_id(*id)?;
            purged_nodes.insert(*id);
            report.purged_nodes += 1;
            info!(node_id = id, "purged node");
        }
        (Reindex | Index, Transaction(id)) if purged_txs.contains(id) => {
            report.superseded += 1;
            info!(%request, "skipped; transaction purged in the same cycle");
        }
        (Reindex | Index, Node(id)) if purged_nodes.contains(id) => {
            report.superseded += 1;
            info!(%request, "skipped; node purged in the same cycle");
        }
        (action @ (Reindex | Index), Transaction(id)) => {
            let is_reindex = *action == Reindex;
            if is_reindex {
                ctx.index.delete_by_transaction_id(*id)?;
            }
            if apply_transaction(ctx, *id, is_reindex)? {
                if is_reindex {
                    report.reindexed_transactions += 1;
                } else {
                    report.indexed_transactions += 1;
                }
                info!(tx_id = id, is_reindex, "transaction has been indexed");
            } else {
                report.missing_transactions += 1;
                warn!(tx_id = id, is_reindex, "transaction not found in repository; not indexed");
            }
        }
        (Reindex, Node(id)) => {
            ctx.index.delete_by_node_id(*id)?;
            ctx.index.index_node(&NodeMutation::unknown(*id), true)?;
            report.reindexed_nodes += 1;
            info!(node_id = id, "node has been reindexed");
        }
        (Index, Node(id)) => {
            ctx.index.index_node(&NodeMutation::unknown(*id), false)?;
            report.indexed_nodes += 1;
            info!(node_id = id, "node has been indexed");
        }
        (Reindex, Query(query)) => {
            ctx.index.reindex_by_query(query)?;
            report.reindexed_queries += 1;
            info!(query = %query, "nodes from query have been reindexed");
        }
        (Purge | Index, Query(_)) => {}
    }
    Ok(())
}

/// Indexes one transaction's nodes and then its marker.
///
/// Returns false when the repository does not know the transaction.
fn apply_transaction<R, I>(
    ctx: &MaintenanceContext<'_, R, I>,
    tx_id: u64,
    is_reindex: bool,
) -> TrackResult<bool>
where
    R: RepositoryClient + ?Sized,
    I: IndexServer + ?Sized,
{
    let page = ctx.repo.list_transactions(&TransactionQuery::single(tx_id))?;
    let Some(tx) = page.first().filter(|t| t.id == tx_id).copied() else {
        return Ok(false);
    };

    let query = NodeQuery::for_transactions(vec![tx.id], ctx.store.clone())
        .with_shard_property(ctx.router.config().shard_property.clone());
    for node in ctx.repo.list_nodes(&query, usize::MAX)? {
        ctx.index.index_node(&ctx.router.route(node), is_reindex)?;
    }
    ctx.index.index_transaction(&tx, is_reindex)?;
    Ok(true)
}
