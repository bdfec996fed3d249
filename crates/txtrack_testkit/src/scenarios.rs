//! Repository builders and canned scenarios.

use txtrack_engine::MemoryRepository;
use txtrack_protocol::{NodeContent, NodeMutation, Transaction};

/// One hour in milliseconds.
pub const HOUR_MS: u64 = 60 * 60 * 1000;

/// Builds a [`MemoryRepository`] one transaction at a time.
///
/// Node ids are derived from the transaction id (`tx_id * 100 + n`) unless
/// nodes are given explicitly.
pub struct RepositoryBuilder {
    repo: MemoryRepository,
}

impl RepositoryBuilder {
    /// Starts an empty repository with every optional service.
    pub fn new() -> Self {
        Self {
            repo: MemoryRepository::new(),
        }
    }

    /// Switches off the optional repository services.
    pub fn without_services(self) -> Self {
        Self {
            repo: self.repo.without_services(),
        }
    }

    /// Adds a transaction with generated nodes.
    ///
    /// `updates` nodes are created as updated, then `deletes` as deleted.
    pub fn transaction(self, id: u64, commit_time_ms: u64, updates: u64, deletes: u64) -> Self {
        let nodes = (0..updates + deletes)
            .map(|n| {
                let node_id = id * 100 + n;
                if n < updates {
                    generated_node(node_id, id)
                } else {
                    NodeMutation::deleted(node_id, id, 1, node_ref(node_id))
                }
            })
            .collect();
        self.transaction_with_nodes(Transaction::new(id, commit_time_ms, updates, deletes), nodes)
    }

    /// Adds a transaction with the given nodes.
    pub fn transaction_with_nodes(self, tx: Transaction, nodes: Vec<NodeMutation>) -> Self {
        self.repo.add_transaction(tx, nodes);
        self
    }

    /// Finishes the repository.
    pub fn build(self) -> MemoryRepository {
        self.repo
    }
}

impl Default for RepositoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the node reference used for generated nodes.
pub fn node_ref(node_id: u64) -> String {
    format!("workspace://SpacesStore/node-{node_id}")
}

fn generated_node(node_id: u64, tx_id: u64) -> NodeMutation {
    NodeMutation::updated(node_id, tx_id, 1, node_ref(node_id))
        .with_content(NodeContent::new("cm:content").with_property("cm:name", format!("doc-{node_id}")))
}

/// Two transactions: tx 1 at 100 ms with node 10, tx 2 at 200 ms with
/// nodes 20 and 21.
pub fn scenario_a() -> MemoryRepository {
    RepositoryBuilder::new()
        .transaction_with_nodes(Transaction::new(1, 100, 1, 0), vec![generated_node(10, 1)])
        .transaction_with_nodes(
            Transaction::new(2, 200, 2, 0),
            vec![generated_node(20, 2), generated_node(21, 2)],
        )
        .build()
}

/// Builds a repository from a commit-ordered transaction list with
/// generated nodes.
pub fn repository_from(txs: &[Transaction]) -> MemoryRepository {
    txs.iter()
        .fold(RepositoryBuilder::new(), |builder, tx| {
            builder.transaction(tx.id, tx.commit_time_ms, tx.updates, tx.deletes)
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use txtrack_engine::RepositoryClient;
    use txtrack_protocol::{NodeQuery, NodeStatus, StoreRef};

    #[test]
    fn builder_generates_nodes() {
        let repo = RepositoryBuilder::new().transaction(3, 300, 2, 1).build();
        let nodes = repo
            .list_nodes(&NodeQuery::for_transactions(vec![3], StoreRef::default()), 10)
            .unwrap();

        assert_eq!(nodes.iter().map(|n| n.id).collect::<Vec<_>>(), vec![300, 301, 302]);
        assert_eq!(nodes[2].status, NodeStatus::Deleted);
        assert!(nodes[0].content.is_some());
    }

    #[test]
    fn scenario_a_shape() {
        let txs = scenario_a().transactions();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[1].change_count(), 2);
    }
}
