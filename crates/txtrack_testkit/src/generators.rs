//! Property-based test generators using proptest.
//!
//! Provides strategies for generating repository histories that keep the
//! ordering the tracker relies on.

use proptest::prelude::*;
use txtrack_engine::MaintenanceRequest;
use txtrack_protocol::{NodeMutation, NodeStatus, Transaction};

/// First commit time used by generated histories.
pub const BASE_COMMIT_TIME_MS: u64 = 1_000;

/// Strategy for a transaction history in `(commit_time, id)` order.
///
/// Ids ascend from 1 and commit times never decrease, so several
/// transactions may share a commit time.
pub fn transaction_sequence_strategy(
    max_len: usize,
) -> impl Strategy<Value = Vec<Transaction>> {
    prop::collection::vec((0u64..5_000, 0u64..4, 0u64..2), 1..=max_len.max(1)).prop_map(|steps| {
        let mut commit_time = BASE_COMMIT_TIME_MS;
        steps
            .into_iter()
            .enumerate()
            .map(|(i, (gap, updates, deletes))| {
                commit_time += gap;
                Transaction::new(i as u64 + 1, commit_time, updates, deletes)
            })
            .collect()
    })
}

/// Strategy for node statuses seen in repository listings.
pub fn node_status_strategy() -> impl Strategy<Value = NodeStatus> {
    prop_oneof![
        Just(NodeStatus::Updated),
        Just(NodeStatus::Deleted),
        Just(NodeStatus::Unknown),
    ]
}

/// Strategy for a node mutation belonging to transaction `tx_id`.
pub fn node_mutation_strategy(tx_id: u64) -> impl Strategy<Value = NodeMutation> {
    (1u64..10_000, 1u64..50, node_status_strategy()).prop_map(move |(id, acl_id, status)| {
        let node = NodeMutation::updated(id, tx_id, acl_id, format!("workspace://SpacesStore/{id}"));
        NodeMutation { status, ..node }
    })
}

/// Strategy for maintenance requests over a small id space, so that
/// purges and (re)index requests for the same target collide often.
pub fn maintenance_request_strategy() -> impl Strategy<Value = MaintenanceRequest> {
    (0u8..6, 1u64..6).prop_map(|(kind, id)| match kind {
        0 => MaintenanceRequest::purge_transaction(id),
        1 => MaintenanceRequest::reindex_transaction(id),
        2 => MaintenanceRequest::index_transaction(id),
        3 => MaintenanceRequest::purge_node(id),
        4 => MaintenanceRequest::reindex_node(id),
        _ => MaintenanceRequest::index_node(id),
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to generate.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 64,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Quick configuration for CI.
    pub fn quick() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 100,
        }
    }

    /// Thorough configuration for local runs.
    pub fn thorough() -> Self {
        Self {
            cases: 512,
            max_shrink_iters: 10_000,
        }
    }

    /// Converts to proptest's configuration.
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
