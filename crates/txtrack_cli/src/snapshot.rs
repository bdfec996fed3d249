//! Recorded repository snapshots.
//!
//! A snapshot is a JSON document listing transactions with their node
//! mutations, plus the core properties the tracker was configured with:
//!
//! ```json
//! {
//!   "properties": { "alfresco.lag": "1000" },
//!   "transactions": [
//!     { "id": 1, "commit_time_ms": 100, "updates": 1, "deletes": 0,
//!       "nodes": [{ "id": 10, "status": "Updated", "acl_id": 1, "txn_id": 1,
//!                   "node_ref": "workspace://SpacesStore/a", "tenant": "" }] }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use txtrack_engine::MemoryRepository;
use txtrack_protocol::{NodeMutation, Transaction};

/// Errors reading a snapshot.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The file could not be read.
    #[error("failed to read snapshot {path}: {source}")]
    Io {
        /// Snapshot path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not a valid snapshot.
    #[error("invalid snapshot: {0}")]
    Json(#[from] serde_json::Error),

    /// A node belongs to a transaction it is not listed under.
    #[error("node {node_id} has txn_id {txn_id} but is listed under transaction {tx_id}")]
    MisplacedNode {
        /// Node id.
        node_id: u64,
        /// Transaction id on the node.
        txn_id: u64,
        /// Transaction it was listed under.
        tx_id: u64,
    },
}

/// One recorded transaction with its nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTransaction {
    /// The transaction.
    #[serde(flatten)]
    pub transaction: Transaction,
    /// Its node mutations.
    #[serde(default)]
    pub nodes: Vec<NodeMutation>,
}

/// A recorded repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    /// Core properties for the tracker configuration.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Recorded transactions, in any order.
    pub transactions: Vec<SnapshotTransaction>,
}

impl RepositorySnapshot {
    /// Reads a snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let data = fs::read_to_string(path).map_err(|source| SnapshotError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&data)
    }

    /// Parses a snapshot.
    pub fn from_json(data: &str) -> Result<Self, SnapshotError> {
        let snapshot: Self = serde_json::from_str(data)?;
        for recorded in &snapshot.transactions {
            let tx_id = recorded.transaction.id;
            if let Some(node) = recorded.nodes.iter().find(|n| n.txn_id != tx_id) {
                return Err(SnapshotError::MisplacedNode {
                    node_id: node.id,
                    txn_id: node.txn_id,
                    tx_id,
                });
            }
        }
        Ok(snapshot)
    }

    /// Loads the snapshot into an in-memory repository.
    pub fn to_repository(&self) -> MemoryRepository {
        let repo = MemoryRepository::new();
        for recorded in &self.transactions {
            repo.add_transaction(recorded.transaction, recorded.nodes.clone());
        }
        repo
    }
}
