//! Check-node command implementation.

use super::{build_tracker, print_json, ReplayOptions};
use crate::snapshot::RepositorySnapshot;
use serde::Serialize;
use std::path::Path;
use txtrack_engine::DbTxLookup;

/// What the repository reports for a node.
#[derive(Debug, Serialize)]
pub struct CheckNodeResult {
    /// Node id.
    pub node_id: u64,
    /// Status in the repository.
    pub status: String,
    /// Transaction id, if found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<u64>,
    /// Lookup failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs the check-node command.
pub fn run(
    snapshot_path: &Path,
    node_id: u64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = RepositorySnapshot::load(snapshot_path)?;
    let (tracker, _index) = build_tracker(&snapshot, &ReplayOptions::default())?;
    let report = tracker.check_node(node_id);

    let (txn_id, error) = match report.db_tx {
        DbTxLookup::Found(id) => (Some(id), None),
        DbTxLookup::Missing => (None, None),
        DbTxLookup::Failed(message) => (None, Some(message)),
    };
    let result = CheckNodeResult {
        node_id,
        status: format!("{:?}", report.db_status),
        txn_id,
        error,
    };

    if format == "json" {
        print_json(&result)?;
    } else {
        println!("Node {}: {}", result.node_id, result.status);
        match (result.txn_id, &result.error) {
            (Some(id), _) => println!("Transaction: {id}"),
            (None, Some(e)) => println!("Lookup failed: {e}"),
            (None, None) => println!("Not found in repository"),
        }
    }
    Ok(())
}
