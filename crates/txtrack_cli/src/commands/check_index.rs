//! Check-index command implementation.

use super::{build_tracker, print_json, ReplayOptions};
use crate::snapshot::RepositorySnapshot;
use serde::Serialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use txtrack_engine::{CheckIndexBounds, IndexHealthReport};

/// Index health summary.
#[derive(Debug, Serialize)]
pub struct CheckIndexResult {
    /// Transactions found in the repository.
    pub db_transactions: u64,
    /// Lowest repository transaction id.
    pub min_tx_id: Option<u64>,
    /// Highest repository transaction id.
    pub max_tx_id: Option<u64>,
    /// Markers found in the index.
    pub index_transactions: u64,
    /// Repository transactions missing from the index.
    pub missing_from_index: Vec<u64>,
    /// Index markers unknown to the repository.
    pub unknown_in_index: Vec<u64>,
}

impl From<IndexHealthReport> for CheckIndexResult {
    fn from(report: IndexHealthReport) -> Self {
        Self {
            db_transactions: report.db_transaction_count,
            min_tx_id: report.min_tx_id,
            max_tx_id: report.max_tx_id,
            index_transactions: report.index_transaction_count,
            missing_from_index: report.missing_from_index,
            unknown_in_index: report.unknown_in_index,
        }
    }
}

/// Runs the check-index command.
///
/// Replays the snapshot for `cycles` cycles first; with zero cycles the
/// index is empty and every transaction is reported missing.
pub fn run(
    snapshot_path: &Path,
    options: &ReplayOptions,
    cycles: usize,
    bounds: CheckIndexBounds,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = RepositorySnapshot::load(snapshot_path)?;
    let (tracker, _index) = build_tracker(&snapshot, options)?;
    let cancel = CancellationToken::new();

    for _ in 0..cycles {
        tracker.run_cycle(&cancel)?;
    }
    let report = tracker.check_index(bounds, &cancel)?;
    let healthy = report.is_healthy();
    let result = CheckIndexResult::from(report);

    if format == "json" {
        print_json(&result)?;
    } else {
        print_result(&result);
    }

    if healthy {
        Ok(())
    } else {
        Err("Index check found differences".into())
    }
}

fn print_result(result: &CheckIndexResult) {
    println!("Repository transactions: {}", result.db_transactions);
    if let (Some(min), Some(max)) = (result.min_tx_id, result.max_tx_id) {
        println!("Transaction ids:         {min}..={max}");
    }
    println!("Index markers:           {}", result.index_transactions);
    println!("Missing from index:      {:?}", result.missing_from_index);
    println!("Unknown in index:        {:?}", result.unknown_in_index);
    println!();
    if result.missing_from_index.is_empty() && result.unknown_in_index.is_empty() {
        println!("✓ Index matches repository");
    } else {
        println!("✗ Index does not match repository");
    }
}
