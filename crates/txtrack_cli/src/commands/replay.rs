//! Replay command implementation.

use super::{build_tracker, print_json, ReplayOptions};
use crate::snapshot::RepositorySnapshot;
use serde::Serialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use txtrack_engine::{FirstTxCheck, LastTxCheck};
use txtrack_protocol::Cursor;

/// Replay result.
#[derive(Debug, Serialize)]
pub struct ReplayResult {
    /// Cycles run.
    pub cycles: usize,
    /// Transactions applied.
    pub transactions_indexed: u64,
    /// Node mutations applied.
    pub nodes_indexed: u64,
    /// First transaction audit outcome.
    pub first_check: String,
    /// Last transaction audit outcome.
    pub last_check: String,
    /// Cursor after the last cycle.
    pub cursor: Cursor,
    /// Transaction markers in the index.
    pub index_markers: usize,
    /// Node documents in the index.
    pub index_nodes: usize,
}

/// Runs the replay command.
pub fn run(
    snapshot_path: &Path,
    options: &ReplayOptions,
    cycles: usize,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = RepositorySnapshot::load(snapshot_path)?;
    let (tracker, index) = build_tracker(&snapshot, options)?;
    let cancel = CancellationToken::new();

    let mut result = ReplayResult {
        cycles: 0,
        transactions_indexed: 0,
        nodes_indexed: 0,
        first_check: "not run".into(),
        last_check: "not run".into(),
        cursor: Cursor::default(),
        index_markers: 0,
        index_nodes: 0,
    };

    for _ in 0..cycles.max(1) {
        let report = tracker.run_cycle(&cancel)?;
        if let Some(audit) = report.audit {
            result.first_check = describe_first(&audit.first);
            result.last_check = describe_last(&audit.last);
        }
        result.cycles += 1;
        result.transactions_indexed += report.transactions_indexed;
        result.nodes_indexed += report.nodes_indexed;
        result.cursor = report.cursor;
    }

    let contents = index.snapshot();
    result.index_markers = contents.markers.len();
    result.index_nodes = contents.nodes.len();

    if format == "json" {
        print_json(&result)?;
    } else {
        print_result(snapshot_path, &result);
    }
    Ok(())
}

fn describe_first(check: &FirstTxCheck) -> String {
    match check {
        FirstTxCheck::NotRequired => "not required (empty index)".into(),
        FirstTxCheck::AlreadyChecked => "already checked".into(),
        FirstTxCheck::Verified { tx_id, .. } => format!("verified (tx {tx_id})"),
        FirstTxCheck::Duplicate { tx_id, count } => format!("duplicate (tx {tx_id} x{count})"),
        FirstTxCheck::EmptyShard => "shard has no nodes".into(),
        FirstTxCheck::NoTransactions => "no transactions".into(),
    }
}

fn describe_last(check: &LastTxCheck) -> String {
    match check {
        LastTxCheck::NotRequired => "not required (empty index)".into(),
        LastTxCheck::AlreadyChecked => "already checked".into(),
        LastTxCheck::Verified { .. } => "verified".into(),
        LastTxCheck::Unknown => "repository maximum unknown".into(),
    }
}

fn print_result(path: &Path, result: &ReplayResult) {
    println!("Replayed {:?}", path);
    println!();
    println!("Cycles:                {}", result.cycles);
    println!("Transactions indexed:  {}", result.transactions_indexed);
    println!("Nodes indexed:         {}", result.nodes_indexed);
    println!("First transaction:     {}", result.first_check);
    println!("Last transaction:      {}", result.last_check);
    println!(
        "Cursor:                tx {} @ {} ms",
        result.cursor.tx_id, result.cursor.commit_time_ms
    );
    println!("Index markers:         {}", result.index_markers);
    println!("Index nodes:           {}", result.index_nodes);
}
