//! Watch command implementation.

use super::{build_tracker, ReplayOptions};
use crate::snapshot::RepositorySnapshot;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use txtrack_engine::{ServiceExit, TrackerService};

/// Runs the watch command.
///
/// Schedules cycles every `interval` until `duration` elapses or Ctrl-C is
/// pressed.
pub fn run(
    snapshot_path: &Path,
    options: &ReplayOptions,
    interval: Duration,
    duration: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = RepositorySnapshot::load(snapshot_path)?;
    let (tracker, index) = build_tracker(&snapshot, options)?;
    let tracker = Arc::new(tracker);

    let runtime = tokio::runtime::Runtime::new()?;
    let exit = runtime.block_on(async {
        let service = TrackerService::spawn(Arc::clone(&tracker), interval, CancellationToken::new());
        let stop = service.cancellation_token();

        let deadline = async {
            match duration {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
            () = deadline => {}
            () = stop.cancelled() => {}
        }
        service.shutdown().await
    });

    let stats = tracker.stats();
    println!("Cycles completed:      {}", stats.cycles_completed);
    println!("Cycles failed:         {}", stats.cycles_failed);
    println!("Transactions indexed:  {}", stats.transactions_indexed);
    println!("Nodes indexed:         {}", stats.nodes_indexed);
    println!("Index markers:         {}", index.marker_ids().len());

    match exit {
        ServiceExit::Cancelled => Ok(()),
        ServiceExit::Fatal(e) => Err(e.into()),
    }
}
