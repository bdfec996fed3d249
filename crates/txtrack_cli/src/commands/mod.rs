//! CLI command implementations.

pub mod check_index;
pub mod check_node;
pub mod cursor;
pub mod replay;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;
use txtrack_engine::{
    FileStateStore, MemoryIndex, MemoryRepository, MemoryStateStore, ShardConfig, StateStore,
    Tracker, TrackerConfig,
};

use crate::snapshot::RepositorySnapshot;

/// A tracker over a replayed repository.
pub type ReplayTracker = Tracker<MemoryRepository, MemoryIndex, Arc<dyn StateStore>>;

/// Options shared by every command that replays a snapshot.
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Directory holding the durable cursor; in memory when absent.
    pub state_dir: Option<PathBuf>,
    /// Overrides the batch threshold.
    pub batch_threshold: Option<u64>,
    /// Overrides the worker thread count.
    pub workers: Option<usize>,
    /// Restricts the tracker to a DB id range shard.
    pub shard_range: Option<(u64, u64)>,
}

/// Builds a tracker over `snapshot`, returning it with its index.
pub fn build_tracker(
    snapshot: &RepositorySnapshot,
    options: &ReplayOptions,
) -> Result<(ReplayTracker, Arc<MemoryIndex>), Box<dyn std::error::Error>> {
    let mut config = TrackerConfig::from_properties(&snapshot.properties)?;
    if let Some(threshold) = options.batch_threshold {
        config = config.with_batch_threshold(threshold);
    }
    if let Some(workers) = options.workers {
        config = config.with_worker_threads(workers);
    }
    if let Some((start, end)) = options.shard_range {
        config = config.with_shard(ShardConfig::db_id_range(start, end));
    }

    let store: Arc<dyn StateStore> = match &options.state_dir {
        Some(dir) => Arc::new(FileStateStore::open(dir)?),
        None => Arc::new(MemoryStateStore::new()),
    };
    let index = Arc::new(MemoryIndex::new());
    let tracker = Tracker::new(
        config,
        Arc::new(snapshot.to_repository()),
        Arc::clone(&index),
        store,
    )?;
    Ok((tracker, index))
}

/// Prints `value` as pretty JSON.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
