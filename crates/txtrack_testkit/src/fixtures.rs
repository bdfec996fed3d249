//! Test fixtures and tracker helpers.
//!
//! Provides a tracker wired to the in-memory repository, index and state
//! store, with handles kept for inspection.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use txtrack_engine::{
    CycleReport, MemoryIndex, MemoryRepository, MemoryStateStore, StateStore, TrackResult,
    Tracker, TrackerConfig,
};
use txtrack_protocol::Cursor;

/// A tracker over in-memory collaborators.
pub type MemoryTracker = Tracker<MemoryRepository, MemoryIndex, Arc<MemoryStateStore>>;

/// A tracker together with the collaborators it runs against.
pub struct TrackerFixture {
    /// The repository being tracked.
    pub repo: Arc<MemoryRepository>,
    /// The index being kept in step.
    pub index: Arc<MemoryIndex>,
    /// The cursor store.
    pub store: Arc<MemoryStateStore>,
    /// The tracker.
    pub tracker: MemoryTracker,
    /// Token passed to every cycle.
    pub cancel: CancellationToken,
}

impl TrackerFixture {
    /// Creates a fixture with the test configuration.
    pub fn new(repo: MemoryRepository) -> Self {
        Self::with_config(repo, test_config())
    }

    /// Creates a fixture with a custom configuration.
    pub fn with_config(repo: MemoryRepository, config: TrackerConfig) -> Self {
        Self::with_parts(
            Arc::new(repo),
            Arc::new(MemoryIndex::new()),
            Arc::new(MemoryStateStore::new()),
            config,
        )
    }

    /// Creates a fixture over existing collaborators.
    ///
    /// Used to simulate a restart: the new tracker sees the index and the
    /// saved cursor left by a previous one.
    pub fn with_parts(
        repo: Arc<MemoryRepository>,
        index: Arc<MemoryIndex>,
        store: Arc<MemoryStateStore>,
        config: TrackerConfig,
    ) -> Self {
        let tracker = Tracker::new(config, Arc::clone(&repo), Arc::clone(&index), Arc::clone(&store))
            .expect("Failed to create tracker");
        Self {
            repo,
            index,
            store,
            tracker,
            cancel: CancellationToken::new(),
        }
    }

    /// Creates a new tracker over this fixture's collaborators.
    pub fn restart(&self, config: TrackerConfig) -> Self {
        Self::with_parts(
            Arc::clone(&self.repo),
            Arc::clone(&self.index),
            Arc::clone(&self.store),
            config,
        )
    }

    /// Runs one cycle.
    pub fn run_cycle(&self) -> TrackResult<CycleReport> {
        self.tracker.run_cycle(&self.cancel)
    }

    /// Runs `n` cycles, stopping at the first error.
    pub fn run_cycles(&self, n: usize) -> TrackResult<Vec<CycleReport>> {
        (0..n).map(|_| self.run_cycle()).collect()
    }

    /// Returns the durably saved cursor.
    pub fn saved_cursor(&self) -> Option<Cursor> {
        self.store.load().expect("Failed to load cursor")
    }
}

impl std::ops::Deref for TrackerFixture {
    type Target = MemoryTracker;

    fn deref(&self) -> &Self::Target {
        &self.tracker
    }
}

/// Configuration used by fixtures: small worker pool, defaults otherwise.
pub fn test_config() -> TrackerConfig {
    TrackerConfig::new().with_worker_threads(2)
}

/// Runs a closure with a fixture over `repo`.
pub fn with_tracker<F, R>(repo: MemoryRepository, f: F) -> R
where
    F: FnOnce(&TrackerFixture) -> R,
{
    let fixture = TrackerFixture::new(repo);
    f(&fixture)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::scenario_a;

    #[test]
    fn fixture_runs_cycles() {
        let fixture = TrackerFixture::new(scenario_a());
        let reports = fixture.run_cycles(2).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(fixture.saved_cursor(), Some(Cursor::new(200, 2)));
    }

    #[test]
    fn restart_shares_collaborators() {
        let fixture = TrackerFixture::new(scenario_a());
        fixture.run_cycle().unwrap();

        let restarted = fixture.restart(test_config());
        assert!(restarted.state().is_none());
        let report = restarted.run_cycle().unwrap();
        assert_eq!(report.transactions_indexed, 0);
        assert_eq!(report.cursor, Cursor::new(200, 2));
    }

    #[test]
    fn with_tracker_passes_fixture() {
        let markers = with_tracker(scenario_a(), |f| {
            f.run_cycle().unwrap();
            f.index.marker_ids()
        });
        assert_eq!(markers, vec![1, 2]);
    }
}
