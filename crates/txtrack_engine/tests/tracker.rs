//! Integration tests driving the tracker against the in-memory repository
//! and index.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use txtrack_engine::{
    ConsistencyError, FileStateStore, FirstTxCheck, IndexServer, MemoryIndex, ShardConfig,
    TrackError, Tracker, TrackerConfig,
};
use txtrack_protocol::{Cursor, NodeMutation, NodeStatus, Transaction};
use txtrack_testkit::{scenario_a, test_config, RepositoryBuilder, TrackerFixture, HOUR_MS};

#[test]
fn scenario_a_indexes_both_transactions() {
    let f = TrackerFixture::new(scenario_a());
    let report = f.run_cycle().unwrap();

    assert_eq!(f.index.marker_ids(), vec![1, 2]);
    assert_eq!(f.index.node_count(), 3);
    assert_eq!(report.nodes_indexed, 3);
    assert_eq!(report.cursor, Cursor::new(200, 2));
    assert_eq!(f.saved_cursor(), Some(Cursor::new(200, 2)));
}

#[test]
fn scenario_b_first_transaction_verified_after_restart() {
    let f = TrackerFixture::new(scenario_a());
    f.run_cycle().unwrap();

    let restarted = f.restart(test_config());
    let report = restarted.run_cycle().unwrap();
    let audit = report.audit.unwrap();

    assert_eq!(
        audit.first,
        FirstTxCheck::Verified {
            tx_id: 1,
            commit_time_ms: 100
        }
    );
    assert!(restarted.halted_reason().is_none());
}

#[test]
fn scenario_c_cascade_marker_for_foreign_node() {
    let config = test_config().with_shard(ShardConfig::db_id_range(0, 15));
    let f = TrackerFixture::with_config(scenario_a(), config);
    f.run_cycle().unwrap();

    let owned = f.index.node(10).unwrap();
    assert_eq!(owned.status, NodeStatus::Updated);
    assert!(owned.content.is_some());

    let foreign = f.index.node(20).unwrap();
    assert_eq!(foreign.status, NodeStatus::NonShardUpdated);
    assert_eq!(foreign.txn_id, 2);
    assert_eq!(foreign.acl_id, 1);
    assert!(foreign.content.is_none());
    assert_eq!(f.index.marker_ids(), vec![1, 2]);
}

#[test]
fn cascade_disabled_marks_foreign_nodes_deleted() {
    let config = test_config()
        .with_shard(ShardConfig::db_id_range(0, 15))
        .with_cascade(false);
    let f = TrackerFixture::with_config(scenario_a(), config);
    f.run_cycle().unwrap();

    assert_eq!(f.index.node(20).map(|n| n.status), Some(NodeStatus::NonShardDeleted));
}

#[test]
fn shard_without_nodes_indexes_only_latest_marker() {
    let config = test_config().with_shard(ShardConfig::db_id_range(1_000, 2_000));
    let f = TrackerFixture::with_config(scenario_a(), config);
    let report = f.run_cycle().unwrap();

    assert_eq!(f.index.marker_ids(), vec![2]);
    assert_eq!(f.index.node_count(), 0);
    assert_eq!(report.cursor, Cursor::new(200, 2));

    let report = f.run_cycle().unwrap();
    assert_eq!(report.transactions_indexed, 0);
}

#[test]
fn reindexing_a_transaction_is_idempotent() {
    let f = TrackerFixture::new(scenario_a());
    f.run_cycle().unwrap();
    let before = f.index.snapshot();

    f.maintenance_handle().reindex_transaction(2);
    let report = f.run_cycle().unwrap();

    assert_eq!(report.maintenance.reindexed_transactions, 1);
    assert_eq!(f.index.snapshot(), before);
}

#[test]
fn repeated_cycles_do_not_reapply() {
    let f = TrackerFixture::new(scenario_a());
    f.run_cycle().unwrap();
    let batches = f.index.batches_applied();

    for report in f.run_cycles(3).unwrap() {
        assert_eq!(report.transactions_indexed, 0);
    }
    assert_eq!(f.index.batches_applied(), batches);
}

#[test]
fn purge_wins_over_index_in_the_same_cycle() {
    let repo = RepositoryBuilder::new()
        .transaction(1, 10 * HOUR_MS, 1, 0)
        .transaction(2, 20 * HOUR_MS, 1, 0)
        .build();
    let f = TrackerFixture::new(repo);
    f.run_cycle().unwrap();
    assert!(f.index.has_marker(1));

    let handle = f.maintenance_handle();
    handle.index_transaction(1);
    handle.purge_transaction(1);
    let report = f.run_cycle().unwrap();

    assert_eq!(report.maintenance.purged_transactions, 1);
    assert_eq!(report.maintenance.superseded, 1);
    assert!(!f.index.has_marker(1));
    assert!(f.index.node(100).is_none());
    assert!(f.index.has_marker(2));
}

#[test]
fn purge_inside_hole_retention_survives_the_rescan() {
    let f = TrackerFixture::new(scenario_a());
    f.run_cycle().unwrap();
    assert!(f.index.has_marker(2));

    let handle = f.maintenance_handle();
    handle.index_transaction(2);
    handle.purge_transaction(2);
    let report = f.run_cycle().unwrap();

    assert_eq!(report.maintenance.superseded, 1);
    assert!(report.maintenance.purged_transaction_ids.contains(&2));
    assert_eq!(report.transactions_indexed, 0);
    assert!(!f.index.has_marker(2));
    assert!(f.index.node(20).is_none());
    assert!(f.index.node(21).is_none());
    assert!(f.index.has_marker(1));
    assert_eq!(report.cursor, Cursor::new(200, 2));
}

#[test]
fn node_batches_apply_while_the_write_lock_is_held() {
    let f = TrackerFixture::new(scenario_a());
    let lock = f.write_lock();
    let guard = lock.lock();

    thread::scope(|s| {
        let cycle = s.spawn(|| f.run_cycle());

        let deadline = Instant::now() + Duration::from_secs(5);
        while f.index.batches_applied() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(20));
        let batches = f.index.batches_applied();
        let markers = f.index.marker_ids();
        let saved = f.saved_cursor();
        let blocked = !cycle.is_finished();
        drop(guard);

        assert!(batches > 0);
        assert!(markers.is_empty());
        assert_eq!(saved, None);
        assert!(blocked);

        let report = cycle.join().unwrap().unwrap();
        assert_eq!(report.cursor, Cursor::new(200, 2));
    });

    assert_eq!(f.index.marker_ids(), vec![1, 2]);
    assert_eq!(f.saved_cursor(), Some(Cursor::new(200, 2)));
}

#[test]
fn empty_index_is_audited_until_the_first_transaction_arrives() {
    let f = TrackerFixture::new(RepositoryBuilder::new().build());
    let first = f.run_cycle().unwrap();
    assert!(first.audit.is_some());
    assert_eq!(first.transactions_indexed, 0);

    f.repo.add_transaction(
        Transaction::new(1, 5 * HOUR_MS, 1, 0),
        vec![NodeMutation::updated(100, 1, 1, "a")],
    );
    let second = f.run_cycle().unwrap();

    assert!(second.audit.is_some());
    assert_eq!(second.transactions_indexed, 1);
    assert_eq!(f.index.marker_ids(), vec![1]);
    assert_eq!(second.cursor, Cursor::new(5 * HOUR_MS, 1));

    let third = f.run_cycle().unwrap();
    assert!(third.audit.is_none());
}

#[test]
fn maintenance_indexes_by_id_and_query() {
    let f = TrackerFixture::new(scenario_a());
    f.run_cycle().unwrap();

    let handle = f.maintenance_handle();
    handle.purge_node(21);
    handle.reindex_node(10);
    handle.reindex_query("TYPE:cm:content");
    assert!(f.has_maintenance());
    let report = f.run_cycle().unwrap();

    assert!(!f.has_maintenance());
    assert!(f.index.node(21).is_none());
    assert_eq!(f.index.node(10).map(|n| n.status), Some(NodeStatus::Unknown));
    assert_eq!(f.index.reindexed_queries(), vec!["TYPE:cm:content".to_string()]);
    assert_eq!(report.maintenance.total(), 3);
    assert_eq!(f.stats().maintenance_actions, 3);
}

#[test]
fn missing_transaction_in_maintenance_is_not_an_error() {
    let f = TrackerFixture::new(scenario_a());
    f.maintenance_handle().index_transaction(99);
    let report = f.run_cycle().unwrap();
    assert_eq!(report.maintenance.missing_transactions, 1);
}

#[test]
fn worker_failure_rolls_back_and_recovers() {
    let f = TrackerFixture::new(scenario_a());
    f.index.reject_node(21);

    let err = f.run_cycle().unwrap_err();
    assert!(matches!(err, TrackError::WorkerFailure { failed: 1, .. }));
    assert!(f.rollback_flag().is_set());
    assert!(f.index.marker_ids().is_empty());
    assert_eq!(f.saved_cursor(), None);

    f.index.accept_all();
    let report = f.run_cycle().unwrap();
    assert!(!f.rollback_flag().is_set());
    assert_eq!(report.cursor, Cursor::new(200, 2));
    assert_eq!(f.index.marker_ids(), vec![1, 2]);
}

#[test]
fn cursor_stops_before_failed_transaction() {
    let config = test_config().with_batch_threshold(0);
    let f = TrackerFixture::with_config(scenario_a(), config);
    f.index.reject_node(20);

    assert!(f.run_cycle().is_err());
    assert_eq!(f.saved_cursor(), Some(Cursor::new(100, 1)));
    assert_eq!(f.index.marker_ids(), vec![1]);
}

#[test]
fn rollback_requested_elsewhere_reloads_state() {
    let f = TrackerFixture::new(scenario_a());
    f.run_cycle().unwrap();

    f.rollback_flag().request();
    let report = f.run_cycle().unwrap();

    assert_eq!(report.cycle, 0);
    assert!(report.audit.is_some());
    assert_eq!(report.cursor, Cursor::new(200, 2));
}

#[test]
fn cancelled_token_stops_the_cycle() {
    let f = TrackerFixture::new(scenario_a());
    f.cancel.cancel();

    assert!(matches!(f.run_cycle(), Err(TrackError::Cancelled)));
    assert!(f.index.marker_ids().is_empty());
    assert_eq!(f.saved_cursor(), None);
}

#[test]
fn hole_retention_picks_up_late_transactions() {
    let repo = RepositoryBuilder::new()
        .transaction(1, 10 * HOUR_MS, 1, 0)
        .transaction(2, 10 * HOUR_MS + HOUR_MS / 2, 1, 0)
        .build();
    let f = TrackerFixture::new(repo);
    f.run_cycle().unwrap();

    f.repo.add_transaction(
        Transaction::new(3, 10 * HOUR_MS + HOUR_MS / 4, 1, 0),
        vec![NodeMutation::updated(300, 3, 1, "late")],
    );
    let report = f.run_cycle().unwrap();

    assert_eq!(report.transactions_indexed, 1);
    assert!(f.index.has_marker(3));
    assert_eq!(report.cursor, Cursor::new(10 * HOUR_MS + HOUR_MS / 2, 2));
}

#[test]
fn hole_retention_is_bounded() {
    let repo = RepositoryBuilder::new()
        .transaction(1, 10 * HOUR_MS, 1, 0)
        .transaction(2, 20 * HOUR_MS, 1, 0)
        .build();
    let f = TrackerFixture::new(repo);
    f.run_cycle().unwrap();

    f.repo.add_transaction(Transaction::new(3, 15 * HOUR_MS, 0, 0), Vec::new());
    f.run_cycle().unwrap();

    assert!(!f.index.has_marker(3));
}

#[test]
fn transactions_inside_the_lag_wait() {
    let repo = RepositoryBuilder::new()
        .transaction(1, 1_000, 1, 0)
        .transaction(2, 9_000, 1, 0)
        .build();
    let f = TrackerFixture::new(repo);
    let tracker = Tracker::new(
        test_config(),
        Arc::clone(&f.repo),
        Arc::clone(&f.index),
        Arc::clone(&f.store),
    )
    .unwrap()
    .with_clock(Arc::new(|| 5_000));

    let report = tracker.run_cycle(&CancellationToken::new()).unwrap();
    assert!(report.up_to_date);
    assert_eq!(f.index.marker_ids(), vec![1]);
    assert_eq!(report.cursor, Cursor::new(1_000, 1));
}

#[test]
fn index_ahead_of_repository_halts() {
    let f = TrackerFixture::new(scenario_a());
    f.index.index_transaction(&Transaction::new(1, 100, 1, 0), false).unwrap();
    f.index.index_transaction(&Transaction::new(9, 10_000, 0, 0), false).unwrap();

    let err = f.run_cycle().unwrap_err();
    assert!(matches!(
        err,
        TrackError::Consistency(ConsistencyError::IndexAheadOfRepository { .. })
    ));
    assert!(matches!(f.run_cycle(), Err(TrackError::Halted { .. })));

    f.reset_halt();
    assert!(matches!(f.run_cycle(), Err(TrackError::Consistency(_))));
}

#[test]
fn repository_outage_is_retryable() {
    let f = TrackerFixture::new(scenario_a());
    f.repo.set_available(false);

    let err = f.run_cycle().unwrap_err();
    assert!(err.is_retryable());
    assert!(f.halted_reason().is_none());

    f.repo.set_available(true);
    f.run_cycle().unwrap();
    assert_eq!(f.index.marker_ids(), vec![1, 2]);
}

#[test]
fn degraded_repository_still_tracks() {
    let repo = RepositoryBuilder::new()
        .without_services()
        .transaction(1, 10 * HOUR_MS, 1, 0)
        .transaction(2, 13 * HOUR_MS, 2, 0)
        .build();
    let f = TrackerFixture::new(repo);
    assert!(!f.capabilities().next_commit_time);

    f.run_cycle().unwrap();
    assert_eq!(f.index.marker_ids(), vec![1, 2]);
    assert_eq!(f.index.node_count(), 3);
}

#[test]
fn range_expands_to_index_cap() {
    let config = test_config().with_shard(ShardConfig::db_id_range(0, 15));
    let f = TrackerFixture::with_config(scenario_a(), config);
    f.index.set_index_cap(Some(21));
    f.run_cycle().unwrap();

    assert_eq!(f.index.node(20).map(|n| n.status), Some(NodeStatus::Updated));
    assert_eq!(f.index.node(21).map(|n| n.status), Some(NodeStatus::NonShardUpdated));
}

#[test]
fn check_index_finds_missing_markers() {
    let f = TrackerFixture::new(scenario_a());
    f.run_cycle().unwrap();
    assert!(f
        .check_index(Default::default(), &f.cancel)
        .unwrap()
        .is_healthy());

    f.index.delete_by_transaction_id(2).unwrap();

    let report = f.check_index(Default::default(), &f.cancel).unwrap();
    assert_eq!(report.missing_from_index, vec![2]);
}

#[test]
fn file_store_resumes_after_restart() {
    let dir = tempdir().unwrap();
    let repo = Arc::new(scenario_a());
    let index = Arc::new(MemoryIndex::new());

    {
        let store = FileStateStore::open(dir.path()).unwrap();
        let tracker =
            Tracker::new(TrackerConfig::new(), Arc::clone(&repo), Arc::clone(&index), store).unwrap();
        tracker.run_cycle(&CancellationToken::new()).unwrap();
    }

    let store = FileStateStore::open(dir.path()).unwrap();
    let tracker = Tracker::new(TrackerConfig::new(), repo, Arc::clone(&index), store).unwrap();
    let report = tracker.run_cycle(&CancellationToken::new()).unwrap();

    assert_eq!(report.transactions_indexed, 0);
    assert_eq!(report.cursor, Cursor::new(200, 2));
}
