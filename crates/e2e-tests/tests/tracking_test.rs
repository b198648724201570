//! Live tracking E2E tests.
//!
//! Drives the tracker against the in-memory store and index: catching up
//! after a backlog, commit ordering across workers, idempotent reindexing,
//! busy skipping and shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;

use e2e_tests::{node, TestHarness, NOW};
use tracker_indexing::{TrackerConfig, TrackerListener, TrackerState, TriggerOutcome};
use tracker_types::{NodeChange, NodeRef, Presence, TimestampMs};

/// Catch-up: 1000 unindexed transactions, 100 per query, 50 per commit.
#[tokio::test(flavor = "multi_thread")]
async fn test_catch_up_after_backlog() {
    let harness = TestHarness::new();
    let ids = harness.commit_distinct("bulk", 1000, NOW - 2_000_000, 1000);

    let engine = harness.tracker(
        &TrackerConfig::default()
            .with_max_record_set_size(100)
            .with_max_transactions_per_commit(50)
            .with_worker_threads(4),
    );
    let TriggerOutcome::CaughtUp(report) = engine.trigger().await.unwrap() else {
        panic!("expected the tracker to catch up");
    };

    assert!(report.ticks >= 10, "only {} ticks", report.ticks);
    assert_eq!(report.examined, 1000);
    assert_eq!(report.reindexed, 1000);
    assert_eq!(harness.index.document_count(), 1000);
    for id in ids {
        assert_eq!(harness.presence(id), Presence::Yes, "txn {}", id);
    }
}

/// Groups reach the index in submission order even with several workers.
#[tokio::test(flavor = "multi_thread")]
async fn test_commits_follow_submission_order() {
    let harness = TestHarness::new();
    harness.commit_distinct("seq", 200, NOW - 600_000, 100);

    let engine = harness.tracker(
        &TrackerConfig::default()
            .with_max_record_set_size(200)
            .with_max_transactions_per_commit(10)
            .with_worker_threads(4),
    );
    engine.trigger().await.unwrap();

    let firsts: Vec<usize> = harness
        .index
        .commit_log()
        .iter()
        .map(|group| {
            group[0]
                .id
                .trim_start_matches("seq-")
                .parse()
                .expect("node id suffix")
        })
        .collect();
    assert_eq!(firsts.len(), 20);
    assert!(firsts.windows(2).all(|w| w[0] < w[1]), "out of order: {:?}", firsts);
}

/// Reindexing an already indexed transaction changes nothing.
#[tokio::test(flavor = "multi_thread")]
async fn test_reindex_is_idempotent() {
    let harness = TestHarness::new();
    let id = harness.commit(30_000, &["a", "b"]);
    let engine = harness.tracker(&TrackerConfig::default());

    engine.reindex_transaction(id).await.unwrap();
    engine.reindex_transaction(id).await.unwrap();
    assert_eq!(harness.index.document_count(), 2);
    assert_eq!(harness.presence(id), Presence::Yes);

    let TriggerOutcome::CaughtUp(report) = engine.trigger().await.unwrap() else {
        panic!("expected caught up");
    };
    assert_eq!(report.reindexed, 0);
    assert_eq!(harness.index.document_count(), 2);
}

/// Everything after the first missing transaction in a tick is reindexed,
/// and deletions remove documents.
#[tokio::test(flavor = "multi_thread")]
async fn test_missing_transaction_forces_rest_of_tick() {
    let harness = TestHarness::new();
    let first = harness.commit(50_000, &["keep"]);
    harness.index_now(first);
    let second = harness.commit(40_000, &["gone"]);
    let third = harness
        .store
        .commit_transaction(NOW - 30_000, vec![NodeChange::deleted(node("gone"))]);

    let engine = harness.tracker(&TrackerConfig::default().with_worker_threads(1));
    let TriggerOutcome::CaughtUp(report) = engine.trigger().await.unwrap() else {
        panic!("expected caught up");
    };

    assert_eq!(report.reindexed, 2);
    assert!(harness.index.is_indexed(&node("keep")));
    assert!(!harness.index.is_indexed(&node("gone")));
    assert_eq!(harness.presence(second), Presence::No);
    assert_eq!(harness.presence(third), Presence::Yes);
}

/// Transactions younger than the lag wait for a later tick.
#[tokio::test(flavor = "multi_thread")]
async fn test_lag_window_defers_recent_commits() {
    let harness = TestHarness::new();
    let recent = harness.commit(200, &["fresh"]);
    let engine = harness.tracker(&TrackerConfig::default().with_reindex_lag_ms(1000));

    engine.trigger().await.unwrap();
    assert_eq!(harness.presence(recent), Presence::No);

    harness.clock.advance(5_000);
    engine.trigger().await.unwrap();
    assert_eq!(harness.presence(recent), Presence::Yes);
}

#[derive(Default)]
struct RecordingListener {
    calls: Mutex<Vec<(TimestampMs, TimestampMs)>>,
}

impl TrackerListener for RecordingListener {
    fn indexed_transactions(&self, from_time_inclusive: TimestampMs, to_time_exclusive: TimestampMs) {
        self.calls
            .lock()
            .unwrap()
            .push((from_time_inclusive, to_time_exclusive));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listener_sees_each_non_empty_tick() {
    let harness = TestHarness::new();
    harness.commit_distinct("l", 5, NOW - 100_000, 1000);
    let listener = Arc::new(RecordingListener::default());
    let engine = harness.tracker(&TrackerConfig::default().with_max_record_set_size(2));
    engine.set_listener(Some(listener.clone()));

    engine.trigger().await.unwrap();

    let calls = listener.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls.last().map(|c| c.1), Some(NOW - 96_000));
    assert!(calls.iter().all(|(from, to)| from <= to));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_in_transaction_indexing_disabled_on_start() {
    let harness = TestHarness::new();
    assert!(harness.index.in_transaction_indexing_enabled());
    let engine = harness.tracker(&TrackerConfig::default().with_disable_in_transaction_indexing(true));

    engine.trigger().await.unwrap();
    assert!(!harness.index.in_transaction_indexing_enabled());

    let id = harness.commit(10_000, &["late"]);
    assert!(!harness.index.index_transaction_now(id).unwrap());
    assert_eq!(harness.presence(id), Presence::No);
}

/// A trigger arriving while a run is active returns at once.
#[tokio::test(flavor = "multi_thread")]
async fn test_trigger_while_running_is_skipped() {
    let harness = TestHarness::new();
    harness.commit(20_000, &["slow"]);
    let release = Arc::new(AtomicBool::new(false));
    let gate = release.clone();
    harness.index.set_update_hook(Some(Arc::new(move |_: &NodeRef| {
        while !gate.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    })));

    let engine = Arc::new(harness.tracker(&TrackerConfig::default().with_worker_threads(1)));
    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.trigger().await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(engine.trigger().await.unwrap(), TriggerOutcome::Busy);
    assert_eq!(engine.tracker_state(), TrackerState::Running);

    release.store(true, Ordering::SeqCst);
    assert!(matches!(running.await.unwrap().unwrap(), TriggerOutcome::CaughtUp(_)));
}

/// Shutdown mid-run terminates the run and stops the tracker for good.
#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_during_run() {
    let harness = TestHarness::new();
    harness.commit_distinct("s", 50, NOW - 500_000, 1000);
    let engine = Arc::new(harness.tracker(&TrackerConfig::default().with_max_transactions_per_commit(1)));
    assert_eq!(engine.tracker_state(), TrackerState::NotStarted);

    let stopper = engine.clone();
    let token = harness.shutdown.clone();
    harness.index.set_update_hook(Some(Arc::new(move |node: &NodeRef| {
        if node.id == "s-10" {
            token.cancel();
        }
        Ok(())
    })));

    let outcome = engine.trigger().await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Terminated(_)), "{:?}", outcome);
    assert_eq!(stopper.tracker_state(), TrackerState::Stopped);
    assert!(harness.index.document_count() < 50);

    stopper.shutdown();
    assert_eq!(stopper.tracker_state(), TrackerState::Stopped);
    assert!(matches!(engine.trigger().await.unwrap(), TriggerOutcome::Terminated(_)));
}
