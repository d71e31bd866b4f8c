//! Engine integration tests
//!
//! Drive the real engine against a temp SQLite store with a scripted
//! classifier standing in for the portal.

mod helpers;

use helpers::*;
use iccid_common::db::{BatchState, RecordStatus};
use iccid_common::events::VerifierEvent;
use iccid_common::time;
use iccid_verifier::browser::{BrowserError, BrowserLauncher};
use iccid_verifier::config::VerifierConfig;
use iccid_verifier::context::VerifierContext;
use iccid_verifier::models::{RunExit, VerificationOutcome};
use iccid_verifier::portal::Classifier;
use iccid_verifier::store::{ProcessClaim, RecordFilter, RecordStore};
use iccid_verifier::VerifyError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BATCH: &str = "LOTE_1";

fn context(
    store: Arc<dyn RecordStore>,
    launcher: Arc<dyn BrowserLauncher>,
    classifier: Arc<ScriptedClassifier>,
) -> VerifierContext {
    context_with(fast_config(), store, launcher, classifier)
}

fn context_with(
    config: VerifierConfig,
    store: Arc<dyn RecordStore>,
    launcher: Arc<dyn BrowserLauncher>,
    classifier: Arc<dyn Classifier>,
) -> VerifierContext {
    VerifierContext::assemble(config, store, launcher, classifier)
}

async fn status_of(store: &dyn RecordStore, n: u64) -> RecordStatus {
    let records = store
        .fetch_records(&RecordFilter::batch(BATCH), 0, 100)
        .await
        .unwrap();
    records
        .into_iter()
        .find(|r| r.identifier_full == sample_iccid(n))
        .map(|r| r.status)
        .unwrap()
}

#[tokio::test]
async fn test_batch_of_three_completes_with_mixed_outcomes() {
    let (_temp_dir, store) = create_test_store().await;
    load_records(store.as_ref(), BATCH, &[1, 2, 3]).await;

    let classifier = Arc::new(
        ScriptedClassifier::new()
            .answer(key(1), Ok(VerificationOutcome::inactive()))
            .answer(key(2), Ok(VerificationOutcome::active("2281115989")))
            .answer(key(3), Err(BrowserError::Transport("session reset".into())))
            .answer(key(3), Err(BrowserError::Transport("session reset".into())))
            .answer(key(3), Ok(VerificationOutcome::active("5551234567"))),
    );
    let launcher = Arc::new(NullLauncher::default());
    let ctx = context(store.clone(), launcher.clone(), classifier.clone());
    let mut events = ctx.event_bus.subscribe();

    let summary = ctx
        .engine
        .run(BATCH, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.exit, RunExit::Completed);
    assert_eq!(summary.target, 3);
    assert_eq!(summary.tallies.processed, 3);
    assert_eq!(summary.tallies.active, 2);
    assert_eq!(summary.tallies.inactive, 1);
    assert_eq!(summary.tallies.errors, 0);
    assert_eq!(classifier.attempts_for(&key(3)), 3);

    let process = store.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.state, BatchState::Completed);
    assert_eq!(process.progress_current, 3);
    assert_eq!(process.progress_total, 3);
    assert_eq!(process.active_count, 2);
    assert_eq!(process.inactive_count, 1);
    assert_eq!(process.error_count, 0);
    assert_eq!(process.owner, None);
    assert_eq!(process.claim_expires_at_ms, None);

    let records = store
        .fetch_records(&RecordFilter::batch(BATCH), 0, 10)
        .await
        .unwrap();
    assert_eq!(records[0].status, RecordStatus::Inactive);
    assert_eq!(records[0].assigned_number, None);
    assert_eq!(records[1].status, RecordStatus::Active);
    assert_eq!(records[1].assigned_number.as_deref(), Some("2281115989"));
    assert_eq!(records[2].assigned_number.as_deref(), Some("5551234567"));
    assert!(records.iter().all(|r| r.verified_at.is_some()));

    // One browser for the whole run, closed at the end
    assert_eq!(launcher.launches(), 1);
    assert_eq!(launcher.closes(), 1);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(VerifierEvent::BatchLaunched { total: 3, .. })));
    let verified: Vec<u64> = seen
        .iter()
        .filter_map(|e| match e {
            VerifierEvent::RecordVerified { current, .. } => Some(*current),
            _ => None,
        })
        .collect();
    assert_eq!(verified, vec![1, 2, 3]);
    assert!(matches!(
        seen.last(),
        Some(VerifierEvent::BatchFinished {
            state: BatchState::Completed,
            processed: 3,
            ..
        })
    ));
}

#[tokio::test]
async fn test_cap_below_pending_ends_incomplete() {
    let (_temp_dir, store) = create_test_store().await;
    load_records(store.as_ref(), BATCH, &[1, 2, 3]).await;

    let classifier = Arc::new(ScriptedClassifier::new());
    let ctx = context(store.clone(), Arc::new(NullLauncher::default()), classifier.clone());

    let summary = ctx
        .engine
        .run(BATCH, Some(2), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.exit, RunExit::Incomplete);
    assert_eq!(summary.target, 2);
    assert_eq!(summary.tallies.processed, 2);
    assert_eq!(classifier.calls(), vec![key(1), key(2)]);

    let process = store.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.state, BatchState::Incomplete);
    assert_eq!(process.progress_total, 2);
    assert_eq!(process.progress_current, 2);
    assert_eq!(status_of(store.as_ref(), 3).await, RecordStatus::Pending);
}

#[tokio::test]
async fn test_relaunch_picks_up_remaining_records() {
    let (_temp_dir, store) = create_test_store().await;
    load_records(store.as_ref(), BATCH, &[1, 2, 3]).await;

    let classifier = Arc::new(ScriptedClassifier::new());
    let ctx = context(store.clone(), Arc::new(NullLauncher::default()), classifier.clone());

    ctx.engine
        .run(BATCH, Some(2), CancellationToken::new())
        .await
        .unwrap();
    let summary = ctx
        .engine
        .run(BATCH, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.exit, RunExit::Completed);
    assert_eq!(summary.target, 1);
    assert_eq!(classifier.attempts_for(&key(3)), 1);
    assert_eq!(classifier.calls().len(), 3);

    // Tallies restart with every launch
    let process = store.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.state, BatchState::Completed);
    assert_eq!(process.progress_current, 1);
    assert_eq!(process.progress_total, 1);
}

#[tokio::test]
async fn test_no_pending_records_launches_nothing() {
    let (_temp_dir, store) = create_test_store().await;
    let ctx = context(
        store.clone(),
        Arc::new(NullLauncher::default()),
        Arc::new(ScriptedClassifier::new()),
    );

    let result = ctx.engine.run(BATCH, None, CancellationToken::new()).await;

    assert!(matches!(result, Err(VerifyError::NoPendingRecords(_))));
    assert!(store.get_process(BATCH).await.unwrap().is_none());
}

#[tokio::test]
async fn test_zero_cap_is_rejected() {
    let (_temp_dir, store) = create_test_store().await;
    load_records(store.as_ref(), BATCH, &[1]).await;
    let ctx = context(
        store.clone(),
        Arc::new(NullLauncher::default()),
        Arc::new(ScriptedClassifier::new()),
    );

    let result = ctx.engine.run(BATCH, Some(0), CancellationToken::new()).await;

    assert!(matches!(result, Err(VerifyError::InvalidInput(_))));
    assert!(store.get_process(BATCH).await.unwrap().is_none());
}

#[tokio::test]
async fn test_stop_during_first_record_ends_run() {
    let (_temp_dir, store) = create_test_store().await;
    load_records(store.as_ref(), BATCH, &[1, 2, 3]).await;

    let classifier = Arc::new(ScriptedClassifier::new().on_key(
        key(1),
        Hook::Transition {
            store: store.clone(),
            batch: BATCH.to_string(),
            from: BatchState::Running,
            to: BatchState::Stopped,
        },
    ));
    let ctx = context(store.clone(), Arc::new(NullLauncher::default()), classifier.clone());

    let summary = ctx
        .engine
        .run(BATCH, None, CancellationToken::new())
        .await
        .unwrap();

    // The record in flight still completes
    assert_eq!(summary.exit, RunExit::Stopped);
    assert_eq!(summary.tallies.processed, 1);
    assert_eq!(classifier.calls(), vec![key(1)]);
    assert_eq!(status_of(store.as_ref(), 1).await, RecordStatus::Inactive);
    assert_eq!(status_of(store.as_ref(), 2).await, RecordStatus::Pending);

    let process = store.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.state, BatchState::Stopped);
    assert_eq!(process.progress_current, 1);
    assert_eq!(process.owner, None);
}

#[tokio::test]
async fn test_stop_during_last_record_wins_over_completed() {
    let (_temp_dir, store) = create_test_store().await;
    load_records(store.as_ref(), BATCH, &[1]).await;

    let classifier = Arc::new(ScriptedClassifier::new().on_key(
        key(1),
        Hook::Transition {
            store: store.clone(),
            batch: BATCH.to_string(),
            from: BatchState::Running,
            to: BatchState::Stopped,
        },
    ));
    let ctx = context(store.clone(), Arc::new(NullLauncher::default()), classifier);

    let summary = ctx
        .engine
        .run(BATCH, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.exit, RunExit::Stopped);
    let process = store.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.state, BatchState::Stopped);
}

#[tokio::test]
async fn test_pause_blocks_until_resume() {
    let (_temp_dir, store) = create_test_store().await;
    load_records(store.as_ref(), BATCH, &[1, 2, 3]).await;

    let classifier = Arc::new(ScriptedClassifier::new().on_key(
        key(1),
        Hook::Transition {
            store: store.clone(),
            batch: BATCH.to_string(),
            from: BatchState::Running,
            to: BatchState::Paused,
        },
    ));
    let ctx = context(store.clone(), Arc::new(NullLauncher::default()), classifier.clone());

    let engine = ctx.engine.clone();
    let run = tokio::spawn(async move {
        engine.run(BATCH, None, CancellationToken::new()).await
    });

    // Wait for the first record to land while paused
    for _ in 0..200 {
        let process = store.get_process(BATCH).await.unwrap();
        if process.map(|p| p.progress_current == 1).unwrap_or(false) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let process = store.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.state, BatchState::Paused);
    assert!(process.owner.is_some(), "paused run keeps its claim");
    assert_eq!(classifier.calls(), vec![key(1)]);

    let resumed = ctx.lifecycle.resume(BATCH).await.unwrap();
    assert_eq!(resumed.state, BatchState::Running);

    let summary = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(summary.exit, RunExit::Completed);
    assert_eq!(summary.tallies.processed, 3);
    let process = store.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.state, BatchState::Completed);
}

#[tokio::test]
async fn test_cancellation_releases_claim_and_keeps_state() {
    let (_temp_dir, store) = create_test_store().await;
    load_records(store.as_ref(), BATCH, &[1, 2, 3]).await;

    let cancel = CancellationToken::new();
    let classifier = Arc::new(ScriptedClassifier::new().on_key(key(1), Hook::Cancel(cancel.clone())));
    let ctx = context(store.clone(), Arc::new(NullLauncher::default()), classifier);

    let summary = ctx.engine.run(BATCH, None, cancel).await.unwrap();

    assert_eq!(summary.exit, RunExit::Interrupted);
    assert_eq!(summary.tallies.processed, 1);

    let process = store.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.state, BatchState::Running);
    assert_eq!(process.owner, None);
    assert_eq!(process.claim_expires_at_ms, None);
}

#[tokio::test]
async fn test_lost_row_abandons_run_without_writes() {
    let (_temp_dir, store) = create_test_store().await;
    load_records(store.as_ref(), BATCH, &[1, 2]).await;

    let classifier = Arc::new(ScriptedClassifier::new().on_key(
        key(1),
        Hook::DeleteProcess {
            store: store.clone(),
            batch: BATCH.to_string(),
        },
    ));
    let ctx = context(store.clone(), Arc::new(NullLauncher::default()), classifier.clone());

    let summary = ctx
        .engine
        .run(BATCH, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.exit, RunExit::Abandoned);
    assert_eq!(classifier.calls(), vec![key(1)]);
    assert!(store.get_process(BATCH).await.unwrap().is_none());
}

#[tokio::test]
async fn test_live_claim_blocks_second_run() {
    let (_temp_dir, store) = create_test_store().await;
    load_records(store.as_ref(), BATCH, &[1]).await;

    let now_ms = time::epoch_ms(&time::now());
    store
        .launch_process(&ProcessClaim {
            batch: BATCH.to_string(),
            owner: "other-run".to_string(),
            total: 1,
            lease_until_ms: now_ms + 60_000,
            now_ms,
        })
        .await
        .unwrap()
        .unwrap();

    let classifier = Arc::new(ScriptedClassifier::new());
    let ctx = context(store.clone(), Arc::new(NullLauncher::default()), classifier.clone());

    let result = ctx.engine.run(BATCH, None, CancellationToken::new()).await;

    assert!(matches!(result, Err(VerifyError::AlreadyClaimed { .. })));
    assert!(classifier.calls().is_empty());
    let process = store.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.owner.as_deref(), Some("other-run"));
}

#[tokio::test]
async fn test_expired_claim_is_taken_over() {
    let (_temp_dir, store) = create_test_store().await;
    load_records(store.as_ref(), BATCH, &[1]).await;

    let now_ms = time::epoch_ms(&time::now());
    store
        .launch_process(&ProcessClaim {
            batch: BATCH.to_string(),
            owner: "crashed-run".to_string(),
            total: 1,
            lease_until_ms: now_ms - 1,
            now_ms: now_ms - 60_000,
        })
        .await
        .unwrap()
        .unwrap();

    let ctx = context(
        store.clone(),
        Arc::new(NullLauncher::default()),
        Arc::new(ScriptedClassifier::new()),
    );

    let summary = ctx
        .engine
        .run(BATCH, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.exit, RunExit::Completed);
    let process = store.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.state, BatchState::Completed);
}

#[tokio::test]
async fn test_browser_launch_failure_marks_error() {
    let (_temp_dir, store) = create_test_store().await;
    load_records(store.as_ref(), BATCH, &[1, 2]).await;

    let ctx = context(
        store.clone(),
        Arc::new(FailingLauncher),
        Arc::new(ScriptedClassifier::new()),
    );
    let mut events = ctx.event_bus.subscribe();

    let result = ctx.engine.run(BATCH, None, CancellationToken::new()).await;

    assert!(matches!(result, Err(VerifyError::Browser(_))));
    let process = store.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.state, BatchState::Error);
    assert_eq!(process.owner, None);
    assert_eq!(status_of(store.as_ref(), 1).await, RecordStatus::Pending);

    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        if let VerifierEvent::BatchFinished { state, .. } = event {
            finished = Some(state);
        }
    }
    assert_eq!(finished, Some(BatchState::Error));
}

#[tokio::test]
async fn test_empty_chunks_are_retried_while_records_pending() {
    let (_temp_dir, sqlite) = create_test_store().await;
    load_records(sqlite.as_ref(), BATCH, &[1, 2]).await;

    let store: Arc<dyn RecordStore> = Arc::new(FaultyStore::new(sqlite.clone()).with_empty_fetches(2));
    let ctx = context(store, Arc::new(NullLauncher::default()), Arc::new(ScriptedClassifier::new()));

    let summary = ctx
        .engine
        .run(BATCH, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.exit, RunExit::Completed);
    assert_eq!(summary.tallies.processed, 2);
}

#[tokio::test]
async fn test_persistently_empty_chunks_end_incomplete() {
    let (_temp_dir, sqlite) = create_test_store().await;
    load_records(sqlite.as_ref(), BATCH, &[1, 2]).await;

    let store: Arc<dyn RecordStore> =
        Arc::new(FaultyStore::new(sqlite.clone()).with_empty_fetches(1_000));
    let classifier = Arc::new(ScriptedClassifier::new());
    let ctx = context(store, Arc::new(NullLauncher::default()), classifier.clone());

    let summary = ctx
        .engine
        .run(BATCH, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.exit, RunExit::Incomplete);
    assert_eq!(summary.tallies.processed, 0);
    assert!(classifier.calls().is_empty());
    let process = sqlite.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.state, BatchState::Incomplete);
}

#[tokio::test]
async fn test_failed_outcome_write_leaves_record_pending() {
    let (_temp_dir, sqlite) = create_test_store().await;
    load_records(sqlite.as_ref(), BATCH, &[1, 2, 3]).await;

    let store: Arc<dyn RecordStore> =
        Arc::new(FaultyStore::new(sqlite.clone()).with_failing_outcome(sample_iccid(2)));
    let classifier = Arc::new(ScriptedClassifier::new());
    let ctx = context(store, Arc::new(NullLauncher::default()), classifier.clone());

    let summary = ctx
        .engine
        .run(BATCH, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.exit, RunExit::Incomplete);
    assert_eq!(summary.tallies.processed, 2);
    assert_eq!(classifier.attempts_for(&key(2)), 1);
    assert_eq!(status_of(sqlite.as_ref(), 1).await, RecordStatus::Inactive);
    assert_eq!(status_of(sqlite.as_ref(), 2).await, RecordStatus::Pending);
    assert_eq!(status_of(sqlite.as_ref(), 3).await, RecordStatus::Inactive);

    let process = sqlite.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.state, BatchState::Incomplete);
    assert_eq!(process.progress_current, 2);
}

#[tokio::test]
async fn test_exhausted_retries_count_as_error() {
    let (_temp_dir, store) = create_test_store().await;
    load_records(store.as_ref(), BATCH, &[1]).await;

    let mut classifier = ScriptedClassifier::new();
    for _ in 0..3 {
        classifier = classifier.answer(key(1), Err(BrowserError::Timeout("script timeout".into())));
    }
    let classifier = Arc::new(classifier);
    let ctx = context(store.clone(), Arc::new(NullLauncher::default()), classifier.clone());

    let summary = ctx
        .engine
        .run(BATCH, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.exit, RunExit::Completed);
    assert_eq!(summary.tallies.errors, 1);
    assert_eq!(classifier.attempts_for(&key(1)), 3);

    let records = store
        .fetch_records(&RecordFilter::batch(BATCH), 0, 1)
        .await
        .unwrap();
    assert_eq!(records[0].status, RecordStatus::Error);
    assert!(records[0]
        .notes
        .as_deref()
        .unwrap()
        .starts_with("automation failure after 3 attempts"));
}

#[tokio::test]
async fn test_stop_landing_with_cancellation_is_finalized_as_stop() {
    let (_temp_dir, sqlite) = create_test_store().await;
    load_records(sqlite.as_ref(), BATCH, &[1, 2, 3]).await;

    let cancel = CancellationToken::new();
    let store: Arc<dyn RecordStore> =
        Arc::new(FaultyStore::new(sqlite.clone()).with_stop_behind_cancel(cancel.clone()));
    let classifier = Arc::new(ScriptedClassifier::new().on_key(key(1), Hook::Cancel(cancel.clone())));
    let ctx = context(store, Arc::new(NullLauncher::default()), classifier.clone());
    let mut events = ctx.event_bus.subscribe();

    let summary = ctx.engine.run(BATCH, None, cancel).await.unwrap();

    assert_eq!(summary.exit, RunExit::Stopped);
    assert_eq!(summary.tallies.processed, 1);
    assert_eq!(classifier.calls(), vec![key(1)]);
    assert_eq!(status_of(sqlite.as_ref(), 2).await, RecordStatus::Pending);

    let process = sqlite.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.state, BatchState::Stopped);
    assert_eq!(process.owner, None);

    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    assert!(matches!(
        last,
        Some(VerifierEvent::BatchFinished {
            state: BatchState::Stopped,
            processed: 1,
            ..
        })
    ));
}

#[tokio::test]
async fn test_lost_browser_session_is_relaunched() {
    let (_temp_dir, store) = create_test_store().await;
    load_records(store.as_ref(), BATCH, &[1, 2, 3, 4, 5]).await;

    // The first browser crashes after serving record 1
    let launcher = Arc::new(NullLauncher::crashing_after(1));
    let classifier = Arc::new(PageReadingClassifier::default());
    let ctx = context_with(fast_config(), store.clone(), launcher.clone(), classifier.clone());

    let summary = ctx
        .engine
        .run(BATCH, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.exit, RunExit::Completed);
    assert_eq!(summary.tallies.processed, 5);
    assert_eq!(summary.tallies.inactive, 5);
    assert_eq!(summary.tallies.errors, 0);
    // Record 2 failed once on the dead session and once more on the new one
    assert_eq!(classifier.calls(), 6);
    assert_eq!(launcher.launches(), 2);
    assert_eq!(launcher.closes(), 2);

    for n in 1..=5 {
        assert_eq!(status_of(store.as_ref(), n).await, RecordStatus::Inactive);
    }
    let process = store.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.state, BatchState::Completed);
    assert_eq!(process.error_count, 0);
}

#[tokio::test]
async fn test_pages_cross_chunk_boundaries_in_id_order() {
    let (_temp_dir, sqlite) = create_test_store().await;
    load_records(sqlite.as_ref(), BATCH, &[1, 2, 3, 4, 5]).await;

    let mut config = fast_config();
    config.engine.chunk_size = 2;
    let store: Arc<dyn RecordStore> =
        Arc::new(FaultyStore::new(sqlite.clone()).with_failing_outcome(sample_iccid(2)));
    let classifier = Arc::new(ScriptedClassifier::new());
    let ctx = context_with(
        config,
        store,
        Arc::new(NullLauncher::default()),
        classifier.clone(),
    );

    let summary = ctx
        .engine
        .run(BATCH, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.exit, RunExit::Incomplete);
    assert_eq!(summary.target, 5);
    assert_eq!(summary.tallies.processed, 4);
    assert_eq!(
        classifier.calls(),
        vec![key(1), key(2), key(3), key(4), key(5)]
    );
    assert_eq!(status_of(sqlite.as_ref(), 2).await, RecordStatus::Pending);
    for n in [1, 3, 4, 5] {
        assert_eq!(status_of(sqlite.as_ref(), n).await, RecordStatus::Inactive);
    }

    let process = sqlite.get_process(BATCH).await.unwrap().unwrap();
    assert_eq!(process.state, BatchState::Incomplete);
    assert_eq!(process.progress_current, 4);
}

#[tokio::test]
async fn test_claim_stays_live_through_a_slow_record() {
    let (_temp_dir, store) = create_test_store().await;
    load_records(store.as_ref(), BATCH, &[1]).await;

    let mut config = fast_config();
    config.engine.claim_lease_ms = 300;
    let classifier = Arc::new(
        ScriptedClassifier::new().on_key(key(1), Hook::Delay(Duration::from_millis(1_000))),
    );
    let ctx = context_with(
        config,
        store.clone(),
        Arc::new(NullLauncher::default()),
        classifier,
    );

    let engine = Arc::clone(&ctx.engine);
    let run = tokio::spawn(async move { engine.run(BATCH, None, CancellationToken::new()).await });

    // Well past the initial lease, still inside the record
    tokio::time::sleep(Duration::from_millis(600)).await;
    let second = ctx.engine.prepare(BATCH, None).await;
    assert!(matches!(second, Err(VerifyError::AlreadyClaimed { .. })));

    let process = store.get_process(BATCH).await.unwrap().unwrap();
    assert!(process.has_live_claim(time::epoch_ms(&time::now())));

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.exit, RunExit::Completed);
    assert_eq!(summary.tallies.processed, 1);
}
