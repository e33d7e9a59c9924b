//! Checkpoint store guarantees under concurrent access

use crate::integration::test_utils::tasks;
use glossgen::checkpoint::{CheckpointStore, ClaimOutcome, TaskStatus};
use glossgen::engine::{GenerationResult, ResultStatus};
use glossgen::stop::{StopReason, StopState, StopStatePersistence};
use glossgen::types::{ComplexityTier, Cost, TaskKey};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const STALENESS: Duration = Duration::from_secs(1800);

fn open() -> (TempDir, CheckpointStore) {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(dir.path().join("checkpoint")).unwrap();
    (dir, store)
}

fn accepted(key: &TaskKey) -> GenerationResult {
    GenerationResult {
        term_id: key.term_id.clone(),
        dimension_id: key.dimension_id.clone(),
        status: ResultStatus::Completed,
        content: Some("A short definition.".to_string()),
        score: Some(8),
        rationale: Some("clear".to_string()),
        improvement_iterations: 0,
        llm_calls: 2,
        provider_attempts: 2,
        input_tokens: 200,
        output_tokens: 100,
        cost: Cost::from_usd(0.001),
        model: Some("gpt-4.1-nano".to_string()),
        tier: ComplexityTier::Simple,
        error: None,
        duration_ms: 12,
        completed_at: chrono::Utc::now(),
    }
}

#[test]
fn exactly_one_of_many_concurrent_claimers_wins() {
    let (_dir, store) = open();
    store.seed(&tasks(&["alpha"])).unwrap();
    let key = TaskKey::new("alpha", "overview");

    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            let key = key.clone();
            thread::spawn(move || {
                barrier.wait();
                store.claim(&key, &format!("run-{}", i), STALENESS).unwrap()
            })
        })
        .collect();
    let outcomes: Vec<ClaimOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners = outcomes
        .iter()
        .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
        .count();
    assert_eq!(winners, 1);
    assert!(outcomes.iter().all(|o| matches!(
        o,
        ClaimOutcome::Claimed(_) | ClaimOutcome::AlreadyClaimed { .. }
    )));

    let record = store.record(&key).unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::InProgress);
    assert_eq!(record.attempts, 1);
}

#[test]
fn every_task_is_claimed_once_across_threads() {
    let (_dir, store) = open();
    let all = tasks(&["a", "b", "c", "d", "e"]);
    store.seed(&all).unwrap();
    let keys: Vec<TaskKey> = all.iter().map(|t| t.key()).collect();

    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            let keys = keys.clone();
            thread::spawn(move || {
                barrier.wait();
                let owner = format!("run-{}", i);
                keys.iter()
                    .filter(|key| {
                        matches!(
                            store.claim(key, &owner, STALENESS).unwrap(),
                            ClaimOutcome::Claimed(_)
                        )
                    })
                    .count()
            })
        })
        .collect();
    let claimed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(claimed, keys.len());
    assert_eq!(store.counts().unwrap().in_progress, keys.len());
}

#[test]
fn done_record_and_result_are_committed_together() {
    let (dir, store) = open();
    store.seed(&tasks(&["alpha"])).unwrap();
    let key = TaskKey::new("alpha", "overview");
    store.claim(&key, "run-1", STALENESS).unwrap();
    assert!(store.result(&key).unwrap().is_none());

    assert!(store.complete(&key, "run-1", &accepted(&key)).unwrap());
    store.flush().unwrap();
    drop(store);

    let reopened = CheckpointStore::open(dir.path().join("checkpoint")).unwrap();
    let record = reopened.record(&key).unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Done);
    assert_eq!(record.result_status, Some(ResultStatus::Completed));
    let result = reopened.result(&key).unwrap().unwrap();
    assert_eq!(result.score, Some(8));

    for record in reopened.records().unwrap() {
        if record.status == TaskStatus::Done {
            let key = TaskKey::new(record.term_id, record.dimension_id);
            assert!(reopened.result(&key).unwrap().is_some());
        }
    }
}

#[test]
fn done_tasks_cannot_be_claimed_again() {
    let (_dir, store) = open();
    store.seed(&tasks(&["alpha"])).unwrap();
    let key = TaskKey::new("alpha", "history");
    store.claim(&key, "run-1", STALENESS).unwrap();
    store.complete(&key, "run-1", &accepted(&key)).unwrap();

    assert_eq!(
        store.claim(&key, "run-2", STALENESS).unwrap(),
        ClaimOutcome::AlreadyDone
    );
    assert_eq!(
        store.claim(&TaskKey::new("zeta", "history"), "run-2", STALENESS).unwrap(),
        ClaimOutcome::Missing
    );
}

#[test]
fn stale_claim_is_taken_over_and_late_completion_is_reported() {
    let (_dir, store) = open();
    store.seed(&tasks(&["alpha"])).unwrap();
    let key = TaskKey::new("alpha", "overview");
    store.claim(&key, "run-slow", STALENESS).unwrap();

    thread::sleep(Duration::from_millis(5));
    let taken = store.claim(&key, "run-fast", Duration::ZERO).unwrap();
    assert!(matches!(taken, ClaimOutcome::Claimed(ref r) if r.attempts == 2));

    assert!(store.complete(&key, "run-fast", &accepted(&key)).unwrap());
    // The slow owner lost its claim; its write still lands
    assert!(!store.complete(&key, "run-slow", &accepted(&key)).unwrap());
    assert_eq!(store.counts().unwrap().done, 1);
}

#[test]
fn persisted_stop_state_blocks_claims_until_cleared() {
    let (dir, store) = open();
    store.seed(&tasks(&["alpha"])).unwrap();
    let state = StopState::new(StopReason::CostCeiling, "over budget");
    assert!(store.persist_stop_state(&state).unwrap());
    // First writer wins
    assert!(!store
        .persist_stop_state(&StopState::new(StopReason::Operator, "later"))
        .unwrap());
    drop(store);

    let reopened = CheckpointStore::open(dir.path().join("checkpoint")).unwrap();
    let loaded = reopened.load_stop_state().unwrap().unwrap();
    assert_eq!(loaded.reason, StopReason::CostCeiling);

    let key = TaskKey::new("alpha", "overview");
    assert_eq!(
        reopened.claim(&key, "run-1", STALENESS).unwrap(),
        ClaimOutcome::Halted
    );

    assert!(reopened.clear_stop_state().unwrap());
    assert!(matches!(
        reopened.claim(&key, "run-1", STALENESS).unwrap(),
        ClaimOutcome::Claimed(_)
    ));
}
