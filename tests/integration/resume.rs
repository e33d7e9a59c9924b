//! Resuming a run from the checkpoint store

use crate::integration::test_utils::{run_options, tasks, PipelineBuilder};
use glossgen::checkpoint::{ClaimOutcome, TaskStatus};
use glossgen::engine::ResultStatus;
use glossgen::error::ProviderError;
use glossgen::provider::ScriptedProvider;
use glossgen::types::TaskKey;
use std::time::Duration;

#[tokio::test]
async fn resume_after_completion_makes_no_calls() {
    let first = PipelineBuilder::new(ScriptedProvider::new()).build();
    let summary = first
        .scheduler
        .run(tasks(&["alpha", "beta"]), run_options(2, false))
        .await
        .unwrap();
    assert_eq!(summary.completed, 4);
    let before = first.store.results().unwrap();
    let dir = first.into_dir();

    let second = PipelineBuilder::new(ScriptedProvider::new())
        .run_id("run-second")
        .in_dir(dir)
        .build();
    let summary = second
        .scheduler
        .run(tasks(&["alpha", "beta"]), run_options(2, true))
        .await
        .unwrap();

    assert_eq!(summary.skipped_done, 4);
    assert_eq!(summary.attempted, 0);
    assert_eq!(second.provider.call_count(), 0);
    assert_eq!(second.store.results().unwrap(), before);
}

#[tokio::test]
async fn orphaned_claim_of_a_dead_run_is_reclaimed() {
    let first = PipelineBuilder::new(ScriptedProvider::new()).build();
    let all = tasks(&["alpha", "beta", "gamma"]);
    first.store.seed(&all).unwrap();
    let orphan = TaskKey::new("beta", "history");
    let claimed = first
        .store
        .claim(&orphan, "run-crashed", Duration::from_secs(1800))
        .unwrap();
    assert!(matches!(claimed, ClaimOutcome::Claimed(_)));
    let dir = first.into_dir();

    let second = PipelineBuilder::new(ScriptedProvider::new())
        .run_id("run-next")
        .in_dir(dir)
        .build();
    let summary = second
        .scheduler
        .run(all, run_options(3, true))
        .await
        .unwrap();

    assert_eq!(summary.completed, 6);
    assert_eq!(summary.claim_conflicts, 0);
    assert_eq!(second.provider.calls_for_task(&orphan), 2);

    let record = second.store.record(&orphan).unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Done);
    assert_eq!(record.attempts, 2);
    assert!(record.owner.is_none());
}

#[tokio::test]
async fn resume_retries_failed_tasks_once_the_cause_is_gone() {
    let first = PipelineBuilder::new(ScriptedProvider::new()).build();
    first
        .provider
        .fail_term("gamma", ProviderError::AuthFailed("expired key".to_string()));
    let summary = first
        .scheduler
        .run(tasks(&["alpha", "beta", "gamma"]), run_options(2, false))
        .await
        .unwrap();
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.completed, 4);
    let dir = first.into_dir();

    let second = PipelineBuilder::new(ScriptedProvider::new())
        .run_id("run-retry")
        .in_dir(dir)
        .build();
    let summary = second
        .scheduler
        .run(tasks(&["alpha", "beta", "gamma"]), run_options(2, true))
        .await
        .unwrap();

    assert_eq!(summary.skipped_done, 4);
    assert_eq!(summary.completed, 2);
    // Only the two gamma tasks were generated again
    assert_eq!(second.provider.call_count(), 4);

    let results = second.store.results().unwrap();
    assert!(results.values().all(|r| r.status == ResultStatus::Completed));
}

#[tokio::test]
async fn fresh_run_discards_previous_progress() {
    let first = PipelineBuilder::new(ScriptedProvider::new()).build();
    first
        .scheduler
        .run(tasks(&["alpha"]), run_options(1, false))
        .await
        .unwrap();
    let dir = first.into_dir();

    let second = PipelineBuilder::new(ScriptedProvider::new())
        .in_dir(dir)
        .build();
    let summary = second
        .scheduler
        .run(tasks(&["alpha"]), run_options(1, false))
        .await
        .unwrap();

    assert_eq!(summary.skipped_done, 0);
    assert_eq!(summary.completed, 2);
    assert_eq!(second.provider.call_count(), 4);
}
