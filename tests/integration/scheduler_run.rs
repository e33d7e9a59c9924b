//! End-to-end runs of the scheduler against a scripted provider

use crate::integration::test_utils::{run_options, tasks, PipelineBuilder};
use glossgen::checkpoint::{export_results, TaskStatus};
use glossgen::engine::{FailureKind, ResultStatus};
use glossgen::error::ProviderError;
use glossgen::provider::ScriptedProvider;
use glossgen::templates::PromptKind;
use glossgen::types::TaskKey;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_terms_two_dimensions_all_complete() {
    let pipeline = PipelineBuilder::new(ScriptedProvider::new()).build();
    pipeline.provider.script_scores("overview", vec![5, 8]);
    pipeline.provider.script_scores("history", vec![9]);

    let summary = pipeline
        .scheduler
        .run(tasks(&["alpha", "beta", "gamma"]), run_options(4, false))
        .await
        .unwrap();

    assert_eq!(summary.total_tasks, 6);
    assert_eq!(summary.completed, 6);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.remaining, 0);
    assert!(!summary.halted());

    let results = pipeline.store.results().unwrap();
    assert_eq!(results.len(), 6);
    for term in ["alpha", "beta", "gamma"] {
        let overview = &results[&TaskKey::new(term, "overview")];
        assert_eq!(overview.status, ResultStatus::Completed);
        assert_eq!(overview.score, Some(8));
        assert_eq!(overview.improvement_iterations, 1);
        assert_eq!(overview.llm_calls, 4);

        let history = &results[&TaskKey::new(term, "history")];
        assert_eq!(history.status, ResultStatus::Completed);
        assert_eq!(history.score, Some(9));
        assert_eq!(history.improvement_iterations, 0);
        assert_eq!(history.llm_calls, 2);
    }

    // 3 x (generate, evaluate, improve, evaluate) + 3 x (generate, evaluate)
    assert_eq!(pipeline.provider.call_count(), 18);
    assert_eq!(pipeline.provider.calls_of_kind(PromptKind::Improvement), 3);

    let counts = pipeline.store.counts().unwrap();
    assert_eq!(counts.done, 6);
    assert_eq!(counts.pending + counts.in_progress + counts.failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_pool_respects_concurrency_bound() {
    let provider = ScriptedProvider::new().with_latency(Duration::from_millis(15));
    let pipeline = PipelineBuilder::new(provider).build();

    let terms: Vec<String> = (0..12).map(|i| format!("term-{}", i)).collect();
    let refs: Vec<&str> = terms.iter().map(String::as_str).collect();
    let summary = pipeline
        .scheduler
        .run(tasks(&refs), run_options(3, false))
        .await
        .unwrap();

    assert_eq!(summary.completed, 24);
    assert!(pipeline.provider.peak_in_flight() <= 3);
    assert!(pipeline.provider.peak_in_flight() >= 2);
}

#[tokio::test]
async fn low_scores_are_kept_below_threshold() {
    let pipeline = PipelineBuilder::new(ScriptedProvider::new()).build();
    pipeline.provider.script_scores("overview", vec![3]);
    pipeline.provider.script_scores("history", vec![4, 6, 5]);

    let summary = pipeline
        .scheduler
        .run(tasks(&["alpha"]), run_options(2, false))
        .await
        .unwrap();

    assert_eq!(summary.completed_below_threshold, 2);
    assert_eq!(summary.remaining, 0);

    let results = pipeline.store.results().unwrap();
    let overview = &results[&TaskKey::new("alpha", "overview")];
    assert_eq!(overview.status, ResultStatus::CompletedBelowThreshold);
    assert_eq!(overview.improvement_iterations, 2);
    assert_eq!(overview.llm_calls, 6);

    // Best draft wins, not the last one
    let history = &results[&TaskKey::new("alpha", "history")];
    assert_eq!(history.score, Some(6));

    let export_path = pipeline.dir.path().join("out").join("results.json");
    let exported = export_results(&pipeline.store, &export_path).unwrap();
    assert_eq!(exported.exported, 2);
    assert_eq!(exported.below_threshold, 2);
    let body: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&export_path).unwrap()).unwrap();
    assert_eq!(body["count"], 2);
}

#[tokio::test]
async fn exhausted_retries_fail_one_task_and_the_run_continues() {
    let pipeline = PipelineBuilder::new(ScriptedProvider::new()).build();
    pipeline.provider.fail_term(
        "gamma",
        ProviderError::ServerError {
            status: 503,
            message: "unavailable".to_string(),
        },
    );

    let summary = pipeline
        .scheduler
        .run(tasks(&["alpha", "beta", "gamma"]), run_options(2, false))
        .await
        .unwrap();

    assert_eq!(summary.completed, 4);
    assert_eq!(summary.failed, 2);
    assert!(!summary.halted());

    let key = TaskKey::new("gamma", "overview");
    let record = pipeline.store.record(&key).unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    let failure = record.last_error.unwrap();
    assert_eq!(failure.kind, FailureKind::TransientExhausted);

    let result = pipeline.store.result(&key).unwrap().unwrap();
    assert_eq!(result.status, ResultStatus::Failed);
    // first attempt plus two retries
    assert_eq!(result.provider_attempts, 3);
    assert!(result.content.is_none());
}
