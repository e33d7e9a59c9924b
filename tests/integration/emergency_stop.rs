//! Emergency stop behaviour across a live run and a restart

use crate::integration::test_utils::{
    cent_per_token_models, run_options, tasks, tasks_for, PipelineBuilder,
};
use glossgen::checkpoint::{ClaimOutcome, TaskStatus};
use glossgen::engine::EngineConfig;
use glossgen::error::ProviderError;
use glossgen::provider::ScriptedProvider;
use glossgen::scheduler::InFlightPolicy;
use glossgen::stop::{write_stop_request, StopReason, StopStatePersistence, StopThresholds};
use glossgen::types::{ComplexityTier, Cost};
use std::time::Duration;

fn ceiling(usd: f64) -> StopThresholds {
    StopThresholds {
        max_total_cost_usd: usd,
        ..StopThresholds::default()
    }
}

#[tokio::test]
async fn cost_breach_halts_dispatch_and_survives_restart() {
    // Each task costs $3.00: two calls at $1.50.
    let pipeline = PipelineBuilder::new(ScriptedProvider::new())
        .models(cent_per_token_models())
        .thresholds(ceiling(7.0))
        .build();

    let summary = pipeline
        .scheduler
        .run(tasks(&["alpha", "beta", "gamma"]), run_options(1, false))
        .await
        .unwrap();

    // $6 after two tasks is under the ceiling; $9 after the third is not.
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.remaining, 3);
    assert_eq!(summary.halt_reason, Some(StopReason::CostCeiling));
    assert_eq!(pipeline.ledger.total_cost(), Cost::from_usd(9.0));

    // Nothing was claimed after the breach.
    let untouched: Vec<_> = pipeline
        .store
        .records()
        .unwrap()
        .into_iter()
        .filter(|r| r.status != TaskStatus::Done)
        .collect();
    assert_eq!(untouched.len(), 3);
    assert!(untouched
        .iter()
        .all(|r| r.status == TaskStatus::Pending && r.attempts == 0));

    let spend = pipeline.store.load_spend().unwrap();
    let dir = pipeline.into_dir();

    // A restarted process sees the persisted stop before doing anything.
    let restarted = PipelineBuilder::new(ScriptedProvider::new())
        .models(cent_per_token_models())
        .thresholds(ceiling(7.0))
        .baseline(spend)
        .run_id("run-restarted")
        .in_dir(dir)
        .build();
    assert!(restarted.controller.is_stopped());
    let state = restarted.controller.state().unwrap();
    assert_eq!(state.reason, StopReason::CostCeiling);

    let pending = restarted
        .store
        .records()
        .unwrap()
        .into_iter()
        .find(|r| r.status == TaskStatus::Pending)
        .unwrap();
    let key = glossgen::types::TaskKey::new(pending.term_id, pending.dimension_id);
    assert_eq!(
        restarted
            .store
            .claim(&key, "run-restarted", Duration::from_secs(60))
            .unwrap(),
        ClaimOutcome::Halted
    );

    let summary = restarted
        .scheduler
        .run(tasks(&["alpha", "beta", "gamma"]), run_options(1, true))
        .await
        .unwrap();
    assert_eq!(summary.attempted, 0);
    assert_eq!(restarted.provider.call_count(), 0);
    let dir = restarted.into_dir();

    // Operator raises the ceiling and acknowledges.
    let resumed = PipelineBuilder::new(ScriptedProvider::new())
        .models(cent_per_token_models())
        .thresholds(ceiling(100.0))
        .baseline(spend)
        .run_id("run-resumed")
        .in_dir(dir)
        .build();
    assert!(resumed.controller.acknowledge().unwrap());
    assert!(!resumed.controller.is_stopped());

    let summary = resumed
        .scheduler
        .run(tasks(&["alpha", "beta", "gamma"]), run_options(2, true))
        .await
        .unwrap();
    assert_eq!(summary.skipped_done, 3);
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.remaining, 0);
    assert_eq!(resumed.provider.call_count(), 6);
    assert_eq!(resumed.store.load_spend().unwrap(), Cost::from_usd(18.0));
}

#[tokio::test]
async fn failure_rate_trips_after_minimum_samples() {
    let provider = ScriptedProvider::new();
    provider.fail_dimension("history", ProviderError::AuthFailed("revoked".to_string()));
    let pipeline = PipelineBuilder::new(provider)
        .thresholds(StopThresholds {
            max_failure_rate: 0.5,
            failure_window: 10,
            min_failure_samples: 4,
            ..StopThresholds::default()
        })
        .build();

    let terms = ["a", "b", "c", "d", "e", "f", "g", "h"];
    let summary = pipeline
        .scheduler
        .run(
            tasks_for(&terms, &[("history", ComplexityTier::Moderate)]),
            run_options(1, false),
        )
        .await
        .unwrap();

    assert_eq!(summary.halt_reason, Some(StopReason::FailureRate));
    assert_eq!(summary.failed, 4);
    assert_eq!(summary.remaining, 4);
    let persisted = pipeline.store.load_stop_state().unwrap().unwrap();
    assert_eq!(persisted.reason, StopReason::FailureRate);
}

#[tokio::test]
async fn sustained_low_quality_trips_the_floor() {
    let pipeline = PipelineBuilder::new(ScriptedProvider::new().with_default_score(2))
        .engine(EngineConfig {
            max_improvement_iterations: 0,
            ..EngineConfig::default()
        })
        .thresholds(StopThresholds {
            min_rolling_quality: 5.0,
            quality_window: 3,
            quality_consecutive: 2,
            ..StopThresholds::default()
        })
        .build();

    let summary = pipeline
        .scheduler
        .run(tasks(&["a", "b", "c", "d"]), run_options(1, false))
        .await
        .unwrap();

    assert_eq!(summary.halt_reason, Some(StopReason::QualityFloor));
    assert_eq!(summary.completed_below_threshold, 2);
    assert_eq!(summary.remaining, 6);
}

#[tokio::test]
async fn operator_stop_file_halts_the_run() {
    let pipeline = PipelineBuilder::new(ScriptedProvider::new()).build();
    let stop_file = pipeline.dir.path().join("STOP");
    write_stop_request(&stop_file, "maintenance window").unwrap();

    let controller = glossgen::stop::EmergencyStopController::new(
        StopThresholds::default(),
        pipeline.ledger.clone(),
        std::sync::Arc::new(pipeline.store.clone()),
    )
    .unwrap()
    .with_stop_file(&stop_file);

    let state = controller.check().unwrap();
    assert_eq!(state.reason, StopReason::Operator);
    assert_eq!(state.message, "maintenance window");

    assert!(controller.acknowledge().unwrap());
    assert!(!stop_file.exists());
    assert!(controller.check().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_policy_returns_in_flight_tasks_to_pending() {
    let provider = ScriptedProvider::new().with_latency(Duration::from_millis(40));
    let pipeline = PipelineBuilder::new(provider).build();

    let controller = pipeline.controller.clone();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        controller.request_stop("operator abort");
    });

    let mut options = run_options(2, false);
    options.in_flight = InFlightPolicy::Cancel;
    let summary = pipeline
        .scheduler
        .run(tasks(&["a", "b", "c", "d", "e", "f"]), options)
        .await
        .unwrap();
    stopper.await.unwrap();

    assert_eq!(summary.halt_reason, Some(StopReason::Operator));
    let counts = pipeline.store.counts().unwrap();
    assert_eq!(counts.in_progress, 0);
    assert_eq!(counts.done + counts.pending, 12);
    assert_eq!(summary.finished() + summary.cancelled, summary.attempted);
}
