//! Cost accounting stays exact under concurrency

use crate::integration::test_utils::{cent_per_token_models, run_options, tasks, PipelineBuilder};
use glossgen::ledger::{ModelRates, UsageLedger};
use glossgen::provider::ScriptedProvider;
use glossgen::types::Cost;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn concurrent_records_sum_exactly() {
    let rates = ModelRates::per_million_usd(0.15, 0.60);
    let prices = HashMap::from([("model-a".to_string(), rates)]);
    let ledger = Arc::new(UsageLedger::new(prices));

    let threads = 8;
    let per_thread = 250;
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                for j in 0..per_thread {
                    ledger.record("model-a", 100 + i, 40 + j);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let expected: Cost = (0..threads)
        .flat_map(|i| (0..per_thread).map(move |j| rates.cost_of(100 + i, 40 + j)))
        .sum();
    assert_eq!(ledger.total_cost(), expected);
    assert_eq!(ledger.run_cost(), expected);

    let snapshot = ledger.snapshot();
    let usage = &snapshot.by_model["model-a"];
    assert_eq!(usage.calls, threads * per_thread);
}

#[test]
fn baseline_is_carried_into_the_total_only() {
    let rates = ModelRates::per_million_usd(1.0, 1.0);
    let prices = HashMap::from([("m".to_string(), rates)]);
    let ledger = UsageLedger::with_baseline(prices, Cost::from_usd(2.5));

    let charged = ledger.record("m", 1_000_000, 0);
    assert_eq!(charged, Cost::from_usd(1.0));
    assert_eq!(ledger.run_cost(), Cost::from_usd(1.0));
    assert_eq!(ledger.total_cost(), Cost::from_usd(3.5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_cost_matches_the_sum_of_result_costs() {
    let provider = ScriptedProvider::new().with_latency(Duration::from_millis(2));
    let pipeline = PipelineBuilder::new(provider)
        .models(cent_per_token_models())
        .thresholds(glossgen::stop::StopThresholds {
            max_total_cost_usd: 1_000.0,
            ..Default::default()
        })
        .build();
    pipeline.provider.script_scores("overview", vec![4, 9]);

    let terms: Vec<String> = (0..10).map(|i| format!("t{}", i)).collect();
    let refs: Vec<&str> = terms.iter().map(String::as_str).collect();
    let summary = pipeline
        .scheduler
        .run(tasks(&refs), run_options(6, false))
        .await
        .unwrap();
    assert_eq!(summary.completed, 20);

    let results = pipeline.store.results().unwrap();
    let from_results: Cost = results.values().map(|r| r.cost).sum();
    assert_eq!(from_results, pipeline.ledger.run_cost());
    assert_eq!(summary.run_cost, from_results);

    // overview: 4 calls, history: 2 calls, $1.50 each
    let per_call = Cost::from_usd(1.5);
    assert_eq!(from_results, per_call.times(10 * (4 + 2)));
    assert_eq!(pipeline.store.load_spend().unwrap(), from_results);
}
