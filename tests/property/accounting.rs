//! Ledger totals are exact sums of per-call costs

use glossgen::ledger::{ModelRates, UsageLedger};
use glossgen::types::Cost;
use proptest::prelude::*;
use std::collections::HashMap;

/// Recording calls in any order yields the same exact total.
#[test]
fn test_ledger_total_is_order_independent_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(
                prop::collection::vec((0u64..50_000, 0u64..20_000, 0usize..3), 0..40),
                0.0f64..20.0,
                0.0f64..80.0,
            ),
            |(calls, input_rate, output_rate)| {
                let models = ["small", "medium", "large"];
                let rates = ModelRates::per_million_usd(input_rate, output_rate);
                let prices: HashMap<String, ModelRates> =
                    models.iter().map(|m| (m.to_string(), rates)).collect();

                let forward = UsageLedger::new(prices.clone());
                let backward = UsageLedger::new(prices);
                for (input, output, model) in &calls {
                    forward.record(models[*model], *input, *output);
                }
                for (input, output, model) in calls.iter().rev() {
                    backward.record(models[*model], *input, *output);
                }

                let expected: Cost = calls
                    .iter()
                    .map(|(input, output, _)| rates.cost_of(*input, *output))
                    .sum();
                prop_assert_eq!(forward.total_cost(), expected);
                prop_assert_eq!(backward.total_cost(), expected);

                let snapshot = forward.snapshot();
                let by_model: Cost = snapshot.by_model.values().map(|u| u.cost).sum();
                prop_assert_eq!(by_model, expected);
                Ok(())
            },
        )
        .unwrap();
}
