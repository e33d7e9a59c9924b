//! The generate-evaluate-improve loop terminates for any evaluator behaviour

use glossgen::engine::{parse_evaluation, EngineConfig, GenerationEngine, ResultStatus, TaskOutcome};
use glossgen::ledger::UsageLedger;
use glossgen::provider::{RetryPolicy, RetryingClient, ScriptedProvider};
use glossgen::selector::{ModelSelector, ModelsConfig};
use glossgen::templates::{DimensionTemplate, PromptKind, TemplateStore};
use glossgen::types::{ComplexityTier, Task, Term};
use proptest::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn engine(provider: Arc<ScriptedProvider>, threshold: u8, max_iterations: u32) -> GenerationEngine {
    let models = ModelsConfig::default();
    let ledger = Arc::new(UsageLedger::new(models.price_table()));
    let client = Arc::new(RetryingClient::new(provider, Arc::clone(&ledger), RetryPolicy::default()));
    let selector = Arc::new(ModelSelector::new(&models, ledger, None));
    let templates = Arc::new(
        TemplateStore::from_dimensions(vec![DimensionTemplate::new("d", ComplexityTier::Simple)])
            .unwrap(),
    );
    GenerationEngine::new(
        client,
        selector,
        templates,
        EngineConfig {
            acceptance_threshold: threshold,
            max_improvement_iterations: max_iterations,
            ..EngineConfig::default()
        },
    )
}

/// Score the scripted evaluator gives on its n-th evaluation
fn nth_score(scores: &[u8], n: usize) -> u8 {
    scores.get(n).or_else(|| scores.last()).copied().unwrap_or(0)
}

/// Any score sequence, including a constant 0, ends the loop within
/// `max + 1` evaluations. The outcome matches the first acceptable draft or
/// the best one seen.
#[test]
fn test_quality_loop_terminates_property() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(
                prop::collection::vec(0u8..=10, 1..8),
                1u8..=10,
                0u32..5,
            ),
            |(scores, threshold, max_iterations)| {
                let provider = Arc::new(ScriptedProvider::new());
                provider.script_scores("d", scores.clone());
                let engine = engine(Arc::clone(&provider), threshold, max_iterations);
                let task = Task {
                    term: Arc::new(Term::new("t")),
                    dimension_id: "d".to_string(),
                    complexity: ComplexityTier::Simple,
                };

                let outcome =
                    runtime.block_on(engine.process(&task, &CancellationToken::new()));
                let TaskOutcome::Finished(result) = outcome else {
                    return Err(TestCaseError::fail("task was not finished"));
                };

                prop_assert!(result.improvement_iterations <= max_iterations);
                prop_assert_eq!(result.llm_calls, 2 * (result.improvement_iterations + 1));
                prop_assert!(result.llm_calls <= 2 * (max_iterations + 1));
                prop_assert_eq!(provider.call_count() as u32, result.llm_calls);

                let seen: Vec<u8> = (0..=result.improvement_iterations as usize)
                    .map(|n| nth_score(&scores, n))
                    .collect();
                let first_accepted = seen.iter().position(|s| *s >= threshold);
                match result.status {
                    ResultStatus::Completed => {
                        prop_assert_eq!(first_accepted, Some(seen.len() - 1));
                        prop_assert!(result.score.unwrap() >= threshold);
                    }
                    ResultStatus::CompletedBelowThreshold => {
                        prop_assert_eq!(first_accepted, None);
                        prop_assert_eq!(result.improvement_iterations, max_iterations);
                        prop_assert_eq!(result.score, seen.iter().max().copied());
                    }
                    ResultStatus::Failed => {
                        return Err(TestCaseError::fail("scripted run failed"));
                    }
                }
                Ok(())
            },
        )
        .unwrap();
}

/// Free-form evaluator replies, however short or malformed, are scored
/// rather than retried and the task still ends in a completed status.
#[test]
fn test_free_form_evaluator_replies_terminate_property() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(prop::collection::vec(".{0,12}", 4), 0u32..4),
            |(replies, max_iterations)| {
                let provider = Arc::new(ScriptedProvider::new());
                for reply in &replies {
                    provider.push_response(PromptKind::Evaluative, reply.clone());
                }
                let engine = engine(Arc::clone(&provider), 7, max_iterations);
                let task = Task {
                    term: Arc::new(Term::new("t")),
                    dimension_id: "d".to_string(),
                    complexity: ComplexityTier::Simple,
                };

                let outcome =
                    runtime.block_on(engine.process(&task, &CancellationToken::new()));
                let TaskOutcome::Finished(result) = outcome else {
                    return Err(TestCaseError::fail("task was not finished"));
                };

                prop_assert_ne!(result.status, ResultStatus::Failed);
                prop_assert!(result.llm_calls <= 2 * (max_iterations + 1));
                prop_assert_eq!(provider.call_count() as u32, result.llm_calls);
                prop_assert_eq!(
                    provider.calls_of_kind(PromptKind::Evaluative) as u32,
                    result.improvement_iterations + 1
                );
                let last = parse_evaluation(&replies[result.improvement_iterations as usize]);
                prop_assert!(result.score >= Some(last.score));
                Ok(())
            },
        )
        .unwrap();
}

/// Parsing never panics and never reports a score outside 0..=10.
#[test]
fn test_parse_evaluation_is_total_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&".{0,200}", |raw| {
            let evaluation = parse_evaluation(&raw);
            prop_assert!(evaluation.score <= 10);
            Ok(())
        })
        .unwrap();
}

/// A well-formed score line is read back exactly.
#[test]
fn test_parse_evaluation_reads_score_lines_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(1u8..=10, "[a-z ]{0,40}"), |(score, rationale)| {
            let raw = format!("Score: {}\n{}", score, rationale);
            prop_assert_eq!(parse_evaluation(&raw).score, score);
            Ok(())
        })
        .unwrap();
}
