//! Generation Engine: the generate -> evaluate -> improve loop for one task.
//!
//! A task starts in `Generating`, alternates `Evaluating` / `Improving` until
//! a draft scores at or above the acceptance threshold (`Accepted`) or the
//! improvement budget runs out (`Exhausted`, best draft kept). Provider
//! failures end the task as a failed result; they never escape as errors.

use crate::error::SelectionError;
use crate::provider::retry::CallCharges;
use crate::provider::{CallOutcome, ChatMessage, CompletionOptions, CompletionRequest, RetryingClient};
use crate::selector::{ModelChoice, ModelSelector};
use crate::templates::{render, PromptContext, PromptKind, TemplateStore};
use crate::types::{ComplexityTier, Cost, Task, TaskKey};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    /// Model choice and budget check, before any provider call
    Selecting,
    Generating,
    Evaluating,
    Improving,
    Accepted,
    Exhausted,
}

impl fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnginePhase::Selecting => "selecting",
            EnginePhase::Generating => "generating",
            EnginePhase::Evaluating => "evaluating",
            EnginePhase::Improving => "improving",
            EnginePhase::Accepted => "accepted",
            EnginePhase::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum evaluator score (1-10) for a draft to be accepted
    pub acceptance_threshold: u8,
    pub max_improvement_iterations: u32,
    /// Wall-clock budget for the whole loop of one task
    pub task_timeout: Duration,
    pub completion: CompletionOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 7,
            max_improvement_iterations: 2,
            task_timeout: Duration::from_secs(600),
            completion: CompletionOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    CompletedBelowThreshold,
    Failed,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Completed => "completed",
            ResultStatus::CompletedBelowThreshold => "completed_below_threshold",
            ResultStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientExhausted,
    Permanent,
    Budget,
    Timeout,
    Storage,
}

/// Why a task failed, kept for post-mortem review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub phase: EnginePhase,
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} during {}: {}", self.kind, self.phase, self.message)
    }
}

/// Terminal output for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub term_id: String,
    pub dimension_id: String,
    pub status: ResultStatus,
    pub content: Option<String>,
    pub score: Option<u8>,
    pub rationale: Option<String>,
    pub improvement_iterations: u32,
    /// Logical provider calls (one per generate/evaluate/improve step)
    pub llm_calls: u32,
    /// Provider attempts including retries
    pub provider_attempts: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Cost,
    pub model: Option<String>,
    pub tier: ComplexityTier,
    #[serde(default)]
    pub error: Option<FailureDetail>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl GenerationResult {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.term_id.clone(), self.dimension_id.clone())
    }

    pub fn is_done(&self) -> bool {
        self.status != ResultStatus::Failed
    }
}

#[derive(Debug)]
pub enum TaskOutcome {
    Finished(GenerationResult),
    /// Stopped by the cancellation token; nothing should be persisted as done
    Cancelled,
}

/// Parsed evaluator response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// 1-10, or 0 when the response could not be parsed
    pub score: u8,
    pub rationale: String,
}

fn score_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\bscore\b\W{0,3}\s*[:=]?\s*(\d+(?:\.\d+)?)").expect("valid score pattern")
    })
}

fn leading_number() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\s*(\d+(?:\.\d+)?)").expect("valid leading pattern"))
}

fn to_score(value: f64) -> u8 {
    if value.fract() == 0.0 && (1.0..=10.0).contains(&value) {
        value as u8
    } else {
        0
    }
}

fn json_score(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_json_evaluation(raw: &str) -> Option<Evaluation> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(&raw[start..=end]).ok()?;
    let object = value.as_object()?;
    let score = object.get("score").and_then(json_score)?;
    let rationale = ["rationale", "feedback", "reason"]
        .iter()
        .find_map(|key| object.get(*key).and_then(|v| v.as_str()))
        .unwrap_or_default()
        .trim()
        .to_string();
    Some(Evaluation {
        score: to_score(score),
        rationale,
    })
}

/// Parse an evaluator response. Never fails: anything that does not yield
/// an integer in 1..=10 scores 0.
pub fn parse_evaluation(raw: &str) -> Evaluation {
    if let Some(evaluation) = parse_json_evaluation(raw) {
        return evaluation;
    }
    let captured = score_pattern()
        .captures(raw)
        .or_else(|| leading_number().captures(raw))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());
    Evaluation {
        score: captured.map(to_score).unwrap_or(0),
        rationale: raw.trim().to_string(),
    }
}

enum LoopExit {
    Cancelled,
    Failed(FailureDetail),
}

struct Candidate {
    content: String,
    score: u8,
    rationale: String,
}

// Per-task working state; owned by one worker.
struct TaskRun {
    phase: EnginePhase,
    model: Option<String>,
    llm_calls: u32,
    charges: CallCharges,
    iterations: u32,
    best: Option<Candidate>,
}

impl TaskRun {
    fn new() -> Self {
        Self {
            phase: EnginePhase::Selecting,
            model: None,
            llm_calls: 0,
            charges: CallCharges::default(),
            iterations: 0,
            best: None,
        }
    }

    fn consider(&mut self, content: &str, evaluation: &Evaluation) {
        let better = self
            .best
            .as_ref()
            .map_or(true, |best| evaluation.score >= best.score);
        if better {
            self.best = Some(Candidate {
                content: content.to_string(),
                score: evaluation.score,
                rationale: evaluation.rationale.clone(),
            });
        }
    }

    fn absorb(&mut self, charges: CallCharges) {
        self.llm_calls += 1;
        self.charges.attempts += charges.attempts;
        self.charges.input_tokens += charges.input_tokens;
        self.charges.output_tokens += charges.output_tokens;
        self.charges.cost += charges.cost;
    }

    fn into_result(
        self,
        task: &Task,
        status: ResultStatus,
        error: Option<FailureDetail>,
        started: Instant,
    ) -> GenerationResult {
        let (content, score, rationale) = match (status, self.best) {
            (ResultStatus::Failed, _) | (_, None) => (None, None, None),
            (_, Some(best)) => (Some(best.content), Some(best.score), Some(best.rationale)),
        };
        GenerationResult {
            term_id: task.term.id.clone(),
            dimension_id: task.dimension_id.clone(),
            status,
            content,
            score,
            rationale,
            improvement_iterations: self.iterations,
            llm_calls: self.llm_calls,
            provider_attempts: self.charges.attempts,
            input_tokens: self.charges.input_tokens,
            output_tokens: self.charges.output_tokens,
            cost: self.charges.cost,
            model: self.model,
            tier: task.complexity,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
            completed_at: Utc::now(),
        }
    }
}

pub struct GenerationEngine {
    client: Arc<RetryingClient>,
    selector: Arc<ModelSelector>,
    templates: Arc<TemplateStore>,
    config: EngineConfig,
}

impl GenerationEngine {
    const NO_FEEDBACK: &'static str = "No feedback was given; improve accuracy and clarity.";

    pub fn new(
        client: Arc<RetryingClient>,
        selector: Arc<ModelSelector>,
        templates: Arc<TemplateStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            client,
            selector,
            templates,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run the quality loop for `task`.
    pub async fn process(&self, task: &Task, cancel: &CancellationToken) -> TaskOutcome {
        let started = Instant::now();
        let mut run = TaskRun::new();
        // The timeout cancels a child token; the loop unwinds with its charges.
        let deadline = cancel.child_token();
        let exit = {
            let work = self.run_loop(task, &mut run, &deadline);
            tokio::pin!(work);
            let finished = tokio::select! {
                exit = &mut work => Some(exit),
                _ = tokio::time::sleep(self.config.task_timeout) => None,
            };
            match finished {
                Some(exit) => exit,
                None => {
                    deadline.cancel();
                    work.await
                }
            }
        };
        let timed_out = deadline.is_cancelled() && !cancel.is_cancelled();

        let (status, error) = match exit {
            Ok(status) => (status, None),
            Err(LoopExit::Cancelled) if !timed_out => {
                debug!(task = %task.key(), phase = %run.phase, "Task cancelled");
                return TaskOutcome::Cancelled;
            }
            Err(LoopExit::Failed(detail)) => (ResultStatus::Failed, Some(detail)),
            Err(LoopExit::Cancelled) => (
                ResultStatus::Failed,
                Some(FailureDetail {
                    phase: run.phase,
                    kind: FailureKind::Timeout,
                    message: format!(
                        "task exceeded its {}s budget",
                        self.config.task_timeout.as_secs()
                    ),
                }),
            ),
        };

        let result = run.into_result(task, status, error, started);
        match &result.error {
            None => info!(
                task = %task.key(),
                status = %result.status,
                score = ?result.score,
                iterations = result.improvement_iterations,
                llm_calls = result.llm_calls,
                model = ?result.model,
                cost_usd = result.cost.as_usd(),
                "Task finished"
            ),
            Some(detail) => warn!(
                task = %task.key(),
                phase = %detail.phase,
                kind = ?detail.kind,
                error = %detail.message,
                llm_calls = result.llm_calls,
                "Task failed"
            ),
        }
        TaskOutcome::Finished(result)
    }

    async fn run_loop(
        &self,
        task: &Task,
        run: &mut TaskRun,
        cancel: &CancellationToken,
    ) -> Result<ResultStatus, LoopExit> {
        let key = task.key();
        run.phase = EnginePhase::Selecting;
        let choice = self.selector.select(task.complexity).map_err(|e| {
            let kind = match e {
                SelectionError::BudgetExceeded { .. } => FailureKind::Budget,
                SelectionError::NoModel(_) => FailureKind::Permanent,
            };
            LoopExit::Failed(FailureDetail {
                phase: EnginePhase::Selecting,
                kind,
                message: e.to_string(),
            })
        })?;
        run.model = Some(choice.id.clone());

        let dimension = self.templates.get_or_error(&task.dimension_id).map_err(|e| {
            LoopExit::Failed(FailureDetail {
                phase: EnginePhase::Selecting,
                kind: FailureKind::Permanent,
                message: e.to_string(),
            })
        })?;
        let term = task.term.as_ref();
        let prompts = &dimension.prompts;

        run.phase = EnginePhase::Generating;
        let prompt = render(&prompts.generative, &PromptContext::new(term, dimension));
        let mut content = self
            .call(run, &key, &choice, PromptKind::Generative, &prompts.system, prompt, cancel)
            .await?;

        loop {
            run.phase = EnginePhase::Evaluating;
            let prompt = render(
                &prompts.evaluative,
                &PromptContext::new(term, dimension).with_content(&content),
            );
            let raw = self
                .call(run, &key, &choice, PromptKind::Evaluative, &prompts.system, prompt, cancel)
                .await?;
            let evaluation = parse_evaluation(&raw);
            debug!(
                task = %key,
                score = evaluation.score,
                iteration = run.iterations,
                "Draft evaluated"
            );
            run.consider(&content, &evaluation);

            if evaluation.score >= self.config.acceptance_threshold {
                run.phase = EnginePhase::Accepted;
                return Ok(ResultStatus::Completed);
            }
            if run.iterations >= self.config.max_improvement_iterations {
                run.phase = EnginePhase::Exhausted;
                return Ok(ResultStatus::CompletedBelowThreshold);
            }

            run.phase = EnginePhase::Improving;
            let feedback = if evaluation.rationale.is_empty() {
                Self::NO_FEEDBACK
            } else {
                evaluation.rationale.as_str()
            };
            let prompt = render(
                &prompts.improvement,
                &PromptContext::new(term, dimension)
                    .with_content(&content)
                    .with_evaluation(evaluation.score, feedback),
            );
            content = self
                .call(run, &key, &choice, PromptKind::Improvement, &prompts.system, prompt, cancel)
                .await?;
            run.iterations += 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn call(
        &self,
        run: &mut TaskRun,
        key: &TaskKey,
        choice: &ModelChoice,
        kind: PromptKind,
        system: &str,
        prompt: String,
        cancel: &CancellationToken,
    ) -> Result<String, LoopExit> {
        let request = CompletionRequest {
            model: choice.id.clone(),
            messages: vec![ChatMessage::system(system), ChatMessage::user(prompt)],
            options: self.config.completion.clone(),
            kind,
            task: Some(key.clone()),
        };
        let outcome = self
            .client
            .call(request, choice.fallback.as_deref(), cancel)
            .await;
        run.absorb(outcome.charges());

        match outcome {
            CallOutcome::Success {
                response, model, ..
            } => {
                run.model = Some(model);
                Ok(response.content)
            }
            CallOutcome::TransientFailure { error, .. } => Err(LoopExit::Failed(FailureDetail {
                phase: run.phase,
                kind: FailureKind::TransientExhausted,
                message: error.to_string(),
            })),
            CallOutcome::PermanentFailure { error, .. } => Err(LoopExit::Failed(FailureDetail {
                phase: run.phase,
                kind: FailureKind::Permanent,
                message: error.to_string(),
            })),
            CallOutcome::Cancelled { .. } => Err(LoopExit::Cancelled),
        }
    }
}
