//! Offline provider with scripted behaviour.
//!
//! Used by `glossgen run --dry-run` and by tests. Responses are scripted per
//! prompt kind and per dimension; evaluation scores follow a per-dimension
//! sequence indexed by how many times the same task has been evaluated, so
//! scripts stay deterministic under any worker interleaving.

use super::{CompletionRequest, CompletionResponse, ModelProviderClient, TokenUsage};
use crate::error::ProviderError;
use crate::templates::PromptKind;
use crate::types::{DimensionId, TaskKey, TermId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
struct ScriptState {
    queued: HashMap<PromptKind, VecDeque<String>>,
    scores_by_dimension: HashMap<DimensionId, Vec<u8>>,
    evaluations_seen: HashMap<TaskKey, usize>,
    revisions_seen: HashMap<TaskKey, usize>,
    transient_failures: VecDeque<ProviderError>,
    failing_dimensions: HashMap<DimensionId, ProviderError>,
    failing_terms: HashMap<TermId, ProviderError>,
    calls: Vec<(PromptKind, String, Option<TaskKey>)>,
}

pub struct ScriptedProvider {
    state: Mutex<ScriptState>,
    default_score: u8,
    usage: TokenUsage,
    latency: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState::default()),
            default_score: 9,
            usage: TokenUsage::new(100, 50),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Provider used for `--dry-run`: short simulated latency, every draft accepted.
    pub fn dry_run() -> Self {
        Self::new()
            .with_default_score(8)
            .with_latency(Duration::from_millis(25))
    }

    pub fn with_default_score(mut self, score: u8) -> Self {
        self.default_score = score;
        self
    }

    /// Token usage reported for every call
    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.usage = TokenUsage::new(prompt_tokens, completion_tokens);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Score sequence for every task of `dimension_id`. The n-th evaluation of
    /// a task returns `scores[n]`; the last score repeats once the list runs out.
    pub fn script_scores(&self, dimension_id: impl Into<String>, scores: Vec<u8>) {
        self.state
            .lock()
            .scores_by_dimension
            .insert(dimension_id.into(), scores);
    }

    /// Queue a literal response for the next generative call.
    pub fn push_generation(&self, content: impl Into<String>) {
        self.push_response(PromptKind::Generative, content);
    }

    /// Queue a literal response for the next evaluative call.
    pub fn push_evaluation(&self, content: impl Into<String>) {
        self.push_response(PromptKind::Evaluative, content);
    }

    pub fn push_response(&self, kind: PromptKind, content: impl Into<String>) {
        self.state
            .lock()
            .queued
            .entry(kind)
            .or_default()
            .push_back(content.into());
    }

    /// Fail the next `count` calls, whatever they are, with `error`.
    pub fn fail_next_calls(&self, count: usize, error: ProviderError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.transient_failures.push_back(error.clone());
        }
    }

    /// Fail every call made for tasks of `dimension_id`.
    pub fn fail_dimension(&self, dimension_id: impl Into<String>, error: ProviderError) {
        self.state
            .lock()
            .failing_dimensions
            .insert(dimension_id.into(), error);
    }

    /// Fail every call made for tasks of `term_id`.
    pub fn fail_term(&self, term_id: impl Into<String>, error: ProviderError) {
        self.state.lock().failing_terms.insert(term_id.into(), error);
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn calls_of_kind(&self, kind: PromptKind) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .count()
    }

    pub fn calls_for_task(&self, key: &TaskKey) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(_, _, task)| task.as_ref() == Some(key))
            .count()
    }

    /// Model ids in call order
    pub fn models_seen(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .map(|(_, model, _)| model.clone())
            .collect()
    }

    /// Highest number of calls observed running at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn respond(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let mut state = self.state.lock();
        state
            .calls
            .push((request.kind, request.model.clone(), request.task.clone()));

        if let Some(error) = state.transient_failures.pop_front() {
            return Err(error);
        }
        if let Some(task) = &request.task {
            if let Some(error) = state.failing_dimensions.get(&task.dimension_id) {
                return Err(error.clone());
            }
            if let Some(error) = state.failing_terms.get(&task.term_id) {
                return Err(error.clone());
            }
        }
        if let Some(content) = state
            .queued
            .get_mut(&request.kind)
            .and_then(VecDeque::pop_front)
        {
            return Ok(content);
        }

        let task = request
            .task
            .clone()
            .unwrap_or_else(|| TaskKey::new("unknown", "unknown"));

        let content = match request.kind {
            PromptKind::Generative | PromptKind::Improvement => {
                let revision = state.revisions_seen.entry(task.clone()).or_insert(0);
                *revision += 1;
                format!(
                    "Scripted content for {} (revision {}). It explains the term in plain language.",
                    task, revision
                )
            }
            PromptKind::Evaluative => {
                let seen = state.evaluations_seen.entry(task.clone()).or_insert(0);
                let index = *seen;
                *seen += 1;
                let score = state
                    .scores_by_dimension
                    .get(&task.dimension_id)
                    .and_then(|scores| scores.get(index).or_else(|| scores.last()))
                    .copied()
                    .unwrap_or(self.default_score);
                format!(
                    "{{\"score\": {}, \"rationale\": \"Scripted evaluation {} of {}\"}}",
                    score,
                    index + 1,
                    task
                )
            }
        };
        Ok(content)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ModelProviderClient for ScriptedProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let content = self.respond(&request)?;
        Ok(CompletionResponse {
            content,
            model: request.model,
            usage: self.usage.clone(),
            finish_reason: Some("stop".to_string()),
        })
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }
}
