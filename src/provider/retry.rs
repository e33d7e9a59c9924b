//! Retrying client wrapper.
//!
//! Wraps a [`ModelProviderClient`] with bounded retries, exponential backoff
//! with jitter, a per-attempt timeout, and usage accounting. Callers get a
//! tagged [`CallOutcome`] instead of an error to branch on.

use super::{CompletionRequest, CompletionResponse, ModelProviderClient, TokenUsage};
use crate::error::ProviderError;
use crate::ledger::UsageLedger;
use crate::templates::PromptKind;
use crate::types::Cost;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// `[retry]` configuration table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random (0.0 - 1.0)
    pub jitter: f64,
    pub call_timeout_secs: u64,
    /// Completions shorter than this are treated as transient failures
    pub min_content_chars: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.25,
            call_timeout_secs: 60,
            min_content_chars: 10,
        }
    }
}

impl RetryPolicy {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Delay before retry number `attempt + 1`, without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let millis = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Delay before retry number `attempt + 1`, with jitter applied.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        nominal.mul_f64(1.0 + spread)
    }
}

/// Tokens and money consumed by one logical call across all its attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCharges {
    pub attempts: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Cost,
}

impl CallCharges {
    fn bill(&mut self, ledger: &UsageLedger, model: &str, usage: &TokenUsage) {
        let input = u64::from(usage.prompt_tokens);
        let output = u64::from(usage.completion_tokens);
        self.input_tokens += input;
        self.output_tokens += output;
        self.cost += ledger.record(model, input, output);
    }
}

/// Result of a retried call
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Success {
        response: CompletionResponse,
        /// Model id the successful attempt was sent to
        model: String,
        charges: CallCharges,
    },
    /// Retries exhausted on transient errors
    TransientFailure {
        error: ProviderError,
        charges: CallCharges,
    },
    /// Non-retryable error; returned on first occurrence
    PermanentFailure {
        error: ProviderError,
        charges: CallCharges,
    },
    Cancelled {
        charges: CallCharges,
    },
}

impl CallOutcome {
    pub fn charges(&self) -> CallCharges {
        match self {
            CallOutcome::Success { charges, .. }
            | CallOutcome::TransientFailure { charges, .. }
            | CallOutcome::PermanentFailure { charges, .. }
            | CallOutcome::Cancelled { charges } => *charges,
        }
    }
}

pub struct RetryingClient {
    client: Arc<dyn ModelProviderClient>,
    ledger: Arc<UsageLedger>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(
        client: Arc<dyn ModelProviderClient>,
        ledger: Arc<UsageLedger>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            ledger,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    /// Send `request`, retrying transient failures.
    ///
    /// When `fallback` is set and at least one retry is allowed, the final
    /// attempt is sent to the fallback model instead.
    pub async fn call(
        &self,
        request: CompletionRequest,
        fallback: Option<&str>,
        cancel: &CancellationToken,
    ) -> CallOutcome {
        let total_attempts = self.policy.max_retries + 1;
        let mut charges = CallCharges::default();
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..total_attempts {
            if cancel.is_cancelled() {
                return CallOutcome::Cancelled { charges };
            }

            let mut attempt_request = request.clone();
            if attempt > 0 && attempt + 1 == total_attempts {
                if let Some(fallback) = fallback {
                    debug!(
                        from = %request.model,
                        to = %fallback,
                        "Switching to fallback model for final attempt"
                    );
                    attempt_request.model = fallback.to_string();
                }
            }
            let model = attempt_request.model.clone();
            let kind = attempt_request.kind;
            charges.attempts += 1;

            let result = tokio::select! {
                _ = cancel.cancelled() => return CallOutcome::Cancelled { charges },
                result = tokio::time::timeout(
                    self.policy.call_timeout(),
                    self.client.complete(attempt_request),
                ) => result,
            };

            let error = match result {
                Err(_) => ProviderError::Timeout(format!(
                    "no response within {}s",
                    self.policy.call_timeout_secs
                )),
                Ok(Ok(response)) => {
                    charges.bill(&self.ledger, &model, &response.usage);
                    // Scores are short by nature; only drafts carry a length floor.
                    let chars = response.content.trim().chars().count();
                    if kind == PromptKind::Evaluative || chars >= self.policy.min_content_chars {
                        return CallOutcome::Success {
                            response,
                            model,
                            charges,
                        };
                    }
                    ProviderError::EmptyCompletion {
                        chars,
                        usage: response.usage,
                    }
                }
                Ok(Err(error)) => {
                    if let Some(usage) = error.billed_usage() {
                        charges.bill(&self.ledger, &model, usage);
                    }
                    error
                }
            };

            if !error.is_transient() {
                warn!(
                    task = ?request.task.as_ref().map(|k| k.to_string()),
                    phase = %request.kind,
                    model = %model,
                    attempt = attempt + 1,
                    error = %error,
                    "Provider call failed permanently"
                );
                return CallOutcome::PermanentFailure { error, charges };
            }

            if attempt + 1 < total_attempts {
                let delay = self.policy.backoff_delay(attempt);
                warn!(
                    task = ?request.task.as_ref().map(|k| k.to_string()),
                    phase = %request.kind,
                    model = %model,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient provider failure; backing off"
                );
                last_error = Some(error);
                tokio::select! {
                    _ = cancel.cancelled() => return CallOutcome::Cancelled { charges },
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                last_error = Some(error);
            }
        }

        CallOutcome::TransientFailure {
            error: last_error
                .unwrap_or_else(|| ProviderError::Timeout("no attempt was made".to_string())),
            charges,
        }
    }
}
