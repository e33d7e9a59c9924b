//! Usage/Cost Ledger
//!
//! Single source of truth for token and dollar spend. Every completed (or
//! billed-but-failed) provider call is recorded here; the model selector and
//! the emergency stop controller read from it. All mutation goes through one
//! mutex so concurrent workers never lose an increment.

use crate::types::Cost;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::warn;

/// Per-token prices for one model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRates {
    pub input_per_token: Cost,
    pub output_per_token: Cost,
}

impl ModelRates {
    /// Build rates from USD per million tokens, the unit providers publish.
    pub fn per_million_usd(input_usd: f64, output_usd: f64) -> Self {
        Self {
            input_per_token: Cost::from_usd(input_usd / 1_000_000.0),
            output_per_token: Cost::from_usd(output_usd / 1_000_000.0),
        }
    }

    pub fn free() -> Self {
        Self {
            input_per_token: Cost::ZERO,
            output_per_token: Cost::ZERO,
        }
    }

    pub fn cost_of(&self, input_tokens: u64, output_tokens: u64) -> Cost {
        self.input_per_token.times(input_tokens) + self.output_per_token.times(output_tokens)
    }
}

/// Model id -> rates
pub type PriceTable = HashMap<String, ModelRates>;

/// Running totals for one model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Cost,
}

/// Point-in-time copy of the ledger, safe to serialize or print
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub baseline: Cost,
    pub total_cost: Cost,
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub by_model: BTreeMap<String, ModelUsage>,
}

#[derive(Debug, Default)]
struct LedgerState {
    total: Cost,
    by_model: HashMap<String, ModelUsage>,
    recent: VecDeque<(Instant, Cost)>,
}

pub struct UsageLedger {
    prices: PriceTable,
    baseline: Cost,
    retention: Duration,
    state: Mutex<LedgerState>,
}

impl UsageLedger {
    const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

    pub fn new(prices: PriceTable) -> Self {
        Self::with_baseline(prices, Cost::ZERO)
    }

    /// Create a ledger that starts from spend carried over from earlier runs
    /// against the same checkpoint, so cost ceilings hold across resumes.
    pub fn with_baseline(prices: PriceTable, baseline: Cost) -> Self {
        Self {
            prices,
            baseline,
            retention: Self::DEFAULT_RETENTION,
            state: Mutex::new(LedgerState {
                total: baseline,
                ..LedgerState::default()
            }),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn rates_for(&self, model_id: &str) -> Option<ModelRates> {
        self.prices.get(model_id).copied()
    }

    /// Record one call and return its cost.
    pub fn record(&self, model_id: &str, input_tokens: u64, output_tokens: u64) -> Cost {
        let cost = match self.prices.get(model_id) {
            Some(rates) => rates.cost_of(input_tokens, output_tokens),
            None => {
                warn!(
                    model = %model_id,
                    input_tokens,
                    output_tokens,
                    "No price configured for model; recording usage at zero cost"
                );
                Cost::ZERO
            }
        };

        let now = Instant::now();
        let mut state = self.state.lock();
        state.total += cost;
        let usage = state.by_model.entry(model_id.to_string()).or_default();
        usage.calls += 1;
        usage.input_tokens += input_tokens;
        usage.output_tokens += output_tokens;
        usage.cost += cost;
        state.recent.push_back((now, cost));
        if let Some(horizon) = now.checked_sub(self.retention) {
            while state
                .recent
                .front()
                .is_some_and(|(at, _)| *at < horizon)
            {
                state.recent.pop_front();
            }
        }
        cost
    }

    /// Total spend including the carried-over baseline
    pub fn total_cost(&self) -> Cost {
        self.state.lock().total
    }

    /// Spend recorded by this process only
    pub fn run_cost(&self) -> Cost {
        self.total_cost().saturating_sub(self.baseline)
    }

    /// Spend recorded within the trailing `window` (bounded by the retention horizon)
    pub fn cost_in_window(&self, window: Duration) -> Cost {
        let now = Instant::now();
        let state = self.state.lock();
        match now.checked_sub(window) {
            Some(since) => state
                .recent
                .iter()
                .filter(|(at, _)| *at >= since)
                .map(|(_, cost)| *cost)
                .sum(),
            None => state.recent.iter().map(|(_, cost)| *cost).sum(),
        }
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let state = self.state.lock();
        let by_model: BTreeMap<String, ModelUsage> = state
            .by_model
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        UsageSnapshot {
            baseline: self.baseline,
            total_cost: state.total,
            calls: by_model.values().map(|u| u.calls).sum(),
            input_tokens: by_model.values().map(|u| u.input_tokens).sum(),
            output_tokens: by_model.values().map(|u| u.output_tokens).sum(),
            by_model,
        }
    }
}
