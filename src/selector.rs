//! Model Selector
//!
//! Static complexity-tier to model mapping with a budget guard: a tier is
//! refused when the projected cost of one more task would push the ledger
//! past the run budget.

use crate::error::SelectionError;
use crate::ledger::{ModelRates, PriceTable, UsageLedger};
use crate::types::{ComplexityTier, Cost};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// One `[models.<tier>]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierModelConfig {
    pub model: String,
    pub input_usd_per_million: f64,
    pub output_usd_per_million: f64,
    /// Model used for the final retry attempt
    #[serde(default)]
    pub fallback: Option<String>,
}

impl TierModelConfig {
    fn new(model: &str, input_usd_per_million: f64, output_usd_per_million: f64) -> Self {
        Self {
            model: model.to_string(),
            input_usd_per_million,
            output_usd_per_million,
            fallback: None,
        }
    }

    pub fn rates(&self) -> ModelRates {
        ModelRates::per_million_usd(self.input_usd_per_million, self.output_usd_per_million)
    }
}

/// `[models]` configuration table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub simple: TierModelConfig,
    pub moderate: TierModelConfig,
    pub complex: TierModelConfig,
    /// Input tokens one task is expected to consume across all its calls
    pub projected_input_tokens: u64,
    /// Output tokens one task is expected to consume across all its calls
    pub projected_output_tokens: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            simple: TierModelConfig::new("gpt-4.1-nano", 0.10, 0.40),
            moderate: TierModelConfig::new("gpt-4.1-mini", 0.40, 1.60),
            complex: TierModelConfig::new("gpt-4.1", 2.00, 8.00),
            projected_input_tokens: 6_000,
            projected_output_tokens: 3_000,
        }
    }
}

impl ModelsConfig {
    pub fn tier(&self, tier: ComplexityTier) -> &TierModelConfig {
        match tier {
            ComplexityTier::Simple => &self.simple,
            ComplexityTier::Moderate => &self.moderate,
            ComplexityTier::Complex => &self.complex,
        }
    }

    /// Price table for the ledger. A fallback model that is not itself a
    /// tier model is billed at the rates of the tier that falls back to it.
    pub fn price_table(&self) -> PriceTable {
        let mut prices = PriceTable::new();
        for tier in ComplexityTier::ALL {
            let cfg = self.tier(tier);
            prices.insert(cfg.model.clone(), cfg.rates());
        }
        for tier in ComplexityTier::ALL {
            let cfg = self.tier(tier);
            if let Some(fallback) = &cfg.fallback {
                prices.entry(fallback.clone()).or_insert_with(|| cfg.rates());
            }
        }
        prices
    }

    /// Same models, all billed at zero (used for dry runs)
    pub fn free_price_table(&self) -> PriceTable {
        self.price_table()
            .into_keys()
            .map(|model| (model, ModelRates::free()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChoice {
    pub id: String,
    pub tier: ComplexityTier,
    pub input_cost_per_token: Cost,
    pub output_cost_per_token: Cost,
    pub fallback: Option<String>,
}

pub struct ModelSelector {
    tiers: HashMap<ComplexityTier, ModelChoice>,
    ledger: Arc<UsageLedger>,
    budget: Option<Cost>,
    projected_input_tokens: u64,
    projected_output_tokens: u64,
}

impl ModelSelector {
    /// Build the tier table. Rates come from the ledger's price table so the
    /// projection and the actual billing agree.
    pub fn new(config: &ModelsConfig, ledger: Arc<UsageLedger>, budget: Option<Cost>) -> Self {
        let tiers = ComplexityTier::ALL
            .into_iter()
            .map(|tier| {
                let cfg = config.tier(tier);
                let rates = ledger.rates_for(&cfg.model).unwrap_or_else(|| cfg.rates());
                (
                    tier,
                    ModelChoice {
                        id: cfg.model.clone(),
                        tier,
                        input_cost_per_token: rates.input_per_token,
                        output_cost_per_token: rates.output_per_token,
                        fallback: cfg.fallback.clone(),
                    },
                )
            })
            .collect();
        Self {
            tiers,
            ledger,
            budget,
            projected_input_tokens: config.projected_input_tokens,
            projected_output_tokens: config.projected_output_tokens,
        }
    }

    /// Expected cost of one task on `tier`
    pub fn projected_cost(&self, tier: ComplexityTier) -> Option<Cost> {
        self.tiers.get(&tier).map(|choice| {
            choice.input_cost_per_token.times(self.projected_input_tokens)
                + choice.output_cost_per_token.times(self.projected_output_tokens)
        })
    }

    pub fn select(&self, tier: ComplexityTier) -> Result<ModelChoice, SelectionError> {
        let choice = self
            .tiers
            .get(&tier)
            .ok_or(SelectionError::NoModel(tier))?;
        if let Some(budget) = self.budget {
            let projected = self.projected_cost(tier).unwrap_or(Cost::ZERO);
            let spent = self.ledger.total_cost();
            if spent + projected > budget {
                return Err(SelectionError::BudgetExceeded {
                    tier,
                    projected,
                    remaining: budget.saturating_sub(spent),
                });
            }
        }
        Ok(choice.clone())
    }
}
