//! Token and cost accounting across LLM calls.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Per-model pricing in USD per 1000 tokens.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    /// Input (prompt) price per 1k tokens.
    pub input_per_1k: f64,
    /// Output (completion) price per 1k tokens.
    pub output_per_1k: f64,
}

/// Static pricing table for known models.
const PRICING_TABLE: &[(&str, ModelPricing)] = &[
    (
        "gpt-4o",
        ModelPricing {
            input_per_1k: 0.005,
            output_per_1k: 0.015,
        },
    ),
    (
        "gpt-4o-mini",
        ModelPricing {
            input_per_1k: 0.000_15,
            output_per_1k: 0.000_6,
        },
    ),
    (
        "gpt-4-turbo",
        ModelPricing {
            input_per_1k: 0.01,
            output_per_1k: 0.03,
        },
    ),
    (
        "gpt-3.5-turbo",
        ModelPricing {
            input_per_1k: 0.000_5,
            output_per_1k: 0.001_5,
        },
    ),
];

/// Fallback entry used when the active model is not in the table.
const DEFAULT_PRICING: ModelPricing = ModelPricing {
    input_per_1k: 0.005,
    output_per_1k: 0.015,
};

/// Look up pricing for a model, falling back to the default entry.
#[must_use]
pub fn pricing_for(model: &str) -> ModelPricing {
    match PRICING_TABLE.iter().find(|(name, _)| *name == model) {
        Some((_, pricing)) => *pricing,
        None => {
            warn!("no pricing entry for model '{model}', using default rates");
            DEFAULT_PRICING
        }
    }
}

/// Cumulative usage totals for one session. Never decreases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    /// Model the most recent call was billed against.
    pub model: String,
}

/// Tracks token counts and dollar cost across the session's LLM calls.
#[derive(Debug, Default)]
pub struct UsageAccountant {
    totals: UsageTotals,
}

impl UsageAccountant {
    /// Create an accountant with zeroed totals.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successful LLM call. Returns the incremental cost.
    pub fn record(&mut self, prompt_tokens: u64, completion_tokens: u64, model: &str) -> f64 {
        let pricing = pricing_for(model);
        let cost = (prompt_tokens as f64 / 1000.0) * pricing.input_per_1k
            + (completion_tokens as f64 / 1000.0) * pricing.output_per_1k;

        self.totals.prompt_tokens += prompt_tokens;
        self.totals.completion_tokens += completion_tokens;
        self.totals.total_tokens += prompt_tokens + completion_tokens;
        self.totals.cost_usd += cost;
        self.totals.model = model.to_owned();
        cost
    }

    /// Read-only copy of the running totals.
    #[must_use]
    pub fn snapshot(&self) -> UsageTotals {
        self.totals.clone()
    }
}
