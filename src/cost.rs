//! Token accounting and cost calculation.
//!
//! Providers that report cost directly (OpenRouter's `usage.cost`) win; otherwise the
//! cost is derived from the pricing table below.

use serde::{Deserialize, Serialize};

/// Model pricing in nanodollars per token (1 USD = 1_000_000_000 nanodollars).
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_nano_per_token: u64,
    pub output_nano_per_token: u64,
    /// Cache write rate, falls back to the input rate
    pub cache_write_nano_per_token: Option<u64>,
    /// Cache read rate, falls back to the input rate
    pub cache_read_nano_per_token: Option<u64>,
}

/// Token usage of one or more API requests.
///
/// `input_tokens` excludes cache reads and writes, matching how the running context size is
/// computed as the sum of all four counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    /// Cost in USD
    #[serde(default)]
    pub total_cost: f64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Self::default()
        }
    }

    pub fn with_cost(mut self, total_cost: f64) -> Self {
        self.total_cost = total_cost;
        self
    }

    /// Check if there's any usage to compute cost from.
    pub fn has_usage(&self) -> bool {
        self.input_tokens > 0
            || self.output_tokens > 0
            || self.cache_write_tokens > 0
            || self.cache_read_tokens > 0
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.total_cost += other.total_cost;
    }

    /// Tokens occupied in the context window by the request that produced this usage.
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_write_tokens + self.cache_read_tokens
    }
}

// Substring patterns are checked in order, so more specific names come first.
const PRICING_TABLE: &[(&str, ModelPricing)] = &[
    ("claude-opus-4", pricing(15_000, 75_000, Some(18_750), Some(1_500))),
    ("claude-sonnet-4", pricing(3_000, 15_000, Some(3_750), Some(300))),
    ("claude-3.7-sonnet", pricing(3_000, 15_000, Some(3_750), Some(300))),
    ("claude-3.5-sonnet", pricing(3_000, 15_000, Some(3_750), Some(300))),
    ("claude-3.5-haiku", pricing(800, 4_000, Some(1_000), Some(80))),
    ("gpt-4o-mini", pricing(150, 600, None, Some(75))),
    ("gpt-4o", pricing(2_500, 10_000, None, Some(1_250))),
    ("gpt-4.1", pricing(2_000, 8_000, None, Some(500))),
    ("o4-mini", pricing(1_100, 4_400, None, Some(275))),
    ("gemini-2.5-pro", pricing(1_250, 10_000, None, Some(310))),
    ("gemini-2.5-flash", pricing(300, 2_500, None, Some(75))),
];

const fn pricing(
    input: u64,
    output: u64,
    cache_write: Option<u64>,
    cache_read: Option<u64>,
) -> ModelPricing {
    ModelPricing {
        input_nano_per_token: input,
        output_nano_per_token: output,
        cache_write_nano_per_token: cache_write,
        cache_read_nano_per_token: cache_read,
    }
}

/// Get pricing for a model id such as `anthropic/claude-sonnet-4`. Returns None if unknown.
pub fn pricing_for_model(model: &str) -> Option<ModelPricing> {
    let normalized = model.trim().to_lowercase().replace("-3-5-", "-3.5-").replace("-3-7-", "-3.7-");
    PRICING_TABLE
        .iter()
        .find(|(pattern, _)| normalized.contains(pattern))
        .map(|(_, pricing)| *pricing)
}

/// Calculate cost in USD from token usage. Unknown models cost nothing.
pub fn cost_usd_from_usage(model: &str, usage: &TokenUsage) -> f64 {
    if !usage.has_usage() {
        return 0.0;
    }

    let Some(pricing) = pricing_for_model(model) else {
        tracing::warn!(model = %model, "Unknown model for cost calculation, using 0 cost");
        return 0.0;
    };

    let cache_write_rate = pricing
        .cache_write_nano_per_token
        .unwrap_or(pricing.input_nano_per_token);
    let cache_read_rate = pricing
        .cache_read_nano_per_token
        .unwrap_or(pricing.input_nano_per_token);

    let nano = usage
        .input_tokens
        .saturating_mul(pricing.input_nano_per_token)
        .saturating_add(usage.output_tokens.saturating_mul(pricing.output_nano_per_token))
        .saturating_add(usage.cache_write_tokens.saturating_mul(cache_write_rate))
        .saturating_add(usage.cache_read_tokens.saturating_mul(cache_read_rate));

    nano as f64 / 1_000_000_000.0
}
