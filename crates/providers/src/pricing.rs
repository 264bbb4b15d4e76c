//! Pricing table for cost accounting.
//!
//! Prices are in USD per 1 million tokens, keyed `provider/model`. Custom
//! pricing comes from the `providers.<name>.pricing` config section and
//! overrides the built-in defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per 1M input tokens in USD.
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD.
    pub output_per_m: f64,
}

impl ModelPricing {
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    /// Cost is linear in token counts.
    pub fn cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        (prompt_tokens as f64 * self.input_per_m + completion_tokens as f64 * self.output_per_m)
            / 1_000_000.0
    }
}

/// Thread-safe pricing table with built-in defaults and config overrides.
pub struct PricingTable {
    prices: RwLock<HashMap<String, ModelPricing>>,
}

impl PricingTable {
    /// Built-in prices for the supported providers.
    pub fn with_defaults() -> Self {
        let mut prices = HashMap::new();

        // Anthropic
        prices.insert(
            "anthropic/claude-sonnet-4".into(),
            ModelPricing::new(3.0, 15.0),
        );
        prices.insert(
            "anthropic/claude-opus-4".into(),
            ModelPricing::new(15.0, 75.0),
        );
        prices.insert(
            "anthropic/claude-3-5-haiku".into(),
            ModelPricing::new(0.8, 4.0),
        );

        // OpenAI
        prices.insert("openai/gpt-4o".into(), ModelPricing::new(2.5, 10.0));
        prices.insert("openai/gpt-4o-mini".into(), ModelPricing::new(0.15, 0.6));
        prices.insert("openai/o3-mini".into(), ModelPricing::new(1.1, 4.4));
        prices.insert(
            "openai/text-embedding-3-small".into(),
            ModelPricing::new(0.02, 0.0),
        );

        // Groq
        prices.insert(
            "groq/llama-3.1-70b-versatile".into(),
            ModelPricing::new(0.59, 0.79),
        );
        prices.insert(
            "groq/llama-3.1-8b-instant".into(),
            ModelPricing::new(0.05, 0.08),
        );
        prices.insert(
            "groq/mixtral-8x7b-32768".into(),
            ModelPricing::new(0.24, 0.24),
        );

        Self {
            prices: RwLock::new(prices),
        }
    }

    pub fn empty() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Add or override pricing for `provider/model`.
    pub fn set(&self, provider: &str, model: &str, pricing: ModelPricing) {
        let mut prices = self.prices.write().expect("pricing lock poisoned");
        prices.insert(format!("{provider}/{model}"), pricing);
    }

    /// Apply all `providers.<name>.pricing` overrides from config.
    pub fn apply_config(&self, config: &turnloom_config::AppConfig) {
        for (provider, provider_config) in &config.providers {
            for (model, p) in &provider_config.pricing {
                self.set(
                    provider,
                    model,
                    ModelPricing::new(p.input_per_m, p.output_per_m),
                );
            }
        }
    }

    /// Compute cost for a call, returning 0.0 for unknown models.
    ///
    /// Matching order: exact `provider/model`, then the longest table entry
    /// for the provider whose bare model name is a prefix of the requested
    /// model — provider responses often append a version suffix
    /// (`claude-sonnet-4-20250514` matches `claude-sonnet-4`).
    pub fn compute_cost(
        &self,
        provider: &str,
        model: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> f64 {
        let prices = self.prices.read().expect("pricing lock poisoned");

        let exact = format!("{provider}/{model}");
        if let Some(p) = prices.get(&exact) {
            return p.cost(prompt_tokens, completion_tokens);
        }

        let model_lower = model.to_lowercase();
        let prefix = format!("{provider}/");
        let mut best: Option<(&str, &ModelPricing)> = None;
        for (key, pricing) in prices.iter() {
            let Some(bare_key) = key.strip_prefix(&prefix) else {
                continue;
            };
            if model_lower.starts_with(&bare_key.to_lowercase())
                && best.map_or(true, |(b, _)| bare_key.len() > b.len())
            {
                best = Some((bare_key, pricing));
            }
        }

        match best {
            Some((_, p)) => p.cost(prompt_tokens, completion_tokens),
            None => {
                tracing::debug!(provider, model, "No pricing entry; recording zero cost");
                0.0
            }
        }
    }

    pub fn len(&self) -> usize {
        self.prices.read().expect("pricing lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_is_linear_in_tokens() {
        let p = ModelPricing::new(3.0, 15.0);
        // (1000 * 3.0 + 500 * 15.0) / 1M = 0.0105
        assert!((p.cost(1000, 500) - 0.0105).abs() < 1e-12);
        // Doubling tokens doubles cost
        assert!((p.cost(2000, 1000) - 0.021).abs() < 1e-12);
        assert_eq!(p.cost(0, 0), 0.0);
    }

    #[test]
    fn exact_match() {
        let table = PricingTable::with_defaults();
        let cost = table.compute_cost("openai", "gpt-4o", 1_000_000, 0);
        assert!((cost - 2.5).abs() < 1e-10);
    }

    #[test]
    fn versioned_model_matches_prefix() {
        let table = PricingTable::with_defaults();
        let cost = table.compute_cost("anthropic", "claude-sonnet-4-20250514", 1000, 500);
        assert!((cost - 0.0105).abs() < 1e-10);
    }

    #[test]
    fn unknown_model_costs_zero() {
        let table = PricingTable::with_defaults();
        assert_eq!(table.compute_cost("openai", "model-from-the-future", 1000, 500), 0.0);
        assert_eq!(table.compute_cost("nobody", "gpt-4o", 1000, 500), 0.0);
    }

    #[test]
    fn config_overrides_win() {
        let table = PricingTable::with_defaults();
        let mut config = turnloom_config::AppConfig::default();
        let mut provider = turnloom_config::ProviderConfig::default();
        provider.pricing.insert(
            "gpt-4o".into(),
            turnloom_config::ModelPricingConfig {
                input_per_m: 5.0,
                output_per_m: 20.0,
            },
        );
        config.providers.insert("openai".into(), provider);

        table.apply_config(&config);
        let cost = table.compute_cost("openai", "gpt-4o", 1_000_000, 0);
        assert!((cost - 5.0).abs() < 1e-10);
    }

    #[test]
    fn prefix_prefers_longest_key() {
        let table = PricingTable::empty();
        table.set("openai", "gpt-4o", ModelPricing::new(2.5, 10.0));
        table.set("openai", "gpt-4o-mini", ModelPricing::new(0.15, 0.6));

        let cost = table.compute_cost("openai", "gpt-4o-mini-2024-07-18", 1_000_000, 0);
        assert!((cost - 0.15).abs() < 1e-10);
    }
}
