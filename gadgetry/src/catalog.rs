//! The model catalog collaborator.
//!
//! The catalog answers two questions the loop cannot answer itself: how
//! large a model's context window is (used by output limiting) and what a
//! call cost (recorded on the execution tree).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::usage::TokenUsage;

/// Size limits for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    /// Context window in tokens.
    pub context_window: u32,
    /// Maximum output tokens per call.
    pub max_output_tokens: u32,
}

/// A cost estimate for one LLM call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Total cost in account currency units.
    pub total_cost: f64,
}

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per million input tokens.
    pub input: f64,
    /// Price per million output tokens.
    pub output: f64,
    /// Price per million cached input tokens.
    #[serde(default)]
    pub cached_input: f64,
    /// Price per million cache-creation input tokens.
    #[serde(default)]
    pub cache_creation: f64,
}

impl ModelPricing {
    /// Estimate the cost of the given usage at this pricing.
    #[must_use]
    pub fn estimate(&self, usage: &TokenUsage) -> CostEstimate {
        const PER: f64 = 1_000_000.0;
        let uncached = usage
            .input_tokens
            .saturating_sub(usage.cached_input_tokens)
            .saturating_sub(usage.cache_creation_input_tokens);
        let total_cost = (uncached as f64 * self.input
            + usage.output_tokens as f64 * self.output
            + usage.cached_input_tokens as f64 * self.cached_input
            + usage.cache_creation_input_tokens as f64 * self.cache_creation)
            / PER;
        CostEstimate { total_cost }
    }
}

/// The model catalog collaborator surface.
pub trait ModelCatalog: Send + Sync {
    /// Look up the limits for a model, if known.
    fn limits(&self, model: &str) -> Option<ModelLimits>;

    /// Estimate the cost of a call, if pricing for the model is known.
    fn estimate_cost(&self, model: &str, usage: &TokenUsage) -> Option<CostEstimate>;
}

/// A map-backed [`ModelCatalog`] for embedders and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    models: HashMap<String, (ModelLimits, ModelPricing)>,
}

impl StaticCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model with its limits and pricing.
    #[must_use]
    pub fn with_model(
        mut self,
        model: impl Into<String>,
        limits: ModelLimits,
        pricing: ModelPricing,
    ) -> Self {
        self.models.insert(model.into(), (limits, pricing));
        self
    }
}

impl ModelCatalog for StaticCatalog {
    fn limits(&self, model: &str) -> Option<ModelLimits> {
        self.models.get(model).map(|(limits, _)| *limits)
    }

    fn estimate_cost(&self, model: &str, usage: &TokenUsage) -> Option<CostEstimate> {
        self.models
            .get(model)
            .map(|(_, pricing)| pricing.estimate(usage))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn catalog() -> StaticCatalog {
        StaticCatalog::new().with_model(
            "test-model",
            ModelLimits {
                context_window: 200_000,
                max_output_tokens: 8_192,
            },
            ModelPricing {
                input: 3.0,
                output: 15.0,
                cached_input: 0.3,
                cache_creation: 3.75,
            },
        )
    }

    #[test]
    fn limits_for_known_model() {
        let limits = catalog().limits("test-model").unwrap();
        assert_eq!(limits.context_window, 200_000);
    }

    #[test]
    fn unknown_model_yields_none() {
        assert!(catalog().limits("nope").is_none());
        assert!(
            catalog()
                .estimate_cost("nope", &TokenUsage::zero())
                .is_none()
        );
    }

    #[test]
    fn cost_splits_cached_from_uncached_input() {
        let usage = TokenUsage::new(1_000_000, 0).with_cached(500_000);
        let cost = catalog().estimate_cost("test-model", &usage).unwrap();
        // 500k uncached at $3/M + 500k cached at $0.30/M.
        assert!((cost.total_cost - 1.65).abs() < 1e-9);
    }

    #[test]
    fn cost_counts_output_tokens() {
        let usage = TokenUsage::new(0, 2_000_000);
        let cost = catalog().estimate_cost("test-model", &usage).unwrap();
        assert!((cost.total_cost - 30.0).abs() < 1e-9);
    }
}
