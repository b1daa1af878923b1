//! Token usage tracking for LLM calls.
//!
//! [`TokenUsage`] carries the per-call token counts reported by the
//! transport, including cache-related breakdowns, and supports summation
//! across calls and subtrees.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Token counts for a single LLM call (or an aggregate over several).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the request.
    #[serde(default)]
    pub input_tokens: u64,

    /// Tokens in the generated response.
    #[serde(default)]
    pub output_tokens: u64,

    /// Input tokens served from the provider's prompt cache.
    #[serde(default)]
    pub cached_input_tokens: u64,

    /// Input tokens written into the provider's prompt cache.
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl TokenUsage {
    /// Create a usage record from input and output token counts.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cached_input_tokens: 0,
            cache_creation_input_tokens: 0,
        }
    }

    /// A zeroed usage record.
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0, 0)
    }

    /// Set the cached input token count.
    #[must_use]
    pub const fn with_cached(mut self, cached_input_tokens: u64) -> Self {
        self.cached_input_tokens = cached_input_tokens;
        self
    }

    /// Set the cache-creation input token count.
    #[must_use]
    pub const fn with_cache_creation(mut self, cache_creation_input_tokens: u64) -> Self {
        self.cache_creation_input_tokens = cache_creation_input_tokens;
        self
    }

    /// Total tokens consumed (input + output).
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Returns `true` if no tokens were recorded.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            cached_input_tokens: self.cached_input_tokens + rhs.cached_input_tokens,
            cache_creation_input_tokens: self.cache_creation_input_tokens
                + rhs.cache_creation_input_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_sets_totals() {
        let usage = TokenUsage::new(100, 50);
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 50);
        assert_eq!(usage.total(), 150);
        assert!(!usage.is_zero());
    }

    #[test]
    fn zero_is_zero() {
        assert!(TokenUsage::zero().is_zero());
        assert_eq!(TokenUsage::zero().total(), 0);
    }

    #[test]
    fn add_sums_all_fields() {
        let a = TokenUsage::new(10, 20).with_cached(5).with_cache_creation(1);
        let b = TokenUsage::new(1, 2).with_cached(3).with_cache_creation(4);
        let sum = a + b;
        assert_eq!(sum.input_tokens, 11);
        assert_eq!(sum.output_tokens, 22);
        assert_eq!(sum.cached_input_tokens, 8);
        assert_eq!(sum.cache_creation_input_tokens, 5);
    }

    #[test]
    fn add_assign_accumulates() {
        let mut total = TokenUsage::zero();
        total += TokenUsage::new(7, 3);
        total += TokenUsage::new(1, 1);
        assert_eq!(total.total(), 12);
    }

    #[test]
    fn serde_defaults_missing_fields() {
        let usage: TokenUsage = serde_json::from_str(r#"{"input_tokens": 5}"#).unwrap();
        assert_eq!(usage.input_tokens, 5);
        assert_eq!(usage.output_tokens, 0);
        assert_eq!(usage.cached_input_tokens, 0);
    }
}
