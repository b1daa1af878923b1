//! Retry policy for LLM transport failures.
//!
//! A pure calculator: the agent loop asks whether an error is worth
//! retrying and how long to back off, and performs the sleeping itself.
//! Backoff grows exponentially from `min_timeout` by `factor`, capped at
//! `max_timeout`, with optional uniform jitter in [0.5, 1.5]. A
//! server-issued `Retry-After` hint overrides the computed backoff
//! (clamped to `max_retry_after`) when `respect_retry_after` is set.

use std::sync::Arc;
use std::time::Duration;

use crate::transport::TransportError;

/// User-supplied override for retryability classification.
pub type RetryPredicate = Arc<dyn Fn(&TransportError) -> bool + Send + Sync>;

/// Retry configuration.
#[derive(Clone)]
pub struct RetryConfig {
    /// Number of retries after the first attempt.
    pub retries: u32,
    /// Backoff for the first retry.
    pub min_timeout: Duration,
    /// Backoff ceiling.
    pub max_timeout: Duration,
    /// Exponential growth factor.
    pub factor: f64,
    /// Apply uniform jitter in [0.5, 1.5].
    pub randomize: bool,
    /// Prefer a server-issued `Retry-After` hint over the backoff.
    pub respect_retry_after: bool,
    /// Ceiling applied to `Retry-After` hints.
    pub max_retry_after: Duration,
    /// Overrides the default retryability classification when set.
    pub should_retry: Option<RetryPredicate>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            min_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(30),
            factor: 2.0,
            randomize: true,
            respect_retry_after: true,
            max_retry_after: Duration::from_secs(60),
            should_retry: None,
        }
    }
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("retries", &self.retries)
            .field("min_timeout", &self.min_timeout)
            .field("max_timeout", &self.max_timeout)
            .field("factor", &self.factor)
            .field("randomize", &self.randomize)
            .field("respect_retry_after", &self.respect_retry_after)
            .field("max_retry_after", &self.max_retry_after)
            .field("should_retry", &self.should_retry.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl RetryConfig {
    /// Returns `true` if `error` is worth retrying under this policy.
    #[must_use]
    pub fn should_retry(&self, error: &TransportError) -> bool {
        match &self.should_retry {
            Some(predicate) => predicate(error),
            None => error.is_retryable(),
        }
    }

    /// Backoff delay for a 1-indexed attempt number.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1).min(63) as i32);
        let base = self.min_timeout.as_secs_f64() * exp;
        let capped = base.min(self.max_timeout.as_secs_f64());
        let jittered = if self.randomize {
            capped * (0.5 + fastrand::f64())
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }

    /// Delay to apply after `error` on the given 1-indexed attempt.
    ///
    /// Uses the error's `Retry-After` hint in place of the backoff when
    /// configured to, clamped to `max_retry_after`.
    #[must_use]
    pub fn delay_after(&self, attempt: u32, error: &TransportError) -> Duration {
        if self.respect_retry_after
            && let Some(hint) = error.retry_after
        {
            return hint.min(self.max_retry_after);
        }
        self.backoff(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportErrorKind;

    fn plain() -> RetryConfig {
        RetryConfig {
            randomize: false,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn backoff_grows_exponentially() {
        let config = plain();
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn backoff_is_capped() {
        let config = plain();
        assert_eq!(config.backoff(20), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_half_to_one_and_a_half() {
        let config = RetryConfig::default();
        for _ in 0..50 {
            let delay = config.backoff(1);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn retry_after_hint_overrides_backoff() {
        let config = plain();
        let err = TransportError::rate_limited("slow", Some(Duration::from_secs(7)));
        assert_eq!(config.delay_after(1, &err), Duration::from_secs(7));
    }

    #[test]
    fn retry_after_hint_is_clamped() {
        let config = plain();
        let err = TransportError::rate_limited("slow", Some(Duration::from_secs(600)));
        assert_eq!(config.delay_after(1, &err), Duration::from_secs(60));
    }

    #[test]
    fn hint_ignored_when_not_respected() {
        let config = RetryConfig {
            respect_retry_after: false,
            ..plain()
        };
        let err = TransportError::rate_limited("slow", Some(Duration::from_secs(7)));
        assert_eq!(config.delay_after(2, &err), Duration::from_secs(2));
    }

    #[test]
    fn predicate_overrides_default_classification() {
        let config = RetryConfig {
            should_retry: Some(Arc::new(|e: &TransportError| {
                e.message.contains("flaky")
            })),
            ..plain()
        };
        let retryable_by_default = TransportError::new(TransportErrorKind::Network, "down");
        assert!(!config.should_retry(&retryable_by_default));
        let flaky = TransportError::api(400, "flaky thing");
        assert!(config.should_retry(&flaky));
    }

    #[test]
    fn default_classification_used_without_predicate() {
        let config = plain();
        assert!(config.should_retry(&TransportError::network("down")));
        assert!(!config.should_retry(&TransportError::api(401, "no")));
    }
}
