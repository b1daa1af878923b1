//! Window-based request and token budgeting.
//!
//! The tracker is queried before every LLM call; [`RateLimitTracker::required_delay`]
//! answers how long the caller must sleep so that admitting one more
//! request keeps the current window under its request and token
//! ceilings. One tracker is shared (via `Arc`) by a root agent and all
//! of its subagents so parallel subagents throttle coherently.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::usage::TokenUsage;

/// Window configuration. A ceiling of zero means "unlimited".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum requests per window.
    pub max_requests: u32,
    /// Maximum tokens (input + output) per window.
    pub max_tokens: u64,
    /// Window duration.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 0,
            max_tokens: 0,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct WindowState {
    started: Instant,
    requests: u32,
    tokens: u64,
}

/// Shared window-based rate-limit tracker.
#[derive(Debug)]
pub struct RateLimitTracker {
    config: RateLimitConfig,
    window: Mutex<WindowState>,
}

impl RateLimitTracker {
    /// Create a tracker with the given configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window: Mutex::new(WindowState {
                started: Instant::now(),
                requests: 0,
                tokens: 0,
            }),
        }
    }

    /// How long the caller must sleep before starting one more request.
    ///
    /// Zero means "proceed immediately".
    #[must_use]
    pub fn required_delay(&self) -> Duration {
        let mut window = self.lock();
        self.roll(&mut window);

        let over_requests =
            self.config.max_requests > 0 && window.requests >= self.config.max_requests;
        let over_tokens = self.config.max_tokens > 0 && window.tokens >= self.config.max_tokens;

        if over_requests || over_tokens {
            let elapsed = window.started.elapsed();
            let delay = self.config.window.saturating_sub(elapsed);
            debug!(
                requests = window.requests,
                tokens = window.tokens,
                delay_ms = delay.as_millis() as u64,
                "rate limit window exhausted",
            );
            delay
        } else {
            Duration::ZERO
        }
    }

    /// Record the start of a request.
    pub fn record_request(&self) {
        let mut window = self.lock();
        self.roll(&mut window);
        window.requests += 1;
    }

    /// Record the final usage of a finished request.
    pub fn record_usage(&self, usage: &TokenUsage) {
        let mut window = self.lock();
        self.roll(&mut window);
        window.tokens += usage.total();
    }

    /// Requests started in the current window.
    #[must_use]
    pub fn current_requests(&self) -> u32 {
        let mut window = self.lock();
        self.roll(&mut window);
        window.requests
    }

    /// Tokens recorded in the current window.
    #[must_use]
    pub fn current_tokens(&self) -> u64 {
        let mut window = self.lock();
        self.roll(&mut window);
        window.tokens
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WindowState> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset the window if its duration has fully elapsed.
    fn roll(&self, window: &mut WindowState) {
        if window.started.elapsed() >= self.config.window {
            window.started = Instant::now();
            window.requests = 0;
            window.tokens = 0;
        }
    }
}
