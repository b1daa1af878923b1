//! Run options for the agent loop.

use std::time::Duration;

use crate::output_store::OutputLimitOptions;
use crate::parser::MarkerConfig;

/// What the loop does when an iteration produced no gadget calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextOnlyPolicy {
    /// Treat plain text as the final answer and stop.
    #[default]
    Terminate,
    /// Nudge the model to continue with an acknowledgement message.
    Acknowledge,
    /// Park until a user message is injected.
    WaitForInput,
}

/// Configuration for one agent loop.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Model identifier sent to the transport.
    pub model: String,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Output token cap per call.
    pub max_tokens: Option<u32>,
    /// Iteration budget.
    pub max_iterations: usize,
    /// Await gadget lifecycles inline instead of running them as
    /// parallel tasks.
    pub sequential_gadgets: bool,
    /// Gadget lifecycles allowed per response; 0 means unlimited.
    pub max_gadgets_per_response: usize,
    /// Per-gadget concurrency ceiling; 0 means unlimited.
    pub max_concurrent_gadgets: usize,
    /// Timeout for gadgets that declare none of their own.
    pub default_gadget_timeout: Duration,
    /// Policy for iterations without gadget calls.
    pub text_only_policy: TextOnlyPolicy,
    /// Bound gadget results relative to the model context window.
    pub output_limit: Option<OutputLimitOptions>,
    /// Wire-format markers.
    pub markers: MarkerConfig,
    /// Rebuild assistant history messages as rendered call blocks,
    /// wrapping accompanying prose in a synthetic `note` call.
    pub fold_plain_text: bool,
}

impl AgentOptions {
    /// Options for the given model with defaults everywhere else.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
            max_iterations: 10,
            sequential_gadgets: false,
            max_gadgets_per_response: 0,
            max_concurrent_gadgets: 0,
            default_gadget_timeout: Duration::from_secs(60),
            text_only_policy: TextOnlyPolicy::default(),
            output_limit: None,
            markers: MarkerConfig::default(),
            fold_plain_text: false,
        }
    }

    /// Set the sampling temperature.
    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the output token cap.
    #[must_use]
    pub const fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the iteration budget.
    #[must_use]
    pub const fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Run gadget lifecycles inline, one at a time.
    #[must_use]
    pub const fn sequential(mut self) -> Self {
        self.sequential_gadgets = true;
        self
    }

    /// Cap gadget lifecycles per response.
    #[must_use]
    pub const fn max_gadgets_per_response(mut self, cap: usize) -> Self {
        self.max_gadgets_per_response = cap;
        self
    }

    /// Cap concurrent executions per gadget name.
    #[must_use]
    pub const fn max_concurrent_gadgets(mut self, cap: usize) -> Self {
        self.max_concurrent_gadgets = cap;
        self
    }

    /// Set the default gadget timeout.
    #[must_use]
    pub const fn default_gadget_timeout(mut self, timeout: Duration) -> Self {
        self.default_gadget_timeout = timeout;
        self
    }

    /// Set the text-only policy.
    #[must_use]
    pub const fn text_only_policy(mut self, policy: TextOnlyPolicy) -> Self {
        self.text_only_policy = policy;
        self
    }

    /// Enable output limiting.
    #[must_use]
    pub const fn output_limit(mut self, options: OutputLimitOptions) -> Self {
        self.output_limit = Some(options);
        self
    }

    /// Use custom wire-format markers.
    #[must_use]
    pub fn markers(mut self, markers: MarkerConfig) -> Self {
        self.markers = markers;
        self
    }
}
