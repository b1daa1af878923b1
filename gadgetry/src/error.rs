//! Error types for the gadgetry crate.
//!
//! Gadget-level failures (validation, execution, timeout, dependency
//! skips) are data carried on results and events, not `Err` values; the
//! model reacts to them on the next iteration. This module covers the
//! failures that do abort an iteration or a run: transport errors that
//! exhaust their retries, aborts, and hook contract violations.

use thiserror::Error;

use crate::transport::TransportError;

/// A type alias for `Result<T, Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the agent loop and stream processor.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The transport failed and the failure was not (or no longer)
    /// retryable.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The transport kept failing until the retry budget ran out.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of attempts made, including the first.
        attempts: u32,
        /// The last transport failure observed.
        source: TransportError,
    },

    /// The run was aborted through the cancellation token.
    #[error("aborted")]
    Aborted,

    /// A controller broke its contract; this is a programmer error and
    /// aborts the iteration.
    #[error("hook contract violation in `{hook}`: {message}")]
    HookContract {
        /// The extension point that misbehaved.
        hook: &'static str,
        /// Failure detail.
        message: String,
    },

    /// The loop was built with an invalid or incomplete configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// Filesystem failure from the optional session log.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build a [`Error::Configuration`].
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Build a [`Error::HookContract`] from a controller failure.
    #[must_use]
    pub fn hook_contract(
        hook: &'static str,
        err: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::HookContract {
            hook,
            message: err.to_string(),
        }
    }

    /// Returns `true` for errors caused by cancellation.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        match self {
            Self::Aborted => true,
            Self::Transport(e) => e.is_aborted(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_abort_is_aborted() {
        let err = Error::from(TransportError::aborted());
        assert!(err.is_aborted());
    }

    #[test]
    fn retries_exhausted_formats_attempts() {
        let err = Error::RetriesExhausted {
            attempts: 4,
            source: TransportError::api(500, "boom"),
        };
        assert!(err.to_string().contains("4 attempts"));
        assert!(!err.is_aborted());
    }

    #[test]
    fn hook_contract_names_the_hook() {
        let err = Error::hook_contract("before_llm_call", "bad action".into());
        assert!(err.to_string().contains("before_llm_call"));
    }
}
