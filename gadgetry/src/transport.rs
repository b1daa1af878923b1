//! The LLM transport collaborator surface.
//!
//! A transport turns an [`LlmRequest`] into a stream of [`Chunk`]s. The
//! crate never talks HTTP itself; concrete providers implement
//! [`LlmTransport`] and are handed to the agent loop. The transport must
//! honor the cancellation token carried by the request.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::usage::TokenUsage;

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum FinishReason {
    /// Natural end of the response.
    #[default]
    Stop,
    /// Output token limit reached.
    Length,
    /// Content was filtered.
    ContentFilter,
    /// The call was interrupted before the model finished.
    Interrupted,
}

impl FinishReason {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::Interrupted => "interrupted",
        }
    }

    /// Parse a provider finish-reason string (case-insensitive).
    ///
    /// Unknown values default to [`FinishReason::Stop`], matching the most
    /// common provider behavior for end-of-turn markers.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "length" | "max_tokens" => Self::Length,
            "content_filter" => Self::ContentFilter,
            "interrupted" | "aborted" => Self::Interrupted,
            _ => Self::Stop,
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thinking (reasoning) content attached to a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thinking {
    /// The reasoning text.
    pub content: String,
    /// Provider-specific thinking variant tag.
    pub thinking_type: String,
}

/// One streamed fragment of an LLM response.
///
/// Any combination of fields may be present; a final chunk typically
/// carries `finish_reason` and `usage`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Visible response text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Reasoning content, passed through to consumers unmodified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Thinking>,

    /// Why generation stopped, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,

    /// Token usage, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl Chunk {
    /// Create a text-only chunk.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            text: Some(content.into()),
            ..Self::default()
        }
    }

    /// Create a thinking-only chunk.
    #[must_use]
    pub fn thinking(content: impl Into<String>, thinking_type: impl Into<String>) -> Self {
        Self {
            thinking: Some(Thinking {
                content: content.into(),
                thinking_type: thinking_type.into(),
            }),
            ..Self::default()
        }
    }

    /// Create a terminal chunk carrying the finish reason and usage.
    #[must_use]
    pub fn done(finish_reason: FinishReason, usage: Option<TokenUsage>) -> Self {
        Self {
            finish_reason: Some(finish_reason),
            usage,
            ..Self::default()
        }
    }

    /// Returns `true` if the chunk carries no content at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.thinking.is_none()
            && self.finish_reason.is_none()
            && self.usage.is_none()
    }
}

/// A request for one LLM call.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Model identifier.
    pub model: String,
    /// The full conversation to send.
    pub messages: Vec<Message>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Output token cap.
    pub max_tokens: Option<u32>,
    /// Cancellation signal the transport must propagate into its I/O.
    pub cancel: CancellationToken,
}

impl LlmRequest {
    /// Create a request with the given model and messages.
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TransportErrorKind {
    /// Connection-level failure (DNS, reset, TLS).
    Network,
    /// The request or stream timed out.
    Timeout,
    /// The provider returned a rate-limit status.
    RateLimited,
    /// The provider reported overload.
    Overloaded,
    /// Any other provider-reported error.
    Api,
    /// The request was aborted by the caller.
    Aborted,
}

/// A failure surfaced by the LLM transport, possibly mid-stream.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} error: {message}")]
pub struct TransportError {
    /// Failure classification.
    pub kind: TransportErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// HTTP status, when one was observed.
    pub status: Option<u16>,
    /// Server-issued retry hint, when one was observed.
    pub retry_after: Option<Duration>,
}

impl TransportError {
    /// Create an error of the given kind.
    #[must_use]
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// A network-level failure.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    /// A rate-limit failure, optionally carrying a `Retry-After` hint.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            status: Some(429),
            retry_after,
            ..Self::new(TransportErrorKind::RateLimited, message)
        }
    }

    /// A provider API failure with an HTTP status.
    #[must_use]
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(TransportErrorKind::Api, message)
        }
    }

    /// An abort triggered through the request's cancellation token.
    #[must_use]
    pub fn aborted() -> Self {
        Self::new(TransportErrorKind::Aborted, "request aborted")
    }

    /// Attach an HTTP status.
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Returns `true` if this error was caused by cancellation.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Aborted)
    }

    /// Default retryability classification.
    ///
    /// Network-transient failures, timeouts, rate limits, overload, and
    /// 408/409/429/5xx statuses are retryable. Aborts never are.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            TransportErrorKind::Network
            | TransportErrorKind::Timeout
            | TransportErrorKind::RateLimited
            | TransportErrorKind::Overloaded => true,
            TransportErrorKind::Aborted => false,
            TransportErrorKind::Api => self
                .status
                .is_some_and(|s| s == 408 || s == 409 || s == 429 || s >= 500),
        }
    }
}

/// A boxed stream of chunks from one LLM call.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, TransportError>> + Send>>;

/// The provider transport collaborator.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    /// Open a chunk stream for the given request.
    ///
    /// The transport must terminate the stream with a
    /// [`TransportError::aborted`] item if the request's cancellation
    /// token trips mid-stream.
    async fn stream(&self, request: LlmRequest) -> Result<ChunkStream, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    mod finish_reason {
        use super::*;

        #[test]
        fn parse_provider_aliases() {
            assert_eq!(FinishReason::parse("max_tokens"), FinishReason::Length);
            assert_eq!(FinishReason::parse("LENGTH"), FinishReason::Length);
            assert_eq!(FinishReason::parse("aborted"), FinishReason::Interrupted);
            assert_eq!(FinishReason::parse("end_turn"), FinishReason::Stop);
        }

        #[test]
        fn display_matches_as_str() {
            assert_eq!(FinishReason::Interrupted.to_string(), "interrupted");
        }
    }

    mod transport_error {
        use super::*;

        #[test]
        fn rate_limited_is_retryable_with_hint() {
            let err = TransportError::rate_limited("slow down", Some(Duration::from_secs(2)));
            assert!(err.is_retryable());
            assert_eq!(err.status, Some(429));
            assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
        }

        #[test]
        fn server_errors_are_retryable() {
            assert!(TransportError::api(500, "boom").is_retryable());
            assert!(TransportError::api(529, "overloaded").is_retryable());
            assert!(TransportError::api(408, "timeout").is_retryable());
        }

        #[test]
        fn client_errors_are_not_retryable() {
            assert!(!TransportError::api(400, "bad request").is_retryable());
            assert!(!TransportError::api(401, "unauthorized").is_retryable());
        }

        #[test]
        fn abort_is_never_retryable() {
            let err = TransportError::aborted();
            assert!(err.is_aborted());
            assert!(!err.is_retryable());
        }
    }

    mod chunk {
        use super::*;

        #[test]
        fn text_chunk_has_only_text() {
            let chunk = Chunk::text("hello");
            assert_eq!(chunk.text.as_deref(), Some("hello"));
            assert!(chunk.finish_reason.is_none());
            assert!(!chunk.is_empty());
        }

        #[test]
        fn done_chunk_carries_usage() {
            let chunk = Chunk::done(FinishReason::Stop, Some(TokenUsage::new(10, 5)));
            assert_eq!(chunk.finish_reason, Some(FinishReason::Stop));
            assert_eq!(chunk.usage.map(|u| u.total()), Some(15));
        }
    }
}
