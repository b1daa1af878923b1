//! Test doubles for the transport collaborator.
//!
//! [`MockTransport`] plays back a script of attempts: each call to
//! `stream` pops the next attempt, which either fails to connect or
//! yields its items one by one (optionally spaced by a delay, and
//! cut short by the request's cancellation token).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::transport::{
    Chunk, ChunkStream, FinishReason, LlmRequest, LlmTransport, TransportError,
};
use crate::usage::TokenUsage;

enum Attempt {
    Connect(Vec<Result<Chunk, TransportError>>),
    Refuse(TransportError),
}

/// A scripted transport for tests.
#[derive(Default)]
pub struct MockTransport {
    attempts: Mutex<VecDeque<Attempt>>,
    calls: AtomicUsize,
    chunk_delay: Option<Duration>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    /// An empty script; add attempts with the `then_*` methods.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Space chunk delivery by `delay`.
    #[must_use]
    pub const fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Script a successful attempt delivering `chunks`.
    #[must_use]
    pub fn then_chunks(self, chunks: Vec<Chunk>) -> Self {
        self.push(Attempt::Connect(chunks.into_iter().map(Ok).collect()));
        self
    }

    /// Script one plain-text response ending with `finish_reason`.
    #[must_use]
    pub fn then_text(self, text: &str, finish_reason: FinishReason) -> Self {
        self.then_chunks(vec![
            Chunk::text(text),
            Chunk::done(finish_reason, Some(TokenUsage::new(10, text.len() as u64))),
        ])
    }

    /// Script an attempt whose stream yields `items` verbatim (use for
    /// mid-stream failures).
    #[must_use]
    pub fn then_stream(self, items: Vec<Result<Chunk, TransportError>>) -> Self {
        self.push(Attempt::Connect(items));
        self
    }

    /// Script a connection-level failure.
    #[must_use]
    pub fn then_error(self, error: TransportError) -> Self {
        self.push(Attempt::Refuse(error));
        self
    }

    /// Number of times `stream` was called.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(&self, attempt: Attempt) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(attempt);
    }
}

#[async_trait]
impl LlmTransport for MockTransport {
    async fn stream(&self, request: LlmRequest) -> Result<ChunkStream, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let attempt = self
            .attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| TransportError::api(500, "mock script exhausted"))?;

        match attempt {
            Attempt::Refuse(error) => Err(error),
            Attempt::Connect(items) => {
                let delay = self.chunk_delay;
                let cancel = request.cancel;
                let stream = async_stream::stream! {
                    for item in items {
                        if cancel.is_cancelled() {
                            yield Err(TransportError::aborted());
                            return;
                        }
                        if let Some(delay) = delay {
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                () = cancel.cancelled() => {
                                    yield Err(TransportError::aborted());
                                    return;
                                }
                            }
                        }
                        yield item;
                    }
                };
                Ok(Box::pin(stream))
            }
        }
    }
}
