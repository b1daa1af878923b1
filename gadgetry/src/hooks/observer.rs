//! Observer hooks: awaited, isolated, never fatal.

use std::time::Duration;

use async_trait::async_trait;

use super::{HookResult, SubagentContext};
use crate::events::{CompactionEvent, GadgetSkip};
use crate::gadget::GadgetExecutionResult;
use crate::parser::ParsedGadgetCall;
use crate::transport::{Chunk, TransportError};

/// Fire-and-forget lifecycle notifications.
///
/// All methods default to no-ops; implement only the stages of
/// interest. Errors returned from an observer are counted and logged by
/// the dispatcher, never propagated.
#[async_trait]
pub trait Observer: Send + Sync {
    /// A raw chunk arrived from the transport.
    async fn on_stream_chunk(
        &self,
        _chunk: &Chunk,
        _ctx: Option<&SubagentContext>,
    ) -> HookResult {
        Ok(())
    }

    /// A gadget is about to execute (after parameter interception and
    /// the pre-execution controller).
    async fn on_gadget_execution_start(
        &self,
        _call: &ParsedGadgetCall,
        _ctx: Option<&SubagentContext>,
    ) -> HookResult {
        Ok(())
    }

    /// A gadget finished executing.
    async fn on_gadget_execution_complete(
        &self,
        _result: &GadgetExecutionResult,
        _ctx: Option<&SubagentContext>,
    ) -> HookResult {
        Ok(())
    }

    /// A gadget was skipped.
    async fn on_gadget_skipped(
        &self,
        _skip: &GadgetSkip,
        _ctx: Option<&SubagentContext>,
    ) -> HookResult {
        Ok(())
    }

    /// An LLM-call node was created for this iteration.
    async fn on_llm_call_start(&self, _iteration: usize, _model: &str) -> HookResult {
        Ok(())
    }

    /// Pre-call controllers ran; the request is about to go out.
    async fn on_llm_call_ready(&self, _iteration: usize, _model: &str) -> HookResult {
        Ok(())
    }

    /// A transport failure is about to be retried after `delay`.
    async fn on_retry_attempt(
        &self,
        _attempt: u32,
        _delay: Duration,
        _error: &TransportError,
    ) -> HookResult {
        Ok(())
    }

    /// The rate-limit tracker advised sleeping before the next call.
    async fn on_rate_limit_throttle(&self, _delay: Duration) -> HookResult {
        Ok(())
    }

    /// The abort signal was observed at an iteration boundary.
    async fn on_abort(&self) -> HookResult {
        Ok(())
    }

    /// The conversation was compacted.
    async fn on_compaction(&self, _event: &CompactionEvent) -> HookResult {
        Ok(())
    }
}
