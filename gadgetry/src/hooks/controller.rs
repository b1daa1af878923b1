//! Controller hooks: explicit action decisions.

use async_trait::async_trait;

use super::{ControlResult, SubagentContext};
use crate::gadget::GadgetExecutionResult;
use crate::message::Message;
use crate::parser::ParsedGadgetCall;
use crate::transport::{LlmRequest, TransportError};

/// Decision returned by [`Controller::before_gadget_execution`].
#[derive(Debug, Clone)]
pub enum GadgetPreAction {
    /// Execute normally.
    Proceed,
    /// Skip the executor and fabricate a successful result with zero
    /// execution time. The tree node still moves running → completed.
    Skip {
        /// The fabricated result text.
        result: String,
    },
}

/// Decision returned by [`Controller::after_gadget_execution`].
#[derive(Debug, Clone)]
pub enum GadgetPostAction {
    /// Keep the result as-is.
    Keep,
    /// Clear the error and substitute a fallback result.
    Recover {
        /// The fallback result text.
        result: String,
    },
}

/// Decision returned by [`Controller::on_dependency_failure`].
#[derive(Debug, Clone)]
pub enum DependencyAction {
    /// Skip the dependent call (default policy).
    Skip,
    /// Execute it despite the failed dependency.
    ExecuteAnyway,
    /// Record a synthetic successful result without executing.
    UseFallback {
        /// The synthetic result text.
        result: String,
    },
}

/// Decision returned by [`Controller::before_llm_call`].
#[derive(Debug, Clone)]
pub enum LlmPreAction {
    /// Send the request as built.
    Proceed,
    /// Send with modified sampling options.
    Modify {
        /// Replacement temperature, when set.
        temperature: Option<f32>,
        /// Replacement output token cap, when set.
        max_tokens: Option<u32>,
    },
    /// Skip the call entirely and use a synthetic assistant response.
    Skip {
        /// The synthetic response text.
        response: String,
    },
}

/// Decision returned by [`Controller::after_llm_call`].
#[derive(Debug, Clone)]
pub enum LlmPostAction {
    /// Keep the response and continue.
    Continue,
    /// Replace the final message recorded in conversation history.
    Modify {
        /// Replacement final message.
        final_message: String,
    },
    /// Append extra messages after the conversation update.
    AppendMessages {
        /// Messages to append.
        messages: Vec<Message>,
    },
    /// Both replace the final message and append messages.
    AppendAndModify {
        /// Messages to append.
        messages: Vec<Message>,
        /// Replacement final message.
        final_message: String,
    },
}

/// Decision returned by [`Controller::after_llm_error`].
#[derive(Debug, Clone)]
pub enum LlmErrorAction {
    /// Propagate the error out of the loop (default).
    Surface,
    /// Swallow the error, append a fallback assistant message, and
    /// continue iterating.
    Recover {
        /// The fallback response text.
        response: String,
    },
}

/// Decision points consulted by the stream processor and agent loop.
///
/// All methods default to the non-decisive action, so implementations
/// override only the points they care about. Returning `Err` from any
/// method is a contract violation that aborts the iteration.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Decide whether a gadget executes or is skipped with a synthetic
    /// result.
    async fn before_gadget_execution(
        &self,
        _call: &ParsedGadgetCall,
        _ctx: Option<&SubagentContext>,
    ) -> ControlResult<GadgetPreAction> {
        Ok(GadgetPreAction::Proceed)
    }

    /// Inspect (and possibly recover) a finished gadget result.
    async fn after_gadget_execution(
        &self,
        _result: &GadgetExecutionResult,
        _ctx: Option<&SubagentContext>,
    ) -> ControlResult<GadgetPostAction> {
        Ok(GadgetPostAction::Keep)
    }

    /// Decide what happens to a call whose listed dependency failed.
    async fn on_dependency_failure(
        &self,
        _call: &ParsedGadgetCall,
        _failed_dependency: &str,
        _dependency_error: Option<&str>,
        _ctx: Option<&SubagentContext>,
    ) -> ControlResult<DependencyAction> {
        Ok(DependencyAction::Skip)
    }

    /// Inspect the request before it is sent.
    async fn before_llm_call(
        &self,
        _iteration: usize,
        _request: &LlmRequest,
    ) -> ControlResult<LlmPreAction> {
        Ok(LlmPreAction::Proceed)
    }

    /// Inspect the final message after a successful call.
    async fn after_llm_call(
        &self,
        _iteration: usize,
        _final_message: &str,
    ) -> ControlResult<LlmPostAction> {
        Ok(LlmPostAction::Continue)
    }

    /// Decide whether a terminal LLM failure is surfaced or recovered.
    async fn after_llm_error(
        &self,
        _iteration: usize,
        _error: &TransportError,
    ) -> ControlResult<LlmErrorAction> {
        Ok(LlmErrorAction::Surface)
    }
}
