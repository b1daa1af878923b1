//! The public stream event envelope.
//!
//! [`StreamEvent`] is what the stream processor yields and the agent
//! loop re-yields to its consumer (the loop swallows the terminal
//! [`StreamEvent::StreamComplete`], which is iteration-internal).

use crate::gadget::GadgetExecutionResult;
use crate::hooks::SubagentContext;
use crate::parser::ParsedGadgetCall;
use crate::transport::FinishReason;
use crate::tree::SkipReason;
use crate::usage::TokenUsage;

/// Details of a gadget that was skipped instead of executed.
#[derive(Debug, Clone)]
pub struct GadgetSkip {
    /// Gadget name.
    pub gadget_name: String,
    /// Invocation id of the skipped call.
    pub invocation_id: String,
    /// The parameters the call carried.
    pub parameters: serde_json::Value,
    /// Why the gadget was skipped.
    pub reason: SkipReason,
    /// The dependency whose failure caused the skip, when applicable.
    pub failed_dependency: Option<String>,
    /// That dependency's error text, when known.
    pub failed_dependency_error: Option<String>,
    /// Structural error text (circular or missing dependencies).
    pub error: Option<String>,
}

/// A context-compaction notification from the agent loop.
#[derive(Debug, Clone)]
pub struct CompactionEvent {
    /// Message count before compaction.
    pub messages_before: usize,
    /// Message count after compaction.
    pub messages_after: usize,
    /// Optional summary the compactor produced.
    pub summary: Option<String>,
}

/// Terminal payload of one processed stream.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    /// Finish reason reported by the transport.
    pub finish_reason: Option<FinishReason>,
    /// Usage reported by the transport.
    pub usage: Option<TokenUsage>,
    /// The accumulated raw response text.
    pub raw_response: String,
    /// The raw response after `assistant_message` interception.
    pub final_message: String,
    /// Whether any gadget call was scheduled this iteration.
    pub did_execute_gadgets: bool,
    /// Whether a gadget raised the break-loop signal.
    pub should_break_loop: bool,
    /// Final message from the break-loop signal, if one was given.
    pub break_message: Option<String>,
    /// Invocation ids that completed successfully this iteration.
    pub completed_ids: Vec<String>,
    /// Invocation ids that failed or were skipped this iteration.
    pub failed_ids: Vec<String>,
}

/// Events yielded while processing one LLM response stream.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum StreamEvent {
    /// Prose from the model.
    Text {
        /// Text content.
        content: String,
    },

    /// Reasoning content, passed through unmodified.
    Thinking {
        /// Reasoning text.
        content: String,
        /// Provider-specific thinking variant tag.
        thinking_type: String,
    },

    /// A gadget call was parsed; emitted before the call is scheduled.
    GadgetCall {
        /// The parsed call.
        call: ParsedGadgetCall,
    },

    /// A gadget finished (success or failure).
    GadgetResult {
        /// The execution result.
        result: GadgetExecutionResult,
    },

    /// A gadget was skipped.
    GadgetSkipped(GadgetSkip),

    /// The LLM response stream ended; useful for "model thinking time"
    /// metrics.
    LlmResponseEnd {
        /// Finish reason, when known.
        finish_reason: Option<FinishReason>,
        /// Usage, when known.
        usage: Option<TokenUsage>,
    },

    /// The conversation was compacted between iterations.
    Compaction {
        /// Compaction details.
        event: CompactionEvent,
    },

    /// An event emitted by a subagent running inside a gadget.
    SubagentEvent {
        /// Which gadget spawned the subagent, and how deep it runs.
        context: SubagentContext,
        /// The subagent's own event.
        event: Box<StreamEvent>,
    },

    /// Terminal event of one processed stream; not re-yielded by the
    /// agent loop.
    StreamComplete(StreamOutcome),
}

impl StreamEvent {
    /// Create a text event.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Returns `true` for the terminal event.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::StreamComplete(_))
    }
}
