//! Convenience re-exports of the common surface.

pub use crate::agent::{
    AgentLoop, AgentLoopBuilder, AgentOptions, Compactor, InputHandle, TextOnlyPolicy,
};
pub use crate::catalog::{CostEstimate, ModelCatalog, ModelLimits, ModelPricing, StaticCatalog};
pub use crate::error::{Error, Result};
pub use crate::events::{CompactionEvent, GadgetSkip, StreamEvent, StreamOutcome};
pub use crate::executor::{GadgetContext, GadgetExecutor, SubagentSeed};
pub use crate::gadget::{
    Gadget, GadgetError, GadgetExecutionResult, GadgetRegistry, GadgetReturn, OUTPUT_VIEWER_NAME,
};
pub use crate::hooks::{
    Controller, DependencyAction, GadgetPostAction, GadgetPreAction, HookSet, Interceptor,
    LlmErrorAction, LlmPostAction, LlmPreAction, Observer, SubagentContext,
};
pub use crate::media::{MediaItem, MediaRef, MediaStore};
pub use crate::message::{Message, Role};
pub use crate::output_store::{GadgetOutputViewer, OutputLimitOptions, OutputStore};
pub use crate::parser::{GadgetCallParser, MarkerConfig, ParsedGadgetCall, ParserEvent};
pub use crate::rate_limit::{RateLimitConfig, RateLimitTracker};
pub use crate::retry::RetryConfig;
pub use crate::transport::{
    Chunk, ChunkStream, FinishReason, LlmRequest, LlmTransport, Thinking, TransportError,
    TransportErrorKind,
};
pub use crate::tree::{
    ExecutionTree, GadgetNode, GadgetState, LlmCallNode, LlmCallState, NodeId, NodeKind,
    SkipReason, TreeEvent, TreeNode,
};
pub use crate::usage::TokenUsage;
