//! Interceptor hooks: synchronous pure transforms.

use serde_json::Value;

use super::SubagentContext;
use crate::transport::Chunk;

/// Synchronous value transforms applied in registration order.
///
/// The chunk and text points may drop their value by returning `None`;
/// the remaining points are total transforms.
pub trait Interceptor: Send + Sync {
    /// Transform or drop a raw transport chunk before it is parsed.
    fn raw_chunk(&self, chunk: Chunk) -> Option<Chunk> {
        Some(chunk)
    }

    /// Transform or drop a parsed text fragment before it is yielded.
    fn text_chunk(&self, text: String) -> Option<String> {
        Some(text)
    }

    /// Rewrite gadget parameters before validation and execution.
    fn gadget_parameters(
        &self,
        _gadget_name: &str,
        params: Value,
        _ctx: Option<&SubagentContext>,
    ) -> Value {
        params
    }

    /// Rewrite a gadget's result string before it is recorded.
    fn gadget_result(
        &self,
        _gadget_name: &str,
        result: String,
        _ctx: Option<&SubagentContext>,
    ) -> String {
        result
    }

    /// Rewrite the accumulated assistant message at end of stream.
    fn assistant_message(&self, message: String) -> String {
        message
    }
}
