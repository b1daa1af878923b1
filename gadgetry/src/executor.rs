//! The gadget executor and the context handed to running gadgets.
//!
//! The executor turns a parsed call into a [`GadgetExecutionResult`]:
//! registry lookup, schema-guided coercion, validation, timed execution
//! under a per-gadget cancellation token, and normalization of the
//! return value (including the break-loop signal). Failures are data on
//! the result; the executor itself never errors.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog::ModelCatalog;
use crate::events::StreamEvent;
use crate::gadget::{
    GadgetError, GadgetExecutionResult, GadgetRegistry, coerce_parameters, validate_parameters,
};
use crate::hooks::{HookSet, SubagentContext};
use crate::media::MediaStore;
use crate::output_store::OutputStore;
use crate::parser::ParsedGadgetCall;
use crate::rate_limit::RateLimitTracker;
use crate::retry::RetryConfig;
use crate::transport::LlmTransport;
use crate::tree::{ExecutionTree, NodeId};

/// Synchronous delivery of subagent events for real-time UIs.
pub type SubagentCallback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Sink wired by the stream processor; receives wrapped subagent events.
pub type SubagentEmitter = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Everything a subagent loop shares with its parent.
///
/// Built by [`GadgetContext::subagent_seed`]; a gadget that spawns a
/// subagent hands the seed to the agent-loop builder so the child runs
/// on the parent's tree, abort signal, and rate limiter, with the
/// spawning gadget's node as parent for its LLM calls.
#[derive(Clone)]
pub struct SubagentSeed {
    /// Shared execution tree.
    pub tree: ExecutionTree,
    /// Shared abort signal (the spawning gadget's token).
    pub cancel: CancellationToken,
    /// Shared rate-limit tracker.
    pub rate_limiter: Arc<RateLimitTracker>,
    /// Shared media store.
    pub media: MediaStore,
    /// Shared oversize-output store.
    pub outputs: OutputStore,
    /// Retry policy inherited from the parent.
    pub retry: RetryConfig,
    /// LLM transport handle.
    pub transport: Arc<dyn LlmTransport>,
    /// Model catalog handle, when the parent has one.
    pub catalog: Option<Arc<dyn ModelCatalog>>,
    /// The parent agent's hooks; gadget-scoped parent observers fire
    /// through these with a subagent context attached.
    pub parent_hooks: Arc<HookSet>,
    /// The spawning gadget's node: parent for subagent LLM calls.
    pub parent_node: NodeId,
    /// Depth of the subagent's LLM-call nodes.
    pub depth: usize,
    /// Shared invocation-id counter.
    pub counter: Arc<AtomicU64>,
    /// The identity the subagent's events carry.
    pub context: SubagentContext,
}

impl std::fmt::Debug for SubagentSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubagentSeed")
            .field("parent_node", &self.parent_node)
            .field("depth", &self.depth)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Execution context handed to a gadget's `execute`.
pub struct GadgetContext {
    /// Per-gadget cancellation token, derived from the agent's abort
    /// signal; tripped on timeout.
    pub cancel: CancellationToken,
    /// Shared execution tree.
    pub tree: ExecutionTree,
    /// Shared media store.
    pub media: MediaStore,
    /// Shared oversize-output store.
    pub outputs: OutputStore,
    /// This gadget's tree node.
    pub node_id: NodeId,
    /// This gadget's invocation id.
    pub invocation_id: String,
    /// Depth of this gadget's node.
    pub depth: usize,
    /// Shared rate-limit tracker.
    pub rate_limiter: Arc<RateLimitTracker>,
    /// Retry policy, shared with subagents.
    pub retry: RetryConfig,
    /// LLM transport, present when the loop was given one to lend out.
    pub transport: Option<Arc<dyn LlmTransport>>,
    /// Model catalog.
    pub catalog: Option<Arc<dyn ModelCatalog>>,
    pub(crate) parent_hooks: Arc<HookSet>,
    pub(crate) counter: Arc<AtomicU64>,
    pub(crate) subagent_callback: Option<SubagentCallback>,
    pub(crate) emitter: Option<SubagentEmitter>,
    reported_cost: Mutex<f64>,
}

impl std::fmt::Debug for GadgetContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GadgetContext")
            .field("node_id", &self.node_id)
            .field("invocation_id", &self.invocation_id)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl GadgetContext {
    /// Accumulate additional cost onto this invocation.
    pub fn report_cost(&self, cost: f64) {
        *self
            .reported_cost
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += cost;
    }

    /// Cost reported through [`GadgetContext::report_cost`] so far.
    #[must_use]
    pub fn reported_cost(&self) -> f64 {
        *self
            .reported_cost
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The subagent context a child spawned here would carry.
    #[must_use]
    pub fn subagent_context(&self) -> SubagentContext {
        SubagentContext {
            parent_invocation_id: self.invocation_id.clone(),
            depth: self.depth + 1,
        }
    }

    /// Build the seed for spawning a subagent from this gadget.
    ///
    /// Returns `None` when the owning loop was not given a transport to
    /// lend out.
    #[must_use]
    pub fn subagent_seed(&self) -> Option<SubagentSeed> {
        let transport = self.transport.clone()?;
        Some(SubagentSeed {
            tree: self.tree.clone(),
            cancel: self.cancel.clone(),
            rate_limiter: Arc::clone(&self.rate_limiter),
            media: self.media.clone(),
            outputs: self.outputs.clone(),
            retry: self.retry.clone(),
            transport,
            catalog: self.catalog.clone(),
            parent_hooks: Arc::clone(&self.parent_hooks),
            parent_node: self.node_id,
            depth: self.depth + 1,
            counter: Arc::clone(&self.counter),
            context: self.subagent_context(),
        })
    }

    /// Forward one subagent event to the enclosing agent.
    ///
    /// Delivery is threefold: the synchronous callback (when configured)
    /// fires immediately, and the wrapped event is queued for the
    /// enclosing processor's stream. Tree mutations made by the subagent
    /// are observable on the shared tree bus independently of this call.
    pub fn emit_subagent_event(&self, event: StreamEvent) {
        let wrapped = StreamEvent::SubagentEvent {
            context: self.subagent_context(),
            event: Box::new(event),
        };
        if let Some(callback) = &self.subagent_callback {
            callback(&wrapped);
        }
        if let Some(emitter) = &self.emitter {
            emitter(wrapped);
        }
    }
}

/// Construction parameters for [`GadgetContext`]; assembled by the
/// stream processor per gadget invocation.
pub(crate) struct GadgetContextParts {
    pub cancel: CancellationToken,
    pub tree: ExecutionTree,
    pub media: MediaStore,
    pub outputs: OutputStore,
    pub node_id: NodeId,
    pub invocation_id: String,
    pub depth: usize,
    pub rate_limiter: Arc<RateLimitTracker>,
    pub retry: RetryConfig,
    pub transport: Option<Arc<dyn LlmTransport>>,
    pub catalog: Option<Arc<dyn ModelCatalog>>,
    pub parent_hooks: Arc<HookSet>,
    pub counter: Arc<AtomicU64>,
    pub subagent_callback: Option<SubagentCallback>,
    pub emitter: Option<SubagentEmitter>,
}

impl GadgetContextParts {
    pub fn build(self) -> GadgetContext {
        GadgetContext {
            cancel: self.cancel,
            tree: self.tree,
            media: self.media,
            outputs: self.outputs,
            node_id: self.node_id,
            invocation_id: self.invocation_id,
            depth: self.depth,
            rate_limiter: self.rate_limiter,
            retry: self.retry,
            transport: self.transport,
            catalog: self.catalog,
            parent_hooks: self.parent_hooks,
            counter: self.counter,
            subagent_callback: self.subagent_callback,
            emitter: self.emitter,
            reported_cost: Mutex::new(0.0),
        }
    }
}

/// Validates and runs gadgets under timeouts.
#[derive(Clone)]
pub struct GadgetExecutor {
    registry: Arc<GadgetRegistry>,
    default_timeout: Duration,
}

impl std::fmt::Debug for GadgetExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GadgetExecutor")
            .field("registry", &self.registry)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl GadgetExecutor {
    /// Create an executor over a registry with a default timeout.
    #[must_use]
    pub fn new(registry: Arc<GadgetRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    /// The registry this executor dispatches into.
    #[must_use]
    pub fn registry(&self) -> &Arc<GadgetRegistry> {
        &self.registry
    }

    /// Execute one parsed call. Failures are carried on the result.
    pub async fn execute(
        &self,
        call: &ParsedGadgetCall,
        ctx: &GadgetContext,
    ) -> GadgetExecutionResult {
        let started = Instant::now();
        let mut result = GadgetExecutionResult {
            gadget_name: call.name.clone(),
            invocation_id: call.invocation_id.clone(),
            parameters: call.params.clone(),
            result: None,
            error: None,
            execution_time: Duration::ZERO,
            cost: None,
            media: Vec::new(),
            breaks_loop: false,
        };

        if ctx.cancel.is_cancelled() {
            result.error = Some("aborted".to_owned());
            return result;
        }

        let Some(gadget) = self.registry.get(&call.name) else {
            result.error = Some("gadget not found".to_owned());
            return result;
        };

        let schema = gadget.schema();
        let mut params = call.params.clone();
        coerce_parameters(&schema, &mut params);
        if let Err(e) = validate_parameters(&schema, &params) {
            result.error = Some(format!("invalid parameters: {e}"));
            result.execution_time = started.elapsed();
            return result;
        }
        result.parameters = params.clone();

        let timeout = gadget.timeout().unwrap_or(self.default_timeout);
        debug!(
            gadget = %call.name,
            invocation = %call.invocation_id,
            timeout_ms = timeout.as_millis() as u64,
            "executing gadget",
        );

        let outcome = tokio::select! {
            biased;
            outcome = gadget.execute(params, ctx) => Some(outcome),
            () = ctx.cancel.cancelled() => None,
            () = tokio::time::sleep(timeout) => {
                // Trip the gadget's token so I/O tied to it unwinds.
                ctx.cancel.cancel();
                result.error = Some(format!("timeout after {}ms", timeout.as_millis()));
                result.execution_time = started.elapsed();
                return result;
            }
        };

        match outcome {
            Some(Ok(ret)) => {
                result.result = Some(ret.result);
                result.cost = ret.cost;
                for item in ret.media {
                    result.media.push(ctx.media.store(item));
                }
            }
            Some(Err(GadgetError::BreakLoop { message })) => {
                result.breaks_loop = true;
                result.result = message;
            }
            Some(Err(GadgetError::Failed(message))) => {
                warn!(
                    gadget = %call.name,
                    invocation = %call.invocation_id,
                    error = %message,
                    "gadget failed",
                );
                result.error = Some(message);
            }
            None => {
                result.error = Some("aborted".to_owned());
            }
        }

        let reported = ctx.reported_cost();
        if reported > 0.0 {
            result.cost = Some(result.cost.unwrap_or(0.0) + reported);
        }
        result.execution_time = started.elapsed();
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::gadget::{Gadget, GadgetReturn};
    use crate::media::MediaItem;
    use crate::rate_limit::RateLimitConfig;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    fn context(tree: &ExecutionTree, node_id: NodeId) -> GadgetContext {
        GadgetContextParts {
            cancel: CancellationToken::new(),
            tree: tree.clone(),
            media: MediaStore::new(),
            outputs: OutputStore::new(),
            node_id,
            invocation_id: "t1".to_owned(),
            depth: 1,
            rate_limiter: Arc::new(RateLimitTracker::new(RateLimitConfig::default())),
            retry: RetryConfig::default(),
            transport: None,
            catalog: None,
            parent_hooks: Arc::new(HookSet::new()),
            counter: Arc::new(AtomicU64::new(0)),
            subagent_callback: None,
            emitter: None,
        }
        .build()
    }

    fn call(name: &str, params: Value) -> ParsedGadgetCall {
        ParsedGadgetCall {
            name: name.to_owned(),
            invocation_id: "t1".to_owned(),
            dependencies: Vec::new(),
            raw_params: Vec::new(),
            params,
            parse_error: None,
        }
    }

    fn fixture(gadget: Arc<dyn Gadget>) -> (GadgetExecutor, GadgetContext) {
        let mut registry = GadgetRegistry::new();
        registry.register(gadget);
        let executor = GadgetExecutor::new(Arc::new(registry), Duration::from_secs(5));
        let tree = ExecutionTree::new();
        let llm = tree.add_llm_call(0, "m", None, Vec::new());
        let node = tree.add_gadget(crate::tree::GadgetSpec {
            invocation_id: "t1".to_owned(),
            name: "any".to_owned(),
            params: json!({}),
            dependencies: Vec::new(),
            parent: llm,
        });
        let ctx = context(&tree, node);
        (executor, ctx)
    }

    struct Doubler;

    #[async_trait]
    impl Gadget for Doubler {
        fn name(&self) -> &str {
            "double"
        }
        fn description(&self) -> &str {
            "doubles n"
        }
        fn schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"n": {"type": "integer"}},
                "required": ["n"]
            })
        }
        async fn execute(
            &self,
            params: Value,
            _ctx: &GadgetContext,
        ) -> Result<GadgetReturn, GadgetError> {
            let n = params.get("n").and_then(Value::as_i64).unwrap_or(0);
            Ok(format!("{}", n * 2).into())
        }
    }

    #[tokio::test]
    async fn unknown_gadget_is_a_data_error() {
        let (executor, ctx) = fixture(Arc::new(Doubler));
        let result = executor.execute(&call("nonexistent", json!({})), &ctx).await;
        assert_eq!(result.error.as_deref(), Some("gadget not found"));
        assert!(!result.breaks_loop);
    }

    #[tokio::test]
    async fn wire_strings_are_coerced_before_validation() {
        let (executor, ctx) = fixture(Arc::new(Doubler));
        let result = executor.execute(&call("double", json!({"n": "21"})), &ctx).await;
        assert_eq!(result.result.as_deref(), Some("42"));
        assert_eq!(result.parameters, json!({"n": 21}));
    }

    #[tokio::test]
    async fn invalid_parameters_are_reported() {
        let (executor, ctx) = fixture(Arc::new(Doubler));
        let result = executor.execute(&call("double", json!({})), &ctx).await;
        assert!(result.error.as_deref().unwrap().starts_with("invalid parameters:"));
    }

    struct Sleeper;

    #[async_trait]
    impl Gadget for Sleeper {
        fn name(&self) -> &str {
            "sleep"
        }
        fn description(&self) -> &str {
            "sleeps forever"
        }
        fn schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(30))
        }
        async fn execute(
            &self,
            _params: Value,
            ctx: &GadgetContext,
        ) -> Result<GadgetReturn, GadgetError> {
            ctx.cancel.cancelled().await;
            Err(GadgetError::failed("interrupted"))
        }
    }

    #[tokio::test]
    async fn timeout_cancels_and_reports() {
        let (executor, ctx) = fixture(Arc::new(Sleeper));
        let result = executor.execute(&call("sleep", json!({})), &ctx).await;
        assert_eq!(result.error.as_deref(), Some("timeout after 30ms"));
        assert!(ctx.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn pre_tripped_abort_short_circuits() {
        let (executor, ctx) = fixture(Arc::new(Doubler));
        ctx.cancel.cancel();
        let result = executor.execute(&call("double", json!({"n": "1"})), &ctx).await;
        assert_eq!(result.error.as_deref(), Some("aborted"));
    }

    struct Breaker;

    #[async_trait]
    impl Gadget for Breaker {
        fn name(&self) -> &str {
            "finish"
        }
        fn description(&self) -> &str {
            "ends the loop"
        }
        fn schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(
            &self,
            _params: Value,
            _ctx: &GadgetContext,
        ) -> Result<GadgetReturn, GadgetError> {
            Err(GadgetError::break_loop("all done"))
        }
    }

    #[tokio::test]
    async fn break_loop_is_captured_not_an_error() {
        let (executor, ctx) = fixture(Arc::new(Breaker));
        let result = executor.execute(&call("finish", json!({})), &ctx).await;
        assert!(result.breaks_loop);
        assert_eq!(result.result.as_deref(), Some("all done"));
        assert!(result.error.is_none());
    }

    struct Spender;

    #[async_trait]
    impl Gadget for Spender {
        fn name(&self) -> &str {
            "spend"
        }
        fn description(&self) -> &str {
            "spends money"
        }
        fn schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(
            &self,
            _params: Value,
            ctx: &GadgetContext,
        ) -> Result<GadgetReturn, GadgetError> {
            ctx.report_cost(0.25);
            Ok(GadgetReturn::text("ok")
                .with_cost(0.5)
                .with_media(MediaItem {
                    kind: "image/png".to_owned(),
                    ..MediaItem::default()
                }))
        }
    }

    #[tokio::test]
    async fn costs_accumulate_and_media_is_stored() {
        let (executor, ctx) = fixture(Arc::new(Spender));
        let result = executor.execute(&call("spend", json!({})), &ctx).await;
        assert!((result.cost.unwrap() - 0.75).abs() < 1e-9);
        assert_eq!(result.media.len(), 1);
        assert!(ctx.media.get(&result.media[0].id).is_some());
    }
}
