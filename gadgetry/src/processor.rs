//! The per-iteration stream processor.
//!
//! [`StreamProcessor::process`] consumes one LLM chunk stream and yields
//! [`StreamEvent`]s in real time: prose as it arrives, `gadget_call` the
//! moment a call is parsed, results as gadgets finish, and a terminal
//! [`StreamEvent::StreamComplete`].
//!
//! Scheduling is dependency-aware: a call whose dependencies are still
//! running is parked; a call whose dependency failed is routed through
//! the dependency-failure controller; independent calls run as parallel
//! tasks bounded by per-gadget concurrency limits. Parallel tasks push
//! their completions and any subagent events into a single-consumer
//! queue which the generator drains between chunks and, after the stream
//! ends, in a bounded 100 ms poll loop.
//!
//! A processor instance lives for exactly one iteration (and one retry
//! attempt); the agent loop rebuilds it with fresh state on retry.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog::ModelCatalog;
use crate::error::{Error, Result};
use crate::events::{GadgetSkip, StreamEvent, StreamOutcome};
use crate::executor::{GadgetContextParts, GadgetExecutor, SubagentCallback};
use crate::gadget::GadgetExecutionResult;
use crate::hooks::{DependencyAction, GadgetPostAction, GadgetPreAction, HookSet, SubagentContext};
use crate::media::MediaStore;
use crate::output_store::{OutputStore, apply_output_limit};
use crate::parser::{GadgetCallParser, ParsedGadgetCall, ParserEvent};
use crate::rate_limit::RateLimitTracker;
use crate::retry::RetryConfig;
use crate::transport::{Chunk, ChunkStream, FinishReason, LlmTransport};
use crate::tree::{ExecutionTree, GadgetCompletion, GadgetSpec, NodeId, SkipReason};
use crate::usage::TokenUsage;

/// Wake interval of the post-stream in-flight drain loop.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Per-iteration scheduling configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Gadget lifecycles allowed per response; 0 means unlimited.
    pub max_gadgets_per_response: usize,
    /// Per-gadget concurrency ceiling; 0 means unlimited. The effective
    /// limit is the most restrictive of this and the gadget's intrinsic
    /// cap.
    pub max_concurrent: usize,
    /// Await each gadget lifecycle inline instead of spawning tasks.
    pub sequential: bool,
    /// Character budget for a single result; oversize results move to
    /// the output store.
    pub max_result_chars: Option<usize>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_gadgets_per_response: 0,
            max_concurrent: 0,
            sequential: false,
            max_result_chars: None,
        }
    }
}

/// Messages pushed by parallel gadget tasks into the processor's queue.
enum WorkerMsg {
    /// A wrapped subagent event produced inside an in-flight gadget.
    Subagent(StreamEvent),
    /// A gadget lifecycle finished.
    Done(Box<GadgetExecutionResult>),
    /// A lifecycle hit a fatal (iteration-aborting) error.
    Fatal(Error),
}

/// Shared references a gadget lifecycle needs; cheap to clone into
/// spawned tasks.
#[derive(Clone)]
struct LifecycleEnv {
    executor: Arc<GadgetExecutor>,
    tree: ExecutionTree,
    hooks: Arc<HookSet>,
    parent_hooks: Option<Arc<HookSet>>,
    subagent_ctx: Option<SubagentContext>,
    media: MediaStore,
    outputs: OutputStore,
    rate_limiter: Arc<RateLimitTracker>,
    retry: RetryConfig,
    transport: Option<Arc<dyn LlmTransport>>,
    catalog: Option<Arc<dyn ModelCatalog>>,
    counter: Arc<AtomicU64>,
    subagent_callback: Option<SubagentCallback>,
    cancel: CancellationToken,
    worker_tx: mpsc::UnboundedSender<WorkerMsg>,
    max_result_chars: Option<usize>,
}

/// Construction parameters for a [`StreamProcessor`].
pub struct ProcessorParts {
    /// Fresh parser for this iteration.
    pub parser: GadgetCallParser,
    /// Gadget executor.
    pub executor: Arc<GadgetExecutor>,
    /// Shared execution tree.
    pub tree: ExecutionTree,
    /// This agent's hooks.
    pub hooks: Arc<HookSet>,
    /// Enclosing agent's hooks when this processor runs a subagent.
    pub parent_hooks: Option<Arc<HookSet>>,
    /// Identity carried by gadget-scoped hook dispatch; `None` at the
    /// root.
    pub subagent_ctx: Option<SubagentContext>,
    /// Abort signal.
    pub cancel: CancellationToken,
    /// The LLM-call node owning this iteration's gadget nodes.
    pub llm_node: NodeId,
    /// Shared media store.
    pub media: MediaStore,
    /// Shared oversize-output store.
    pub outputs: OutputStore,
    /// Shared rate-limit tracker.
    pub rate_limiter: Arc<RateLimitTracker>,
    /// Retry policy, lent to subagents.
    pub retry: RetryConfig,
    /// Transport handle lent to subagent-spawning gadgets.
    pub transport: Option<Arc<dyn LlmTransport>>,
    /// Model catalog handle.
    pub catalog: Option<Arc<dyn ModelCatalog>>,
    /// Shared invocation-id counter.
    pub counter: Arc<AtomicU64>,
    /// Synchronous subagent-event delivery for UIs.
    pub subagent_callback: Option<SubagentCallback>,
    /// Invocation ids completed in prior iterations.
    pub prior_completed: HashSet<String>,
    /// Invocation ids failed or skipped in prior iterations.
    pub prior_failed: HashSet<String>,
    /// Scheduling configuration.
    pub config: ProcessorConfig,
}

impl std::fmt::Debug for ProcessorParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorParts")
            .field("llm_node", &self.llm_node)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Single-iteration stream engine. See the module docs.
pub struct StreamProcessor {
    parser: GadgetCallParser,
    env: LifecycleEnv,
    config: ProcessorConfig,
    llm_node: NodeId,

    awaiting: Vec<ParsedGadgetCall>,
    ready_queue: VecDeque<ParsedGadgetCall>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    results: HashMap<String, GadgetExecutionResult>,
    node_ids: HashMap<String, NodeId>,
    prior_completed: HashSet<String>,
    prior_failed: HashSet<String>,

    in_flight: usize,
    active_by_gadget: HashMap<String, usize>,
    concurrency_queue: HashMap<String, VecDeque<ParsedGadgetCall>>,
    worker_rx: mpsc::UnboundedReceiver<WorkerMsg>,

    calls_seen: usize,
    started_count: usize,
    early_terminate: bool,
    should_break_loop: bool,
    break_message: Option<String>,

    raw_response: String,
    finish_reason: Option<FinishReason>,
    usage: Option<TokenUsage>,
    response_started: bool,
}

impl std::fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("llm_node", &self.llm_node)
            .field("calls_seen", &self.calls_seen)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl StreamProcessor {
    /// Assemble a processor for one iteration.
    #[must_use]
    pub fn new(parts: ProcessorParts) -> Self {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let env = LifecycleEnv {
            executor: parts.executor,
            tree: parts.tree,
            hooks: parts.hooks,
            parent_hooks: parts.parent_hooks,
            subagent_ctx: parts.subagent_ctx,
            media: parts.media,
            outputs: parts.outputs,
            rate_limiter: parts.rate_limiter,
            retry: parts.retry,
            transport: parts.transport,
            catalog: parts.catalog,
            counter: parts.counter,
            subagent_callback: parts.subagent_callback,
            cancel: parts.cancel,
            worker_tx,
            max_result_chars: parts.config.max_result_chars,
        };
        Self {
            parser: parts.parser,
            env,
            config: parts.config,
            llm_node: parts.llm_node,
            awaiting: Vec::new(),
            ready_queue: VecDeque::new(),
            completed: HashSet::new(),
            failed: HashSet::new(),
            results: HashMap::new(),
            node_ids: HashMap::new(),
            prior_completed: parts.prior_completed,
            prior_failed: parts.prior_failed,
            in_flight: 0,
            active_by_gadget: HashMap::new(),
            concurrency_queue: HashMap::new(),
            worker_rx,
            calls_seen: 0,
            started_count: 0,
            early_terminate: false,
            should_break_loop: false,
            break_message: None,
            raw_response: String::new(),
            finish_reason: None,
            usage: None,
            response_started: false,
        }
    }

    /// Consume the chunk stream, yielding events in real time and
    /// terminating with [`StreamEvent::StreamComplete`].
    pub fn process(mut self, chunks: ChunkStream) -> impl Stream<Item = Result<StreamEvent>> {
        try_stream! {
            let mut chunks = chunks;

            while !self.early_terminate && !self.env.cancel.is_cancelled() {
                let Some(chunk) = chunks.next().await else {
                    break;
                };
                let chunk = chunk?;
                for event in self.handle_chunk(chunk).await? {
                    yield event;
                }
            }

            if self.response_started {
                self.env
                    .tree
                    .end_llm_response(self.llm_node, self.finish_reason, self.usage);
            }
            yield StreamEvent::LlmResponseEnd {
                finish_reason: self.finish_reason,
                usage: self.usage,
            };

            // Flush the parser; suppressed after an abort so no further
            // text or gadget_call events escape.
            if !self.env.cancel.is_cancelled() {
                let tail = self.parser.finalize();
                for event in self.handle_parser_events(tail).await? {
                    yield event;
                }
                for event in self.pump().await? {
                    yield event;
                }
            }

            // Drain in-flight tasks, interleaving queued subagent events
            // and completions as they land.
            while self.has_outstanding() {
                let msg = tokio::select! {
                    msg = self.worker_rx.recv() => msg,
                    () = tokio::time::sleep(DRAIN_POLL) => None,
                };
                if let Some(msg) = msg {
                    for event in self.handle_worker_msg(msg).await? {
                        yield event;
                    }
                }
                for event in self.pump().await? {
                    yield event;
                }
            }

            // Whatever still awaits dependencies is unresolvable.
            for event in self.classify_stragglers().await? {
                yield event;
            }

            let final_message = self
                .env
                .hooks
                .intercept_assistant_message(self.raw_response.clone());
            yield StreamEvent::StreamComplete(StreamOutcome {
                finish_reason: self.finish_reason,
                usage: self.usage,
                raw_response: std::mem::take(&mut self.raw_response),
                final_message,
                did_execute_gadgets: self.calls_seen > 0,
                should_break_loop: self.should_break_loop,
                break_message: self.break_message.take(),
                completed_ids: self.completed.iter().cloned().collect(),
                failed_ids: self.failed.iter().cloned().collect(),
            });
        }
    }

    // -- Chunk handling ----------------------------------------------------

    async fn handle_chunk(&mut self, chunk: Chunk) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();

        if chunk.finish_reason.is_some() {
            self.finish_reason = chunk.finish_reason;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        if !self.response_started {
            self.response_started = true;
            self.env.tree.start_llm_response(self.llm_node);
        }

        // Thinking content bypasses interception.
        if let Some(thinking) = &chunk.thinking {
            events.push(StreamEvent::Thinking {
                content: thinking.content.clone(),
                thinking_type: thinking.thinking_type.clone(),
            });
        }

        let Some(chunk) = self.env.hooks.intercept_raw_chunk(chunk) else {
            return Ok(events);
        };

        if let Some(text) = &chunk.text {
            self.raw_response.push_str(text);
        }
        self.env
            .hooks
            .notify_stream_chunk(&chunk, self.env.subagent_ctx.as_ref())
            .await;

        if let Some(text) = chunk.text {
            let parsed = self.parser.feed(&text);
            events.extend(self.handle_parser_events(parsed).await?);
        }

        events.extend(self.pump().await?);
        Ok(events)
    }

    async fn handle_parser_events(
        &mut self,
        parsed: Vec<ParserEvent>,
    ) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();
        for event in parsed {
            match event {
                ParserEvent::Text(text) => {
                    if let Some(text) = self.env.hooks.intercept_text_chunk(text) {
                        events.push(StreamEvent::Text { content: text });
                    }
                }
                ParserEvent::Call(call) => {
                    events.extend(self.handle_call(call).await?);
                    // Keep scheduling (and, in sequential mode, full
                    // lifecycles) interleaved with parsing order.
                    events.extend(self.pump().await?);
                }
            }
        }
        Ok(events)
    }

    /// Admission checks and scheduling for one freshly parsed call.
    async fn handle_call(&mut self, call: ParsedGadgetCall) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();
        self.calls_seen += 1;

        // Cap already tripped: the stream is terminating, drop silently.
        if self.early_terminate {
            return Ok(events);
        }

        events.push(StreamEvent::GadgetCall { call: call.clone() });

        if self
            .env
            .tree
            .get_node_by_invocation_id(&call.invocation_id)
            .is_some()
        {
            // Re-issued ids happen when the model repeats itself or a
            // retried stream replays calls whose nodes survived the
            // failed attempt. Skipping (rather than panicking on the
            // tree's uniqueness invariant) keeps model input from
            // crashing the iteration.
            warn!(invocation = %call.invocation_id, "duplicate invocation id from model");
            events.extend(
                self.skip_call(
                    &call,
                    None,
                    SkipReason::DuplicateInvocation,
                    None,
                    None,
                    Some(format!(
                        "duplicate invocation id \"{}\"",
                        call.invocation_id
                    )),
                )
                .await,
            );
            return Ok(events);
        }

        let node = self.env.tree.add_gadget(GadgetSpec {
            invocation_id: call.invocation_id.clone(),
            name: call.name.clone(),
            params: call.params.clone(),
            dependencies: call.dependencies.clone(),
            parent: self.llm_node,
        });
        self.node_ids.insert(call.invocation_id.clone(), node);

        if call.dependencies.contains(&call.invocation_id) {
            events.extend(
                self.skip_call(
                    &call,
                    Some(node),
                    SkipReason::SelfReference,
                    Some(call.invocation_id.clone()),
                    None,
                    Some("self-referential dependency".to_owned()),
                )
                .await,
            );
            return Ok(events);
        }

        if let Some(dep) = call
            .dependencies
            .iter()
            .find(|d| self.is_failed(d))
            .cloned()
        {
            events.extend(self.handle_failed_dependency(call, node, dep).await?);
            return Ok(events);
        }

        if call.dependencies.iter().any(|d| !self.is_completed(d)) {
            debug!(
                invocation = %call.invocation_id,
                deps = ?call.dependencies,
                "deferring gadget until dependencies complete",
            );
            self.awaiting.push(call);
            return Ok(events);
        }

        events.extend(self.gate_and_enqueue(call).await);
        Ok(events)
    }

    /// Route a call whose listed dependency failed through the
    /// dependency-failure controller.
    async fn handle_failed_dependency(
        &mut self,
        call: ParsedGadgetCall,
        node: NodeId,
        dep: String,
    ) -> Result<Vec<StreamEvent>> {
        let dep_error = self.results.get(&dep).and_then(|r| r.error.clone());
        let action = self
            .env
            .hooks
            .control_dependency_failure(
                &call,
                &dep,
                dep_error.as_deref(),
                self.env.subagent_ctx.as_ref(),
            )
            .await?;

        let mut events = Vec::new();
        match action {
            DependencyAction::Skip => {
                events.extend(
                    self.skip_call(
                        &call,
                        Some(node),
                        SkipReason::DependencyFailed,
                        Some(dep.clone()),
                        dep_error,
                        Some(format!("dependency \"{dep}\" failed")),
                    )
                    .await,
                );
            }
            DependencyAction::ExecuteAnyway => {
                events.extend(self.gate_and_enqueue(call).await);
            }
            DependencyAction::UseFallback { result } => {
                let synthetic = GadgetExecutionResult {
                    gadget_name: call.name.clone(),
                    invocation_id: call.invocation_id.clone(),
                    parameters: call.params.clone(),
                    result: Some(result),
                    error: None,
                    execution_time: Duration::ZERO,
                    cost: None,
                    media: Vec::new(),
                    breaks_loop: false,
                };
                self.env.tree.complete_gadget(
                    node,
                    GadgetCompletion {
                        result: synthetic.result.clone(),
                        execution_time: Duration::ZERO,
                        ..GadgetCompletion::default()
                    },
                );
                events.extend(self.record_completion(synthetic, false));
            }
        }
        Ok(events)
    }

    /// Per-response cap, then per-gadget concurrency admission.
    async fn gate_and_enqueue(&mut self, call: ParsedGadgetCall) -> Vec<StreamEvent> {
        let cap = self.config.max_gadgets_per_response;
        if cap > 0 && self.started_count >= cap {
            warn!(
                invocation = %call.invocation_id,
                cap,
                "per-response gadget limit exceeded; terminating stream early",
            );
            self.early_terminate = true;
            let node = self.node_ids.get(&call.invocation_id).copied();
            return self
                .skip_call(
                    &call,
                    node,
                    SkipReason::LimitExceeded,
                    None,
                    None,
                    Some(format!("gadget limit of {cap} per response exceeded")),
                )
                .await;
        }
        self.started_count += 1;

        let limit = self.effective_limit(&call.name);
        let active = self
            .active_by_gadget
            .entry(call.name.clone())
            .or_insert(0);
        if limit > 0 && *active >= limit {
            debug!(
                gadget = %call.name,
                invocation = %call.invocation_id,
                limit,
                "concurrency limit reached; queueing",
            );
            self.concurrency_queue
                .entry(call.name.clone())
                .or_default()
                .push_back(call);
            return Vec::new();
        }
        *active += 1;
        self.ready_queue.push_back(call);
        Vec::new()
    }

    /// The most restrictive of the configured and intrinsic limits;
    /// 0 means unlimited.
    fn effective_limit(&self, name: &str) -> usize {
        let intrinsic = self
            .env
            .executor
            .registry()
            .get(name)
            .and_then(|g| g.max_concurrent())
            .unwrap_or(0);
        match (self.config.max_concurrent, intrinsic) {
            (0, i) => i,
            (c, 0) => c,
            (c, i) => c.min(i),
        }
    }

    // -- Dispatch & completion ---------------------------------------------

    /// Drive scheduling until quiescent: dispatch ready calls, absorb
    /// worker messages, and resolve newly satisfied dependencies.
    async fn pump(&mut self) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();
        loop {
            let mut progressed = false;

            while let Some(call) = self.ready_queue.pop_front() {
                progressed = true;
                events.extend(self.dispatch_execution(call).await?);
            }

            while let Ok(msg) = self.worker_rx.try_recv() {
                progressed = true;
                events.extend(self.handle_worker_msg(msg).await?);
            }

            progressed |= self.resolve_pending_pass(&mut events).await?;

            if !progressed {
                break;
            }
        }
        Ok(events)
    }

    async fn dispatch_execution(&mut self, call: ParsedGadgetCall) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();
        let node = self.node_ids[&call.invocation_id];

        if self.config.sequential {
            let result = run_gadget_lifecycle(self.env.clone(), call, node).await?;
            // Subagent events produced inline land in the worker queue;
            // surface them before the result.
            while let Ok(msg) = self.worker_rx.try_recv() {
                events.extend(self.handle_worker_msg(msg).await?);
            }
            events.extend(self.record_completion(result, true));
        } else {
            let env = self.env.clone();
            let tx = env.worker_tx.clone();
            self.in_flight += 1;
            tokio::spawn(async move {
                match run_gadget_lifecycle(env, call, node).await {
                    Ok(result) => {
                        let _ = tx.send(WorkerMsg::Done(Box::new(result)));
                    }
                    Err(e) => {
                        let _ = tx.send(WorkerMsg::Fatal(e));
                    }
                }
            });
        }
        Ok(events)
    }

    async fn handle_worker_msg(&mut self, msg: WorkerMsg) -> Result<Vec<StreamEvent>> {
        match msg {
            WorkerMsg::Subagent(event) => Ok(vec![event]),
            WorkerMsg::Done(result) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                Ok(self.record_completion(*result, true))
            }
            WorkerMsg::Fatal(e) => Err(e),
        }
    }

    /// Record a finished gadget: bookkeeping, concurrency promotion, and
    /// the `gadget_result` event.
    fn record_completion(
        &mut self,
        result: GadgetExecutionResult,
        was_active: bool,
    ) -> Vec<StreamEvent> {
        let invocation_id = result.invocation_id.clone();
        let name = result.gadget_name.clone();

        if was_active {
            let active = self.active_by_gadget.entry(name.clone()).or_insert(0);
            *active = active.saturating_sub(1);
            if let Some(next) = self
                .concurrency_queue
                .get_mut(&name)
                .and_then(VecDeque::pop_front)
            {
                *self.active_by_gadget.entry(name).or_insert(0) += 1;
                self.ready_queue.push_back(next);
            }
        }

        if result.error.is_some() {
            self.failed.insert(invocation_id.clone());
        } else {
            self.completed.insert(invocation_id.clone());
        }
        if result.breaks_loop {
            self.should_break_loop = true;
            self.break_message = result.result.clone();
        }
        self.results.insert(invocation_id, result.clone());

        vec![StreamEvent::GadgetResult { result }]
    }

    /// One dependency-resolution pass over parked calls; returns whether
    /// anything moved.
    async fn resolve_pending_pass(&mut self, events: &mut Vec<StreamEvent>) -> Result<bool> {
        if self.awaiting.is_empty() {
            return Ok(false);
        }
        let mut progressed = false;
        let mut remaining = Vec::new();

        for call in std::mem::take(&mut self.awaiting) {
            if let Some(dep) = call
                .dependencies
                .iter()
                .find(|d| self.is_failed(d))
                .cloned()
            {
                let node = self.node_ids[&call.invocation_id];
                events.extend(self.handle_failed_dependency(call, node, dep).await?);
                progressed = true;
            } else if call.dependencies.iter().all(|d| self.is_completed(d)) {
                events.extend(self.gate_and_enqueue(call).await);
                progressed = true;
            } else {
                remaining.push(call);
            }
        }

        self.awaiting = remaining;
        Ok(progressed)
    }

    /// Classify calls still awaiting dependencies at stream end as
    /// circular, missing, or both, and skip them.
    async fn classify_stragglers(&mut self) -> Result<Vec<StreamEvent>> {
        if self.awaiting.is_empty() {
            return Ok(Vec::new());
        }

        let pending: HashMap<String, Vec<String>> = self
            .awaiting
            .iter()
            .map(|c| (c.invocation_id.clone(), c.dependencies.clone()))
            .collect();

        // Missing sets are computed against the state before any of the
        // stragglers is skipped, so members of one cycle classify alike.
        let stragglers: Vec<(ParsedGadgetCall, Vec<String>)> = std::mem::take(&mut self.awaiting)
            .into_iter()
            .map(|call| {
                let missing: Vec<String> = call
                    .dependencies
                    .iter()
                    .filter(|d| !self.is_completed(d) && !self.is_failed(d))
                    .cloned()
                    .collect();
                (call, missing)
            })
            .collect();

        let mut events = Vec::new();
        for (call, missing) in stragglers {
            let mut parts = Vec::new();
            let mut first_missing = None;
            for dep in &missing {
                first_missing.get_or_insert_with(|| dep.clone());
                if let Some(dep_deps) = pending.get(dep) {
                    if dep_deps.contains(&call.invocation_id) {
                        parts.push(format!(
                            "circular dependency: \"{}\" depends on \"{dep}\" which also depends on \"{}\"",
                            call.invocation_id, call.invocation_id
                        ));
                    } else {
                        parts.push(format!(
                            "circular dependency: \"{}\" depends on \"{dep}\" which is also pending",
                            call.invocation_id
                        ));
                    }
                } else {
                    parts.push(format!("dependency \"{dep}\" was never executed"));
                }
            }

            let node = self.node_ids.get(&call.invocation_id).copied();
            events.extend(
                self.skip_call(
                    &call,
                    node,
                    SkipReason::UnresolvedDependency,
                    first_missing,
                    None,
                    Some(parts.join("; ")),
                )
                .await,
            );
        }
        Ok(events)
    }

    /// Mark a call failed-by-skip, update the tree, and notify
    /// observers (own, then parent).
    async fn skip_call(
        &mut self,
        call: &ParsedGadgetCall,
        node: Option<NodeId>,
        reason: SkipReason,
        failed_dependency: Option<String>,
        failed_dependency_error: Option<String>,
        error: Option<String>,
    ) -> Vec<StreamEvent> {
        self.failed.insert(call.invocation_id.clone());
        if let Some(node) = node {
            self.env
                .tree
                .skip_gadget(node, failed_dependency.clone(), error.clone(), reason);
        }

        let skip = GadgetSkip {
            gadget_name: call.name.clone(),
            invocation_id: call.invocation_id.clone(),
            parameters: call.params.clone(),
            reason,
            failed_dependency,
            failed_dependency_error,
            error,
        };
        let ctx = self.env.subagent_ctx.as_ref();
        self.env.hooks.notify_gadget_skipped(&skip, ctx).await;
        if let Some(parent) = &self.env.parent_hooks {
            parent.notify_gadget_skipped(&skip, ctx).await;
        }

        vec![StreamEvent::GadgetSkipped(skip)]
    }

    fn is_completed(&self, invocation_id: &str) -> bool {
        self.completed.contains(invocation_id) || self.prior_completed.contains(invocation_id)
    }

    fn is_failed(&self, invocation_id: &str) -> bool {
        self.failed.contains(invocation_id) || self.prior_failed.contains(invocation_id)
    }

    fn has_outstanding(&self) -> bool {
        self.in_flight > 0
            || !self.ready_queue.is_empty()
            || self.active_by_gadget.values().any(|&a| a > 0)
            || self.concurrency_queue.values().any(|q| !q.is_empty())
    }
}

/// The single-gadget lifecycle (interception, controllers, execution,
/// tree updates, observers), shared by the inline and spawned paths.
async fn run_gadget_lifecycle(
    env: LifecycleEnv,
    mut call: ParsedGadgetCall,
    node: NodeId,
) -> Result<GadgetExecutionResult> {
    if let Some(parse_error) = &call.parse_error {
        debug!(
            gadget = %call.name,
            invocation = %call.invocation_id,
            error = %parse_error,
            "executing gadget call that had parse errors",
        );
    }
    let sub_ctx = env.subagent_ctx.as_ref();

    // Parameter interception, mirrored into the tree.
    let params = env
        .hooks
        .intercept_gadget_parameters(&call.name, call.params.clone(), sub_ctx);
    if params != call.params {
        env.tree
            .update_gadget_parameters(&call.invocation_id, params.clone());
        call.params = params;
    }

    let pre = env.hooks.control_before_gadget(&call, sub_ctx).await?;

    env.tree.start_gadget(node);
    env.hooks.notify_gadget_start(&call, sub_ctx).await;
    if let Some(parent) = &env.parent_hooks {
        parent.notify_gadget_start(&call, sub_ctx).await;
    }

    let mut result = match pre {
        GadgetPreAction::Skip { result } => GadgetExecutionResult {
            gadget_name: call.name.clone(),
            invocation_id: call.invocation_id.clone(),
            parameters: call.params.clone(),
            result: Some(result),
            error: None,
            execution_time: Duration::ZERO,
            cost: None,
            media: Vec::new(),
            breaks_loop: false,
        },
        GadgetPreAction::Proceed => {
            let depth = env.tree.get_node(node).map_or(1, |n| n.depth);
            let tx = env.worker_tx.clone();
            let emitter: crate::executor::SubagentEmitter = Arc::new(move |event: StreamEvent| {
                let _ = tx.send(WorkerMsg::Subagent(event));
            });
            let ctx = GadgetContextParts {
                cancel: env.cancel.child_token(),
                tree: env.tree.clone(),
                media: env.media.clone(),
                outputs: env.outputs.clone(),
                node_id: node,
                invocation_id: call.invocation_id.clone(),
                depth,
                rate_limiter: Arc::clone(&env.rate_limiter),
                retry: env.retry.clone(),
                transport: env.transport.clone(),
                catalog: env.catalog.clone(),
                parent_hooks: Arc::clone(&env.hooks),
                counter: Arc::clone(&env.counter),
                subagent_callback: env.subagent_callback.clone(),
                emitter: Some(emitter),
            }
            .build();
            env.executor.execute(&call, &ctx).await
        }
    };

    // Output limiting composes before user result interceptors.
    if let Some(max) = env.max_result_chars
        && let Some(text) = result.result.take()
    {
        result.result = Some(apply_output_limit(&env.outputs, &call.name, text, max));
    }
    if let Some(text) = result.result.take() {
        result.result = Some(env.hooks.intercept_gadget_result(&call.name, text, sub_ctx));
    }

    if let GadgetPostAction::Recover { result: fallback } =
        env.hooks.control_after_gadget(&result, sub_ctx).await?
    {
        result.error = None;
        result.result = Some(fallback);
    }

    env.tree.complete_gadget(
        node,
        GadgetCompletion {
            result: result.result.clone(),
            error: result.error.clone(),
            execution_time: result.execution_time,
            cost: result.cost,
            media: result.media.clone(),
        },
    );
    env.hooks.notify_gadget_complete(&result, sub_ctx).await;
    if let Some(parent) = &env.parent_hooks {
        parent.notify_gadget_complete(&result, sub_ctx).await;
    }

    Ok(result)
}
