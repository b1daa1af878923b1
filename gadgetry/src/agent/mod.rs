//! The agent loop: the outer iteration driver.
//!
//! Each iteration builds a request from the conversation, opens the
//! transport stream (with retries wrapped around the **entire** stream
//! consumption, since server errors can occur mid-stream), drives the
//! [`StreamProcessor`](crate::processor::StreamProcessor), and folds the
//! results back into the conversation. The loop ends when the model
//! answers in plain text (under the default policy), a gadget raises the
//! break-loop signal, the iteration budget runs out, or the abort signal
//! trips.
//!
//! A subagent is the same loop built from a [`SubagentSeed`]: it shares
//! the parent's tree, abort signal, and rate limiter, parents its LLM
//! calls under the spawning gadget's node, and dispatches gadget-scoped
//! parent observers.

mod builder;
mod options;

pub use builder::AgentLoopBuilder;
pub use options::{AgentOptions, TextOnlyPolicy};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::ModelCatalog;
use crate::error::{Error, Result};
use crate::events::{CompactionEvent, GadgetSkip, StreamEvent, StreamOutcome};
use crate::executor::{GadgetExecutor, SubagentCallback};
use crate::gadget::{GadgetExecutionResult, GadgetRegistry};
use crate::hooks::{HookSet, LlmErrorAction, LlmPostAction, LlmPreAction, SubagentContext};
use crate::media::MediaStore;
use crate::message::Message;
use crate::output_store::OutputStore;
use crate::parser::{GadgetCallParser, ParsedGadgetCall};
use crate::processor::{ProcessorConfig, ProcessorParts, StreamProcessor};
use crate::rate_limit::RateLimitTracker;
use crate::retry::RetryConfig;
use crate::session_log::SessionLog;
use crate::transport::{LlmRequest, LlmTransport, TransportError};
use crate::tree::{ExecutionTree, LlmCallCompletion, NodeId, TreeEvent};

/// Context compaction collaborator, invoked between iterations.
#[async_trait]
pub trait Compactor: Send + Sync {
    /// Compact `messages` in place; return details when compaction
    /// occurred.
    async fn compact(&self, messages: &mut Vec<Message>) -> Option<CompactionEvent>;
}

/// Synchronous delivery of tree bus events (the tree-to-hooks bridge).
pub type TreeEventCallback = Arc<dyn Fn(&TreeEvent) + Send + Sync>;

/// Handle for injecting user messages into a running loop.
#[derive(Debug, Clone)]
pub struct InputHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl InputHandle {
    /// Queue a message; returns `false` when the loop is gone.
    pub fn inject(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// The iteration driver. Build one with [`AgentLoopBuilder`].
pub struct AgentLoop {
    pub(crate) transport: Arc<dyn LlmTransport>,
    pub(crate) lend_transport: bool,
    pub(crate) catalog: Option<Arc<dyn ModelCatalog>>,
    pub(crate) registry: Arc<GadgetRegistry>,
    pub(crate) hooks: Arc<HookSet>,
    pub(crate) parent_hooks: Option<Arc<HookSet>>,
    pub(crate) subagent_ctx: Option<SubagentContext>,
    pub(crate) tree: ExecutionTree,
    pub(crate) cancel: CancellationToken,
    pub(crate) rate_limiter: Arc<RateLimitTracker>,
    pub(crate) retry: RetryConfig,
    pub(crate) compactor: Option<Arc<dyn Compactor>>,
    pub(crate) options: AgentOptions,
    pub(crate) conversation: Vec<Message>,
    pub(crate) injected_rx: mpsc::UnboundedReceiver<Message>,
    pub(crate) injected_tx: mpsc::UnboundedSender<Message>,
    pub(crate) counter: Arc<AtomicU64>,
    pub(crate) media: MediaStore,
    pub(crate) outputs: OutputStore,
    pub(crate) session_log: Option<SessionLog>,
    pub(crate) parent_node: Option<NodeId>,
    pub(crate) subagent_callback: Option<SubagentCallback>,
    pub(crate) tree_event_callback: Option<TreeEventCallback>,
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop")
            .field("model", &self.options.model)
            .field("max_iterations", &self.options.max_iterations)
            .field("gadgets", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl AgentLoop {
    /// Handle for injecting mid-session user messages.
    #[must_use]
    pub fn input_handle(&self) -> InputHandle {
        InputHandle {
            tx: self.injected_tx.clone(),
        }
    }

    /// The shared execution tree.
    #[must_use]
    pub fn tree(&self) -> &ExecutionTree {
        &self.tree
    }

    /// The abort signal. Cancel it to stop the loop cooperatively.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Drive the loop, yielding events from every iteration.
    ///
    /// The stream ends when the loop terminates; transport failures that
    /// outlive their retries (and are not recovered by a controller)
    /// surface as the final `Err` item.
    pub fn run(mut self) -> impl Stream<Item = Result<StreamEvent>> {
        try_stream! {
            let bridge = self.tree_event_callback.take().map(|callback| {
                let mut rx = self.tree.subscribe();
                tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(event) => callback(&event),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                })
            });

            let max_result_chars = self.options.output_limit.map(|limit| {
                let window = self
                    .catalog
                    .as_ref()
                    .and_then(|c| c.limits(&self.options.model))
                    .map_or(limit.fallback_context_window, |l| l.context_window);
                limit.max_chars(window)
            });
            let executor = Arc::new(GadgetExecutor::new(
                Arc::clone(&self.registry),
                self.options.default_gadget_timeout,
            ));

            let mut prior_completed: HashSet<String> = HashSet::new();
            let mut prior_failed: HashSet<String> = HashSet::new();
            let mut current_llm_node: Option<NodeId> = None;
            let mut loop_error: Option<Error> = None;

            info!(
                model = %self.options.model,
                max_iterations = self.options.max_iterations,
                gadgets = self.registry.len(),
                subagent = self.subagent_ctx.is_some(),
                "agent loop started",
            );

            'iterations: for iteration in 0..self.options.max_iterations {
                if self.cancel.is_cancelled() {
                    self.hooks.notify_abort().await;
                    break 'iterations;
                }

                while let Ok(message) = self.injected_rx.try_recv() {
                    self.conversation.push(message);
                }

                if let Some(compactor) = self.compactor.clone() {
                    if let Some(event) = compactor.compact(&mut self.conversation).await {
                        self.hooks.notify_compaction(&event).await;
                        yield StreamEvent::Compaction { event };
                    }
                }

                let mut request = LlmRequest {
                    model: self.options.model.clone(),
                    messages: self.conversation.clone(),
                    temperature: self.options.temperature,
                    max_tokens: self.options.max_tokens,
                    cancel: self.cancel.clone(),
                };
                let llm_node = self.tree.add_llm_call(
                    iteration,
                    &self.options.model,
                    self.parent_node,
                    self.conversation.clone(),
                );
                current_llm_node = Some(llm_node);
                self.hooks
                    .notify_llm_call_start(iteration, &self.options.model)
                    .await;

                match self.hooks.control_before_llm_call(iteration, &request).await {
                    Err(e) => {
                        loop_error = Some(e);
                        break 'iterations;
                    }
                    Ok(LlmPreAction::Proceed) => {}
                    Ok(LlmPreAction::Modify {
                        temperature,
                        max_tokens,
                    }) => {
                        if temperature.is_some() {
                            request.temperature = temperature;
                        }
                        if max_tokens.is_some() {
                            request.max_tokens = max_tokens;
                        }
                    }
                    Ok(LlmPreAction::Skip { response }) => {
                        debug!(iteration, "LLM call skipped by controller");
                        self.tree.complete_llm_call(
                            llm_node,
                            LlmCallCompletion {
                                response: Some(response.clone()),
                                ..LlmCallCompletion::default()
                            },
                        );
                        current_llm_node = None;
                        self.conversation.push(Message::assistant(response.clone()));
                        yield StreamEvent::text(response);
                        break 'iterations;
                    }
                }

                self.hooks
                    .notify_llm_call_ready(iteration, &self.options.model)
                    .await;
                self.tree.mark_llm_call_ready(llm_node);

                // Retry outer loop: wraps the whole stream consumption.
                let mut attempt: u32 = 1;
                let mut outcome: Option<StreamOutcome> = None;
                let mut recovered_response: Option<String> = None;
                let mut iteration_calls: Vec<ParsedGadgetCall> = Vec::new();
                let mut iteration_results: HashMap<String, GadgetExecutionResult> = HashMap::new();
                let mut iteration_skips: Vec<GadgetSkip> = Vec::new();

                'attempts: loop {
                    let throttle = self.rate_limiter.required_delay();
                    if throttle > Duration::ZERO {
                        self.hooks.notify_rate_limit_throttle(throttle).await;
                        debug!(delay_ms = throttle.as_millis() as u64, "rate limit throttle");
                        tokio::select! {
                            () = tokio::time::sleep(throttle) => {}
                            () = self.cancel.cancelled() => {}
                        }
                    }
                    if self.cancel.is_cancelled() {
                        self.hooks.notify_abort().await;
                        break 'iterations;
                    }

                    self.rate_limiter.record_request();
                    if let Some(log) = &self.session_log {
                        log.write_request(&request);
                    }

                    // Per-attempt accumulators reset: a failed attempt's
                    // partial results are discarded.
                    iteration_calls.clear();
                    iteration_results.clear();
                    iteration_skips.clear();
                    outcome = None;

                    let attempt_error: TransportError;
                    match self.transport.stream(request.clone()).await {
                        Ok(chunks) => {
                            let processor = StreamProcessor::new(ProcessorParts {
                                parser: GadgetCallParser::new(
                                    self.options.markers.clone(),
                                    Arc::clone(&self.counter),
                                ),
                                executor: Arc::clone(&executor),
                                tree: self.tree.clone(),
                                hooks: Arc::clone(&self.hooks),
                                parent_hooks: self.parent_hooks.clone(),
                                subagent_ctx: self.subagent_ctx.clone(),
                                cancel: self.cancel.clone(),
                                llm_node,
                                media: self.media.clone(),
                                outputs: self.outputs.clone(),
                                rate_limiter: Arc::clone(&self.rate_limiter),
                                retry: self.retry.clone(),
                                transport: self.lend_transport.then(|| Arc::clone(&self.transport)),
                                catalog: self.catalog.clone(),
                                counter: Arc::clone(&self.counter),
                                subagent_callback: self.subagent_callback.clone(),
                                prior_completed: prior_completed.clone(),
                                prior_failed: prior_failed.clone(),
                                config: ProcessorConfig {
                                    max_gadgets_per_response: self.options.max_gadgets_per_response,
                                    max_concurrent: self.options.max_concurrent_gadgets,
                                    sequential: self.options.sequential_gadgets,
                                    max_result_chars,
                                },
                            });

                            let stream = processor.process(chunks);
                            futures::pin_mut!(stream);
                            let mut stream_error: Option<Error> = None;
                            while let Some(item) = stream.next().await {
                                match item {
                                    Ok(StreamEvent::StreamComplete(o)) => {
                                        outcome = Some(o);
                                    }
                                    Ok(event) => {
                                        match &event {
                                            StreamEvent::GadgetCall { call } => {
                                                iteration_calls.push(call.clone());
                                            }
                                            StreamEvent::GadgetResult { result } => {
                                                iteration_results.insert(
                                                    result.invocation_id.clone(),
                                                    result.clone(),
                                                );
                                            }
                                            StreamEvent::GadgetSkipped(skip) => {
                                                iteration_skips.push(skip.clone());
                                            }
                                            _ => {}
                                        }
                                        yield event;
                                    }
                                    Err(e) => {
                                        stream_error = Some(e);
                                        break;
                                    }
                                }
                            }

                            match stream_error {
                                None => break 'attempts,
                                Some(Error::Transport(te)) => attempt_error = te,
                                Some(other) => {
                                    loop_error = Some(other);
                                    break 'iterations;
                                }
                            }
                        }
                        Err(te) => attempt_error = te,
                    }

                    if attempt_error.is_aborted() || self.cancel.is_cancelled() {
                        self.hooks.notify_abort().await;
                        break 'iterations;
                    }

                    if self.retry.should_retry(&attempt_error) && attempt <= self.retry.retries {
                        let delay = self.retry.delay_after(attempt, &attempt_error);
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %attempt_error,
                            "LLM call failed; retrying",
                        );
                        self.hooks
                            .notify_retry_attempt(attempt, delay, &attempt_error)
                            .await;
                        attempt += 1;
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = self.cancel.cancelled() => {}
                        }
                        continue 'attempts;
                    }

                    // Exhausted or non-retryable: last stop is the error
                    // controller.
                    match self.hooks.control_after_llm_error(iteration, &attempt_error).await {
                        Err(e) => {
                            loop_error = Some(e);
                            break 'iterations;
                        }
                        Ok(LlmErrorAction::Recover { response }) => {
                            info!(iteration, "LLM error recovered by controller");
                            recovered_response = Some(response);
                            break 'attempts;
                        }
                        Ok(LlmErrorAction::Surface) => {
                            loop_error = Some(if attempt > 1 {
                                Error::RetriesExhausted {
                                    attempts: attempt,
                                    source: attempt_error,
                                }
                            } else {
                                Error::Transport(attempt_error)
                            });
                            break 'iterations;
                        }
                    }
                }

                if let Some(response) = recovered_response {
                    // No llm_response_end here: the recovered path never
                    // produced a response stream.
                    self.tree.complete_llm_call(
                        llm_node,
                        LlmCallCompletion {
                            response: Some(response.clone()),
                            ..LlmCallCompletion::default()
                        },
                    );
                    current_llm_node = None;
                    self.conversation.push(Message::assistant(response.clone()));
                    yield StreamEvent::text(response);
                    continue 'iterations;
                }

                let Some(outcome) = outcome else {
                    break 'iterations;
                };

                if self.cancel.is_cancelled() {
                    // Abort landed while gadgets were draining: the call
                    // is recorded as interrupted and no iteration follows.
                    self.tree.interrupt_llm_call(llm_node);
                    current_llm_node = None;
                    self.hooks.notify_abort().await;
                    break 'iterations;
                }

                let cost = self.catalog.as_ref().and_then(|catalog| {
                    outcome
                        .usage
                        .as_ref()
                        .and_then(|usage| catalog.estimate_cost(&self.options.model, usage))
                        .map(|estimate| estimate.total_cost)
                });
                if let Some(usage) = &outcome.usage {
                    self.rate_limiter.record_usage(usage);
                }
                self.tree.complete_llm_call(
                    llm_node,
                    LlmCallCompletion {
                        response: Some(outcome.raw_response.clone()),
                        usage: outcome.usage,
                        finish_reason: outcome.finish_reason,
                        cost,
                    },
                );
                current_llm_node = None;
                if let Some(log) = &self.session_log {
                    log.write_response(&outcome.raw_response);
                }

                prior_completed.extend(outcome.completed_ids.iter().cloned());
                prior_failed.extend(outcome.failed_ids.iter().cloned());

                // The after-call controller runs only once the in-flight
                // drain inside the processor has finished.
                let mut final_message = outcome.final_message.clone();
                let mut append_after: Vec<Message> = Vec::new();
                match self.hooks.control_after_llm_call(iteration, &final_message).await {
                    Err(e) => {
                        loop_error = Some(e);
                        break 'iterations;
                    }
                    Ok(LlmPostAction::Continue) => {}
                    Ok(LlmPostAction::Modify { final_message: m }) => final_message = m,
                    Ok(LlmPostAction::AppendMessages { messages }) => append_after = messages,
                    Ok(LlmPostAction::AppendAndModify {
                        messages,
                        final_message: m,
                    }) => {
                        append_after = messages;
                        final_message = m;
                    }
                }

                let mut stop = false;
                if outcome.did_execute_gadgets {
                    let assistant_text = self.render_assistant_history(
                        &final_message,
                        &iteration_calls,
                    );
                    let results_text = render_gadget_results(
                        &iteration_calls,
                        &iteration_results,
                        &iteration_skips,
                    );
                    self.conversation.push(Message::assistant(assistant_text));
                    self.conversation.push(Message::user(results_text));
                } else {
                    self.conversation.push(Message::assistant(final_message));
                    match self.options.text_only_policy {
                        TextOnlyPolicy::Terminate => stop = true,
                        TextOnlyPolicy::Acknowledge => {
                            self.conversation.push(Message::user(
                                "Continue with the task. Use a gadget, or state that you are done.",
                            ));
                        }
                        TextOnlyPolicy::WaitForInput => {
                            tokio::select! {
                                message = self.injected_rx.recv() => match message {
                                    Some(message) => self.conversation.push(message),
                                    None => stop = true,
                                },
                                () = self.cancel.cancelled() => {
                                    self.hooks.notify_abort().await;
                                    stop = true;
                                }
                            }
                        }
                    }
                }
                self.conversation.extend(append_after);

                if outcome.should_break_loop {
                    info!(
                        iteration,
                        message = outcome.break_message.as_deref().unwrap_or(""),
                        "gadget requested loop break",
                    );
                    stop = true;
                }
                if stop {
                    break 'iterations;
                }
            }

            // Finally-path: whatever way the loop ended, close out any
            // in-flight LLM node and detach the tree bridge.
            if let Some(node) = current_llm_node {
                self.tree.interrupt_llm_call(node);
            }
            if let Some(handle) = bridge {
                handle.abort();
            }
            if let Some(e) = loop_error {
                Err(e)?;
            }
        }
    }

    /// Assistant message recorded in history for an iteration that ran
    /// gadgets.
    ///
    /// Verbatim by default so calls round-trip; with `fold_plain_text`,
    /// rebuilt from rendered call blocks with prose wrapped in a
    /// synthetic `note` call.
    fn render_assistant_history(
        &self,
        final_message: &str,
        calls: &[ParsedGadgetCall],
    ) -> String {
        if !self.options.fold_plain_text {
            return final_message.to_owned();
        }

        let mut out = String::new();
        let prose = strip_call_blocks(final_message, &self.options.markers);
        if !prose.trim().is_empty() {
            let note = ParsedGadgetCall {
                name: "note".to_owned(),
                invocation_id: format!(
                    "gadget-{}",
                    self.counter
                        .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                        + 1
                ),
                dependencies: Vec::new(),
                raw_params: vec![("text".to_owned(), prose.trim().to_owned())],
                params: serde_json::json!({ "text": prose.trim() }),
                parse_error: None,
            };
            out.push_str(&self.options.markers.render(&note));
        }
        for call in calls {
            out.push_str(&self.options.markers.render(call));
        }
        out
    }
}

/// Remove wire-format call blocks, leaving only the prose.
fn strip_call_blocks(text: &str, markers: &crate::parser::MarkerConfig) -> String {
    let mut out = String::new();
    let mut rest = text;
    loop {
        match rest.find(&markers.start) {
            None => {
                out.push_str(rest);
                return out;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start + markers.start.len()..];
                match after.find(&markers.end) {
                    None => return out,
                    Some(end) => rest = &after[end + markers.end.len()..],
                }
            }
        }
    }
}

/// The user message carrying serialized gadget results back to the
/// model.
fn render_gadget_results(
    calls: &[ParsedGadgetCall],
    results: &HashMap<String, GadgetExecutionResult>,
    skips: &[GadgetSkip],
) -> String {
    let mut parts = Vec::new();
    let skipped: HashMap<&str, &GadgetSkip> = skips
        .iter()
        .map(|s| (s.invocation_id.as_str(), s))
        .collect();

    for call in calls {
        if let Some(result) = results.get(&call.invocation_id) {
            if let Some(error) = &result.error {
                parts.push(format!(
                    "Error from {}:{}\n{error}",
                    result.gadget_name, result.invocation_id
                ));
            } else {
                parts.push(format!(
                    "Result of {}:{}\n{}",
                    result.gadget_name,
                    result.invocation_id,
                    result.result.as_deref().unwrap_or("")
                ));
            }
        } else if let Some(skip) = skipped.get(call.invocation_id.as_str()) {
            let detail = skip
                .error
                .clone()
                .or_else(|| {
                    skip.failed_dependency
                        .as_ref()
                        .map(|d| format!("dependency \"{d}\" failed"))
                })
                .unwrap_or_else(|| skip.reason.to_string());
            parts.push(format!(
                "Gadget {}:{} was skipped: {detail}",
                skip.gadget_name, skip.invocation_id
            ));
        }
    }

    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::MarkerConfig;
    use crate::tree::SkipReason;
    use serde_json::json;

    fn call(id: &str) -> ParsedGadgetCall {
        ParsedGadgetCall {
            name: "Sum".to_owned(),
            invocation_id: id.to_owned(),
            dependencies: Vec::new(),
            raw_params: Vec::new(),
            params: json!({}),
            parse_error: None,
        }
    }

    #[test]
    fn results_render_in_call_order() {
        let calls = vec![call("a1"), call("b1")];
        let mut results = HashMap::new();
        results.insert(
            "b1".to_owned(),
            GadgetExecutionResult {
                gadget_name: "Sum".to_owned(),
                invocation_id: "b1".to_owned(),
                parameters: json!({}),
                result: Some("3".to_owned()),
                error: None,
                execution_time: Duration::ZERO,
                cost: None,
                media: Vec::new(),
                breaks_loop: false,
            },
        );
        results.insert(
            "a1".to_owned(),
            GadgetExecutionResult {
                gadget_name: "Sum".to_owned(),
                invocation_id: "a1".to_owned(),
                parameters: json!({}),
                result: None,
                error: Some("boom".to_owned()),
                execution_time: Duration::ZERO,
                cost: None,
                media: Vec::new(),
                breaks_loop: false,
            },
        );

        let text = render_gadget_results(&calls, &results, &[]);
        let error_pos = text.find("Error from Sum:a1").expect("error entry");
        let result_pos = text.find("Result of Sum:b1").expect("result entry");
        assert!(error_pos < result_pos);
        assert!(text.contains("boom"));
    }

    #[test]
    fn skipped_calls_get_an_explanation() {
        let calls = vec![call("c1")];
        let skips = vec![GadgetSkip {
            gadget_name: "Sum".to_owned(),
            invocation_id: "c1".to_owned(),
            parameters: json!({}),
            reason: SkipReason::DependencyFailed,
            failed_dependency: Some("a1".to_owned()),
            failed_dependency_error: None,
            error: Some("dependency \"a1\" failed".to_owned()),
        }];
        let text = render_gadget_results(&calls, &HashMap::new(), &skips);
        assert!(text.contains("was skipped"));
        assert!(text.contains("a1"));
    }

    #[test]
    fn strip_call_blocks_removes_framed_sections() {
        let markers = MarkerConfig::default();
        let text = "before [[gadget]]Sum:s1\n[[arg]]a\n1\n[[/gadget]] after";
        assert_eq!(strip_call_blocks(text, &markers), "before  after");
    }
}
