//! The hook pipeline: observers, interceptors, and controllers.
//!
//! Three kinds of extension points, dispatched by [`HookSet`]:
//!
//! - **Interceptors** are synchronous pure transforms composed in
//!   registration order; returning `None` from a droppable point drops
//!   the value.
//! - **Observers** are awaited but isolated: within one stage all
//!   observers run concurrently, and an observer error is counted and
//!   logged, never fatal.
//! - **Controllers** return explicit action values. Controllers are
//!   consulted in registration order and the first decisive (non-default)
//!   action wins. A controller returning `Err` is a programmer error
//!   that aborts the iteration.
//!
//! Gadget-scoped dispatch carries an optional [`SubagentContext`]
//! identifying the spawning gadget and depth when the current agent is a
//! subagent; root-agent hooks receive `None`.

mod controller;
mod interceptor;
mod observer;

pub use controller::{
    Controller, DependencyAction, GadgetPostAction, GadgetPreAction, LlmErrorAction, LlmPostAction,
    LlmPreAction,
};
pub use interceptor::Interceptor;
pub use observer::Observer;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tracing::warn;

use crate::error::Error;
use crate::events::{CompactionEvent, GadgetSkip};
use crate::gadget::GadgetExecutionResult;
use crate::parser::ParsedGadgetCall;
use crate::transport::{Chunk, LlmRequest, TransportError};

/// Result type observers return; errors are isolated by the dispatcher.
pub type HookResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Result type controllers return; errors abort the iteration.
pub type ControlResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Identifies the subagent a gadget-scoped hook fires inside of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubagentContext {
    /// Invocation id of the gadget that spawned the subagent.
    pub parent_invocation_id: String,
    /// Depth of the subagent's LLM calls in the execution tree.
    pub depth: usize,
}

/// An ordered set of hooks with dispatch helpers.
#[derive(Default)]
pub struct HookSet {
    observers: Vec<Arc<dyn Observer>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    controllers: Vec<Arc<dyn Controller>>,
    observer_failures: AtomicUsize,
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet")
            .field("observers", &self.observers.len())
            .field("interceptors", &self.interceptors.len())
            .field("controllers", &self.controllers.len())
            .field("observer_failures", &self.observer_failure_count())
            .finish()
    }
}

impl HookSet {
    /// Create an empty hook set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Register an interceptor.
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Register a controller.
    #[must_use]
    pub fn with_controller(mut self, controller: Arc<dyn Controller>) -> Self {
        self.controllers.push(controller);
        self
    }

    /// Observer errors isolated so far.
    #[must_use]
    pub fn observer_failure_count(&self) -> usize {
        self.observer_failures.load(Ordering::Relaxed)
    }

    fn settle(&self, stage: &'static str, results: Vec<HookResult>) {
        for result in results {
            if let Err(e) = result {
                self.observer_failures.fetch_add(1, Ordering::Relaxed);
                warn!(stage, error = %e, "observer failed; isolated");
            }
        }
    }

    // -- Interceptors ------------------------------------------------------

    /// Transform (or drop) a raw chunk.
    #[must_use]
    pub fn intercept_raw_chunk(&self, chunk: Chunk) -> Option<Chunk> {
        self.interceptors
            .iter()
            .try_fold(chunk, |chunk, i| i.raw_chunk(chunk))
    }

    /// Transform (or drop) a text fragment.
    #[must_use]
    pub fn intercept_text_chunk(&self, text: String) -> Option<String> {
        self.interceptors
            .iter()
            .try_fold(text, |text, i| i.text_chunk(text))
    }

    /// Transform gadget parameters before execution.
    #[must_use]
    pub fn intercept_gadget_parameters(
        &self,
        gadget_name: &str,
        params: Value,
        ctx: Option<&SubagentContext>,
    ) -> Value {
        self.interceptors
            .iter()
            .fold(params, |params, i| i.gadget_parameters(gadget_name, params, ctx))
    }

    /// Transform a gadget result string.
    #[must_use]
    pub fn intercept_gadget_result(
        &self,
        gadget_name: &str,
        result: String,
        ctx: Option<&SubagentContext>,
    ) -> String {
        self.interceptors
            .iter()
            .fold(result, |result, i| i.gadget_result(gadget_name, result, ctx))
    }

    /// Transform the accumulated assistant message at end of stream.
    #[must_use]
    pub fn intercept_assistant_message(&self, message: String) -> String {
        self.interceptors
            .iter()
            .fold(message, |message, i| i.assistant_message(message))
    }

    // -- Observers ---------------------------------------------------------

    /// Dispatch `on_stream_chunk` to all observers concurrently.
    pub async fn notify_stream_chunk(&self, chunk: &Chunk, ctx: Option<&SubagentContext>) {
        let results = join_all(self.observers.iter().map(|o| o.on_stream_chunk(chunk, ctx))).await;
        self.settle("on_stream_chunk", results);
    }

    /// Dispatch `on_gadget_execution_start`.
    pub async fn notify_gadget_start(
        &self,
        call: &ParsedGadgetCall,
        ctx: Option<&SubagentContext>,
    ) {
        let results = join_all(
            self.observers
                .iter()
                .map(|o| o.on_gadget_execution_start(call, ctx)),
        )
        .await;
        self.settle("on_gadget_execution_start", results);
    }

    /// Dispatch `on_gadget_execution_complete`.
    pub async fn notify_gadget_complete(
        &self,
        result: &GadgetExecutionResult,
        ctx: Option<&SubagentContext>,
    ) {
        let results = join_all(
            self.observers
                .iter()
                .map(|o| o.on_gadget_execution_complete(result, ctx)),
        )
        .await;
        self.settle("on_gadget_execution_complete", results);
    }

    /// Dispatch `on_gadget_skipped`.
    pub async fn notify_gadget_skipped(&self, skip: &GadgetSkip, ctx: Option<&SubagentContext>) {
        let results = join_all(
            self.observers
                .iter()
                .map(|o| o.on_gadget_skipped(skip, ctx)),
        )
        .await;
        self.settle("on_gadget_skipped", results);
    }

    /// Dispatch `on_llm_call_start`.
    pub async fn notify_llm_call_start(&self, iteration: usize, model: &str) {
        let results = join_all(
            self.observers
                .iter()
                .map(|o| o.on_llm_call_start(iteration, model)),
        )
        .await;
        self.settle("on_llm_call_start", results);
    }

    /// Dispatch `on_llm_call_ready`.
    pub async fn notify_llm_call_ready(&self, iteration: usize, model: &str) {
        let results = join_all(
            self.observers
                .iter()
                .map(|o| o.on_llm_call_ready(iteration, model)),
        )
        .await;
        self.settle("on_llm_call_ready", results);
    }

    /// Dispatch `on_retry_attempt`.
    pub async fn notify_retry_attempt(
        &self,
        attempt: u32,
        delay: Duration,
        error: &TransportError,
    ) {
        let results = join_all(
            self.observers
                .iter()
                .map(|o| o.on_retry_attempt(attempt, delay, error)),
        )
        .await;
        self.settle("on_retry_attempt", results);
    }

    /// Dispatch `on_rate_limit_throttle`.
    pub async fn notify_rate_limit_throttle(&self, delay: Duration) {
        let results = join_all(
            self.observers
                .iter()
                .map(|o| o.on_rate_limit_throttle(delay)),
        )
        .await;
        self.settle("on_rate_limit_throttle", results);
    }

    /// Dispatch `on_abort`.
    pub async fn notify_abort(&self) {
        let results = join_all(self.observers.iter().map(|o| o.on_abort())).await;
        self.settle("on_abort", results);
    }

    /// Dispatch `on_compaction`.
    pub async fn notify_compaction(&self, event: &CompactionEvent) {
        let results = join_all(self.observers.iter().map(|o| o.on_compaction(event))).await;
        self.settle("on_compaction", results);
    }

    // -- Controllers -------------------------------------------------------

    /// Consult controllers before a gadget executes.
    pub async fn control_before_gadget(
        &self,
        call: &ParsedGadgetCall,
        ctx: Option<&SubagentContext>,
    ) -> Result<GadgetPreAction, Error> {
        for controller in &self.controllers {
            let action = controller
                .before_gadget_execution(call, ctx)
                .await
                .map_err(|e| Error::hook_contract("before_gadget_execution", e))?;
            if !matches!(action, GadgetPreAction::Proceed) {
                return Ok(action);
            }
        }
        Ok(GadgetPreAction::Proceed)
    }

    /// Consult controllers after a gadget executed.
    pub async fn control_after_gadget(
        &self,
        result: &GadgetExecutionResult,
        ctx: Option<&SubagentContext>,
    ) -> Result<GadgetPostAction, Error> {
        for controller in &self.controllers {
            let action = controller
                .after_gadget_execution(result, ctx)
                .await
                .map_err(|e| Error::hook_contract("after_gadget_execution", e))?;
            if !matches!(action, GadgetPostAction::Keep) {
                return Ok(action);
            }
        }
        Ok(GadgetPostAction::Keep)
    }

    /// Consult controllers about a call whose dependency failed.
    pub async fn control_dependency_failure(
        &self,
        call: &ParsedGadgetCall,
        failed_dependency: &str,
        dependency_error: Option<&str>,
        ctx: Option<&SubagentContext>,
    ) -> Result<DependencyAction, Error> {
        for controller in &self.controllers {
            let action = controller
                .on_dependency_failure(call, failed_dependency, dependency_error, ctx)
                .await
                .map_err(|e| Error::hook_contract("on_dependency_failure", e))?;
            if !matches!(action, DependencyAction::Skip) {
                return Ok(action);
            }
        }
        Ok(DependencyAction::Skip)
    }

    /// Consult controllers before an LLM call.
    pub async fn control_before_llm_call(
        &self,
        iteration: usize,
        request: &LlmRequest,
    ) -> Result<LlmPreAction, Error> {
        for controller in &self.controllers {
            let action = controller
                .before_llm_call(iteration, request)
                .await
                .map_err(|e| Error::hook_contract("before_llm_call", e))?;
            if !matches!(action, LlmPreAction::Proceed) {
                return Ok(action);
            }
        }
        Ok(LlmPreAction::Proceed)
    }

    /// Consult controllers after an LLM call completed.
    pub async fn control_after_llm_call(
        &self,
        iteration: usize,
        final_message: &str,
    ) -> Result<LlmPostAction, Error> {
        for controller in &self.controllers {
            let action = controller
                .after_llm_call(iteration, final_message)
                .await
                .map_err(|e| Error::hook_contract("after_llm_call", e))?;
            if !matches!(action, LlmPostAction::Continue) {
                return Ok(action);
            }
        }
        Ok(LlmPostAction::Continue)
    }

    /// Consult controllers after an LLM call failed terminally.
    pub async fn control_after_llm_error(
        &self,
        iteration: usize,
        error: &TransportError,
    ) -> Result<LlmErrorAction, Error> {
        for controller in &self.controllers {
            let action = controller
                .after_llm_error(iteration, error)
                .await
                .map_err(|e| Error::hook_contract("after_llm_error", e))?;
            if !matches!(action, LlmErrorAction::Surface) {
                return Ok(action);
            }
        }
        Ok(LlmErrorAction::Surface)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Failing;

    #[async_trait]
    impl Observer for Failing {
        async fn on_abort(&self) -> HookResult {
            Err("always fails".into())
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Observer for Counting {
        async fn on_abort(&self) -> HookResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn observer_errors_are_isolated_and_counted() {
        let count = Arc::new(AtomicUsize::new(0));
        let hooks = HookSet::new()
            .with_observer(Arc::new(Failing))
            .with_observer(Arc::new(Counting(Arc::clone(&count))));

        hooks.notify_abort().await;

        // The failing observer did not prevent the counting one.
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.observer_failure_count(), 1);
    }

    struct Upper;

    impl Interceptor for Upper {
        fn text_chunk(&self, text: String) -> Option<String> {
            Some(text.to_uppercase())
        }
    }

    struct DropShort;

    impl Interceptor for DropShort {
        fn text_chunk(&self, text: String) -> Option<String> {
            (text.len() > 2).then_some(text)
        }
    }

    #[test]
    fn interceptors_compose_in_registration_order() {
        let hooks = HookSet::new()
            .with_interceptor(Arc::new(Upper))
            .with_interceptor(Arc::new(DropShort));
        assert_eq!(
            hooks.intercept_text_chunk("abc".to_owned()),
            Some("ABC".to_owned())
        );
        assert_eq!(hooks.intercept_text_chunk("ab".to_owned()), None);
    }

    struct Recovering;

    #[async_trait]
    impl Controller for Recovering {
        async fn after_llm_error(
            &self,
            _iteration: usize,
            _error: &TransportError,
        ) -> ControlResult<LlmErrorAction> {
            Ok(LlmErrorAction::Recover {
                response: "fallback".to_owned(),
            })
        }
    }

    #[tokio::test]
    async fn first_decisive_controller_wins() {
        let hooks = HookSet::new()
            .with_controller(Arc::new(Recovering))
            .with_controller(Arc::new(Recovering));
        let err = TransportError::api(500, "boom");
        match hooks.control_after_llm_error(0, &err).await.unwrap() {
            LlmErrorAction::Recover { response } => assert_eq!(response, "fallback"),
            LlmErrorAction::Surface => panic!("expected recovery"),
        }
    }

    struct Broken;

    #[async_trait]
    impl Controller for Broken {
        async fn before_llm_call(
            &self,
            _iteration: usize,
            _request: &LlmRequest,
        ) -> ControlResult<LlmPreAction> {
            Err("invalid action".into())
        }
    }

    #[tokio::test]
    async fn controller_error_is_a_contract_violation() {
        let hooks = HookSet::new().with_controller(Arc::new(Broken));
        let request = LlmRequest::new("m", Vec::new());
        let err = hooks.control_before_llm_call(0, &request).await.unwrap_err();
        assert!(matches!(err, Error::HookContract { .. }));
        assert!(err.to_string().contains("before_llm_call"));
    }
}
