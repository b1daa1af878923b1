//! Builder for [`AgentLoop`].

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AgentLoop, AgentOptions, Compactor, TreeEventCallback};
use crate::catalog::ModelCatalog;
use crate::error::{Error, Result};
use crate::executor::{SubagentCallback, SubagentSeed};
use crate::gadget::{Gadget, GadgetRegistry};
use crate::hooks::{Controller, HookSet, Interceptor, Observer, SubagentContext};
use crate::media::MediaStore;
use crate::message::Message;
use crate::output_store::{GadgetOutputViewer, OutputStore};
use crate::rate_limit::{RateLimitConfig, RateLimitTracker};
use crate::retry::RetryConfig;
use crate::session_log::SessionLog;
use crate::transport::LlmTransport;
use crate::tree::{ExecutionTree, NodeId};

/// Builds an [`AgentLoop`], root or subagent.
///
/// # Example
///
/// ```rust,ignore
/// let agent = AgentLoopBuilder::new(AgentOptions::new("my-model"))
///     .transport(transport)
///     .gadget(Arc::new(MyGadget))
///     .system_prompt("You are a helpful agent.")
///     .user_message("Sum 2 and 3.")
///     .build()?;
/// let events = agent.run();
/// ```
pub struct AgentLoopBuilder {
    options: AgentOptions,
    transport: Option<Arc<dyn LlmTransport>>,
    lend_transport: bool,
    catalog: Option<Arc<dyn ModelCatalog>>,
    registry: GadgetRegistry,
    hooks: HookSet,
    retry: RetryConfig,
    rate_limit: Option<RateLimitConfig>,
    compactor: Option<Arc<dyn Compactor>>,
    conversation: Vec<Message>,
    session_log_dir: Option<PathBuf>,
    subagent: Option<SubagentSeed>,
    subagent_callback: Option<SubagentCallback>,
    tree_event_callback: Option<TreeEventCallback>,
    cancel: Option<CancellationToken>,
    tree: Option<ExecutionTree>,
}

impl std::fmt::Debug for AgentLoopBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoopBuilder")
            .field("options", &self.options)
            .field("gadgets", &self.registry.len())
            .field("subagent", &self.subagent.is_some())
            .finish_non_exhaustive()
    }
}

impl AgentLoopBuilder {
    /// Start a root-agent builder.
    #[must_use]
    pub fn new(options: AgentOptions) -> Self {
        Self {
            options,
            transport: None,
            lend_transport: true,
            catalog: None,
            registry: GadgetRegistry::new(),
            hooks: HookSet::new(),
            retry: RetryConfig::default(),
            rate_limit: None,
            compactor: None,
            conversation: Vec::new(),
            session_log_dir: None,
            subagent: None,
            subagent_callback: None,
            tree_event_callback: None,
            cancel: None,
            tree: None,
        }
    }

    /// Start a subagent builder from a seed obtained inside a gadget.
    ///
    /// The child shares the parent's tree, abort signal, rate limiter,
    /// retry policy, and transport, and parents its LLM calls under the
    /// spawning gadget's node.
    #[must_use]
    pub fn subagent(options: AgentOptions, seed: SubagentSeed) -> Self {
        let mut builder = Self::new(options);
        builder.transport = Some(Arc::clone(&seed.transport));
        builder.catalog = seed.catalog.clone();
        builder.retry = seed.retry.clone();
        builder.cancel = Some(seed.cancel.clone());
        builder.tree = Some(seed.tree.clone());
        builder.subagent = Some(seed);
        builder
    }

    /// Set the LLM transport (required for root agents).
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn LlmTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Keep the transport out of gadget contexts, preventing subagent
    /// spawning.
    #[must_use]
    pub const fn without_transport_lending(mut self) -> Self {
        self.lend_transport = false;
        self
    }

    /// Set the model catalog.
    #[must_use]
    pub fn catalog(mut self, catalog: Arc<dyn ModelCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Register a gadget.
    #[must_use]
    pub fn gadget(mut self, gadget: Arc<dyn Gadget>) -> Self {
        self.registry.register(gadget);
        self
    }

    /// Register an observer hook.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.hooks = self.hooks.with_observer(observer);
        self
    }

    /// Register an interceptor hook.
    #[must_use]
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.hooks = self.hooks.with_interceptor(interceptor);
        self
    }

    /// Register a controller hook.
    #[must_use]
    pub fn controller(mut self, controller: Arc<dyn Controller>) -> Self {
        self.hooks = self.hooks.with_controller(controller);
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Enable proactive rate limiting (root agents; subagents always
    /// share the parent's tracker).
    #[must_use]
    pub const fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Set the context compactor.
    #[must_use]
    pub fn compactor(mut self, compactor: Arc<dyn Compactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    /// Seed the conversation with a system prompt.
    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.conversation.insert(0, Message::system(prompt));
        self
    }

    /// Append a user message to the starting conversation.
    #[must_use]
    pub fn user_message(mut self, content: impl Into<String>) -> Self {
        self.conversation.push(Message::user(content));
        self
    }

    /// Append an arbitrary message to the starting conversation.
    #[must_use]
    pub fn message(mut self, message: Message) -> Self {
        self.conversation.push(message);
        self
    }

    /// Write `NNNN.request`/`NNNN.response` files into `dir`.
    #[must_use]
    pub fn session_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_log_dir = Some(dir.into());
        self
    }

    /// Deliver subagent events synchronously to `callback` (for
    /// real-time UIs; the streamed form is batched behind yields).
    #[must_use]
    pub fn subagent_event_callback(mut self, callback: SubagentCallback) -> Self {
        self.subagent_callback = Some(callback);
        self
    }

    /// Deliver tree bus events to `callback` for the lifetime of the
    /// run.
    #[must_use]
    pub fn tree_event_callback(mut self, callback: TreeEventCallback) -> Self {
        self.tree_event_callback = Some(callback);
        self
    }

    /// Use an external abort signal.
    #[must_use]
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Use an existing execution tree.
    #[must_use]
    pub fn tree(mut self, tree: ExecutionTree) -> Self {
        self.tree = Some(tree);
        self
    }

    /// Assemble the loop.
    pub fn build(mut self) -> Result<AgentLoop> {
        let transport = self
            .transport
            .take()
            .ok_or_else(|| Error::configuration("an LLM transport is required"))?;

        let session_log = match self.session_log_dir {
            Some(dir) => Some(SessionLog::new(dir)?),
            None => None,
        };

        let (injected_tx, injected_rx) = mpsc::unbounded_channel();

        struct Shared {
            tree: ExecutionTree,
            cancel: CancellationToken,
            rate_limiter: Arc<RateLimitTracker>,
            counter: Arc<AtomicU64>,
            media: MediaStore,
            outputs: OutputStore,
            parent_hooks: Option<Arc<HookSet>>,
            subagent_ctx: Option<SubagentContext>,
            parent_node: Option<NodeId>,
        }

        let shared = match self.subagent {
            Some(seed) => Shared {
                tree: seed.tree,
                cancel: seed.cancel,
                rate_limiter: seed.rate_limiter,
                counter: seed.counter,
                media: seed.media,
                outputs: seed.outputs,
                parent_hooks: Some(seed.parent_hooks),
                subagent_ctx: Some(seed.context),
                parent_node: Some(seed.parent_node),
            },
            None => Shared {
                tree: self.tree.unwrap_or_default(),
                cancel: self.cancel.unwrap_or_default(),
                rate_limiter: Arc::new(RateLimitTracker::new(self.rate_limit.unwrap_or_default())),
                counter: Arc::new(AtomicU64::new(0)),
                media: MediaStore::new(),
                outputs: OutputStore::new(),
                parent_hooks: None,
                subagent_ctx: None,
                parent_node: None,
            },
        };

        if self.options.output_limit.is_some() {
            self.registry
                .register(Arc::new(GadgetOutputViewer::new(shared.outputs.clone())));
        }

        Ok(AgentLoop {
            transport,
            lend_transport: self.lend_transport,
            catalog: self.catalog,
            registry: Arc::new(self.registry),
            hooks: Arc::new(self.hooks),
            parent_hooks: shared.parent_hooks,
            subagent_ctx: shared.subagent_ctx,
            tree: shared.tree,
            cancel: shared.cancel,
            rate_limiter: shared.rate_limiter,
            retry: self.retry,
            compactor: self.compactor,
            options: self.options,
            conversation: self.conversation,
            injected_rx,
            injected_tx,
            counter: shared.counter,
            media: shared.media,
            outputs: shared.outputs,
            session_log,
            parent_node: shared.parent_node,
            subagent_callback: self.subagent_callback,
            tree_event_callback: self.tree_event_callback,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn build_without_transport_is_a_configuration_error() {
        let err = AgentLoopBuilder::new(AgentOptions::new("m"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
