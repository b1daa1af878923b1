//! The execution tree: authoritative record of LLM calls and gadget
//! invocations.
//!
//! A root agent and every subagent it spawns share one tree. LLM-call
//! nodes parent the gadget nodes parsed from their responses; a gadget
//! that spawns a subagent parents that subagent's LLM-call nodes. Cost,
//! token, and media aggregates are computed on demand by walking the
//! subtree; nothing is denormalized.
//!
//! Mutations are owned by the stream processor and agent loop. Observers
//! read concurrently and may subscribe to the event bus, whose delivery
//! order matches mutation order.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::media::MediaRef;
use crate::message::Message;
use crate::transport::FinishReason;
use crate::usage::TokenUsage;

/// Internal identifier for a tree node; distinct from invocation ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(Uuid);

impl NodeId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.simple().fmt(f)
    }
}

/// Lifecycle state of an LLM-call node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmCallState {
    /// Created; the request has not produced chunks yet.
    Pending,
    /// The response stream is open.
    Streaming,
    /// Finished normally.
    Completed,
    /// Abandoned mid-call (abort or loop teardown).
    Interrupted,
}

/// Lifecycle state of a gadget node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GadgetState {
    /// Parsed and recorded, not yet running.
    Pending,
    /// Execution in progress.
    Running,
    /// Finished without error.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Never executed; see the node's skip reason.
    Skipped,
}

impl GadgetState {
    /// Returns `true` for terminal states.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Why a gadget was skipped instead of executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The call listed its own invocation id as a dependency.
    SelfReference,
    /// A listed dependency failed.
    DependencyFailed,
    /// The per-response gadget cap was exceeded.
    LimitExceeded,
    /// Dependencies never resolved (circular or missing).
    UnresolvedDependency,
    /// The invocation id was already used by an earlier call.
    DuplicateInvocation,
}

impl SkipReason {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SelfReference => "self_reference",
            Self::DependencyFailed => "dependency_failed",
            Self::LimitExceeded => "limit_exceeded",
            Self::UnresolvedDependency => "unresolved_dependency",
            Self::DuplicateInvocation => "duplicate_invocation",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an LLM-call node.
#[derive(Debug, Clone)]
pub struct LlmCallNode {
    /// Iteration number within the owning agent loop.
    pub iteration: usize,
    /// Model identifier.
    pub model: String,
    /// Request messages as sent.
    pub request: Vec<Message>,
    /// Accumulated response text, once known.
    pub response: Option<String>,
    /// Token usage, once known.
    pub usage: Option<TokenUsage>,
    /// Finish reason, once known.
    pub finish_reason: Option<FinishReason>,
    /// Estimated cost, once known.
    pub cost: Option<f64>,
    /// Lifecycle state.
    pub state: LlmCallState,
}

/// Payload of a gadget node.
#[derive(Debug, Clone)]
pub struct GadgetNode {
    /// Caller-visible invocation id.
    pub invocation_id: String,
    /// Gadget name.
    pub name: String,
    /// Parameters (updated if a hook rewrites them).
    pub params: Value,
    /// Invocation ids this gadget depends on.
    pub dependencies: Vec<String>,
    /// Lifecycle state.
    pub state: GadgetState,
    /// Result text on success.
    pub result: Option<String>,
    /// Error text on failure.
    pub error: Option<String>,
    /// Wall-clock execution time.
    pub execution_time: Option<Duration>,
    /// Cost incurred, if any.
    pub cost: Option<f64>,
    /// Media produced.
    pub media: Vec<MediaRef>,
    /// Populated when state is `Skipped`.
    pub skip_reason: Option<SkipReason>,
    /// The dependency whose failure caused a skip, if any.
    pub failed_dependency: Option<String>,
}

/// Node payload variants.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// One LLM call.
    LlmCall(LlmCallNode),
    /// One gadget invocation.
    Gadget(GadgetNode),
}

/// A node in the execution tree.
#[derive(Debug, Clone)]
pub struct TreeNode {
    /// Internal node id.
    pub id: NodeId,
    /// Parent node, absent for roots.
    pub parent: Option<NodeId>,
    /// Root depth is 0; children are parent depth + 1.
    pub depth: usize,
    /// Creation instant.
    pub created_at: SystemTime,
    /// Set exactly when the node reaches a terminal state.
    pub completed_at: Option<SystemTime>,
    /// Payload.
    pub kind: NodeKind,
}

impl TreeNode {
    /// The gadget payload, if this is a gadget node.
    #[must_use]
    pub const fn as_gadget(&self) -> Option<&GadgetNode> {
        match &self.kind {
            NodeKind::Gadget(g) => Some(g),
            NodeKind::LlmCall(_) => None,
        }
    }

    /// The LLM-call payload, if this is an LLM-call node.
    #[must_use]
    pub const fn as_llm_call(&self) -> Option<&LlmCallNode> {
        match &self.kind {
            NodeKind::LlmCall(c) => Some(c),
            NodeKind::Gadget(_) => None,
        }
    }
}

/// Completion data for an LLM-call node.
#[derive(Debug, Clone, Default)]
pub struct LlmCallCompletion {
    /// Full response text.
    pub response: Option<String>,
    /// Token usage.
    pub usage: Option<TokenUsage>,
    /// Finish reason.
    pub finish_reason: Option<FinishReason>,
    /// Estimated cost.
    pub cost: Option<f64>,
}

/// Completion data for a gadget node.
#[derive(Debug, Clone, Default)]
pub struct GadgetCompletion {
    /// Result text on success.
    pub result: Option<String>,
    /// Error text on failure.
    pub error: Option<String>,
    /// Wall-clock execution time.
    pub execution_time: Duration,
    /// Cost incurred.
    pub cost: Option<f64>,
    /// Media produced.
    pub media: Vec<MediaRef>,
}

/// Creation data for a gadget node.
#[derive(Debug, Clone)]
pub struct GadgetSpec {
    /// Caller-visible invocation id; must be unique for the tree's
    /// lifetime.
    pub invocation_id: String,
    /// Gadget name.
    pub name: String,
    /// Initial parameters.
    pub params: Value,
    /// Dependency invocation ids.
    pub dependencies: Vec<String>,
    /// Owning LLM-call node.
    pub parent: NodeId,
}

/// Lifecycle events published on the tree's bus.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum TreeEvent {
    /// An LLM-call node was created.
    LlmCallStart {
        /// The node.
        id: NodeId,
    },
    /// The loop finished pre-call hooks; the request is about to go out.
    LlmCallReady {
        /// The node.
        id: NodeId,
    },
    /// The response stream ended.
    LlmResponseEnd {
        /// The node.
        id: NodeId,
    },
    /// The LLM-call node reached a terminal state.
    LlmCallCompleted {
        /// The node.
        id: NodeId,
    },
    /// A gadget node was created.
    GadgetAdded {
        /// The node.
        id: NodeId,
        /// Its invocation id.
        invocation_id: String,
    },
    /// A gadget began executing.
    GadgetStarted {
        /// The node.
        id: NodeId,
        /// Its invocation id.
        invocation_id: String,
    },
    /// A gadget finished (success or failure).
    GadgetCompleted {
        /// The node.
        id: NodeId,
        /// Its invocation id.
        invocation_id: String,
    },
    /// A gadget was skipped.
    GadgetSkipped {
        /// The node.
        id: NodeId,
        /// Its invocation id.
        invocation_id: String,
    },
}

#[derive(Debug, Default)]
struct TreeState {
    nodes: HashMap<NodeId, TreeNode>,
    children: HashMap<NodeId, Vec<NodeId>>,
    by_invocation: HashMap<String, NodeId>,
    order: Vec<NodeId>,
}

/// Process-local, thread-safe execution tree. Cloning shares the tree.
#[derive(Debug, Clone)]
pub struct ExecutionTree {
    state: Arc<RwLock<TreeState>>,
    events: broadcast::Sender<TreeEvent>,
}

impl Default for ExecutionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTree {
    const EVENT_CAPACITY: usize = 1024;

    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(Self::EVENT_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(TreeState::default())),
            events,
        }
    }

    /// Subscribe to lifecycle events. Delivery is ordered per node and
    /// matches mutation order across nodes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TreeState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TreeState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TreeEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    // -- LLM-call nodes ----------------------------------------------------

    /// Create an LLM-call node.
    pub fn add_llm_call(
        &self,
        iteration: usize,
        model: impl Into<String>,
        parent: Option<NodeId>,
        request: Vec<Message>,
    ) -> NodeId {
        let id = NodeId::generate();
        {
            let mut state = self.write();
            let depth = parent.map_or(0, |p| {
                state
                    .nodes
                    .get(&p)
                    .unwrap_or_else(|| panic!("unknown parent node {p}"))
                    .depth
                    + 1
            });
            let node = TreeNode {
                id,
                parent,
                depth,
                created_at: SystemTime::now(),
                completed_at: None,
                kind: NodeKind::LlmCall(LlmCallNode {
                    iteration,
                    model: model.into(),
                    request,
                    response: None,
                    usage: None,
                    finish_reason: None,
                    cost: None,
                    state: LlmCallState::Pending,
                }),
            };
            state.nodes.insert(id, node);
            state.order.push(id);
            if let Some(p) = parent {
                state.children.entry(p).or_default().push(id);
            }
        }
        self.emit(TreeEvent::LlmCallStart { id });
        id
    }

    /// Publish the "ready" bus event for an LLM call (pre-call hooks ran).
    pub fn mark_llm_call_ready(&self, id: NodeId) {
        self.emit(TreeEvent::LlmCallReady { id });
    }

    /// Mark the response stream as open.
    ///
    /// Already-streaming is accepted: a retried attempt reopens the
    /// stream for the same call node.
    pub fn start_llm_response(&self, id: NodeId) {
        let mut state = self.write();
        let call = llm_call_mut(&mut state, id);
        match call.state {
            LlmCallState::Pending => call.state = LlmCallState::Streaming,
            LlmCallState::Streaming => {}
            other => panic!("start_llm_response on node {id} in state {other:?}"),
        }
    }

    /// Record end-of-stream metadata.
    pub fn end_llm_response(
        &self,
        id: NodeId,
        finish_reason: Option<FinishReason>,
        usage: Option<TokenUsage>,
    ) {
        {
            let mut state = self.write();
            let call = llm_call_mut(&mut state, id);
            if finish_reason.is_some() {
                call.finish_reason = finish_reason;
            }
            if usage.is_some() {
                call.usage = usage;
            }
        }
        self.emit(TreeEvent::LlmResponseEnd { id });
    }

    /// Complete an LLM-call node.
    pub fn complete_llm_call(&self, id: NodeId, completion: LlmCallCompletion) {
        {
            let mut state = self.write();
            let node = node_mut(&mut state, id);
            let NodeKind::LlmCall(call) = &mut node.kind else {
                panic!("complete_llm_call on non-LLM node {id}");
            };
            assert!(
                matches!(call.state, LlmCallState::Pending | LlmCallState::Streaming),
                "complete_llm_call on node {id} in state {:?}",
                call.state
            );
            call.state = LlmCallState::Completed;
            if completion.response.is_some() {
                call.response = completion.response;
            }
            if completion.usage.is_some() {
                call.usage = completion.usage;
            }
            if completion.finish_reason.is_some() {
                call.finish_reason = completion.finish_reason;
            }
            call.cost = completion.cost;
            node.completed_at = Some(SystemTime::now());
        }
        self.emit(TreeEvent::LlmCallCompleted { id });
    }

    /// Mark an in-flight LLM call as interrupted (loop teardown, abort).
    pub fn interrupt_llm_call(&self, id: NodeId) {
        {
            let mut state = self.write();
            let node = node_mut(&mut state, id);
            let NodeKind::LlmCall(call) = &mut node.kind else {
                panic!("interrupt_llm_call on non-LLM node {id}");
            };
            if matches!(
                call.state,
                LlmCallState::Completed | LlmCallState::Interrupted
            ) {
                return;
            }
            call.state = LlmCallState::Interrupted;
            call.finish_reason = Some(FinishReason::Interrupted);
            node.completed_at = Some(SystemTime::now());
        }
        self.emit(TreeEvent::LlmCallCompleted { id });
    }

    // -- Gadget nodes ------------------------------------------------------

    /// Create a gadget node under an LLM-call node.
    ///
    /// # Panics
    ///
    /// Panics when the invocation id is already present; invocation ids
    /// are unique for the tree's lifetime.
    pub fn add_gadget(&self, spec: GadgetSpec) -> NodeId {
        let id = NodeId::generate();
        let invocation_id = spec.invocation_id.clone();
        {
            let mut state = self.write();
            assert!(
                !state.by_invocation.contains_key(&spec.invocation_id),
                "duplicate invocation id {:?}",
                spec.invocation_id
            );
            let parent = state
                .nodes
                .get(&spec.parent)
                .unwrap_or_else(|| panic!("unknown parent node {}", spec.parent));
            assert!(
                matches!(parent.kind, NodeKind::LlmCall(_)),
                "gadget parent {} is not an LLM-call node",
                spec.parent
            );
            let depth = parent.depth + 1;
            let node = TreeNode {
                id,
                parent: Some(spec.parent),
                depth,
                created_at: SystemTime::now(),
                completed_at: None,
                kind: NodeKind::Gadget(GadgetNode {
                    invocation_id: spec.invocation_id.clone(),
                    name: spec.name,
                    params: spec.params,
                    dependencies: spec.dependencies,
                    state: GadgetState::Pending,
                    result: None,
                    error: None,
                    execution_time: None,
                    cost: None,
                    media: Vec::new(),
                    skip_reason: None,
                    failed_dependency: None,
                }),
            };
            state.nodes.insert(id, node);
            state.order.push(id);
            state.children.entry(spec.parent).or_default().push(id);
            state.by_invocation.insert(spec.invocation_id, id);
        }
        self.emit(TreeEvent::GadgetAdded { id, invocation_id });
        id
    }

    /// Replace a gadget's parameters (hook-driven rewrite before
    /// execution).
    pub fn update_gadget_parameters(&self, invocation_id: &str, params: Value) {
        let mut state = self.write();
        let Some(&id) = state.by_invocation.get(invocation_id) else {
            panic!("unknown invocation id {invocation_id:?}");
        };
        let gadget = gadget_mut(&mut state, id);
        assert!(
            gadget.state == GadgetState::Pending,
            "update_gadget_parameters on {invocation_id:?} in state {:?}",
            gadget.state
        );
        gadget.params = params;
    }

    /// Mark a gadget as running.
    pub fn start_gadget(&self, id: NodeId) {
        let invocation_id;
        {
            let mut state = self.write();
            let gadget = gadget_mut(&mut state, id);
            assert!(
                gadget.state == GadgetState::Pending,
                "start_gadget on node {id} in state {:?}",
                gadget.state
            );
            gadget.state = GadgetState::Running;
            invocation_id = gadget.invocation_id.clone();
        }
        self.emit(TreeEvent::GadgetStarted { id, invocation_id });
    }

    /// Complete a gadget (success when `error` is absent, failure
    /// otherwise).
    pub fn complete_gadget(&self, id: NodeId, completion: GadgetCompletion) {
        let invocation_id;
        {
            let mut state = self.write();
            let node = node_mut(&mut state, id);
            let NodeKind::Gadget(gadget) = &mut node.kind else {
                panic!("complete_gadget on non-gadget node {id}");
            };
            assert!(
                matches!(gadget.state, GadgetState::Pending | GadgetState::Running),
                "complete_gadget on node {id} in state {:?}",
                gadget.state
            );
            gadget.state = if completion.error.is_some() {
                GadgetState::Failed
            } else {
                GadgetState::Succeeded
            };
            gadget.result = completion.result;
            gadget.error = completion.error;
            gadget.execution_time = Some(completion.execution_time);
            gadget.cost = completion.cost;
            gadget.media = completion.media;
            invocation_id = gadget.invocation_id.clone();
            node.completed_at = Some(SystemTime::now());
        }
        self.emit(TreeEvent::GadgetCompleted { id, invocation_id });
    }

    /// Skip a gadget that will never execute.
    pub fn skip_gadget(
        &self,
        id: NodeId,
        failed_dependency: Option<String>,
        error: Option<String>,
        reason: SkipReason,
    ) {
        let invocation_id;
        {
            let mut state = self.write();
            let node = node_mut(&mut state, id);
            let NodeKind::Gadget(gadget) = &mut node.kind else {
                panic!("skip_gadget on non-gadget node {id}");
            };
            assert!(
                gadget.state == GadgetState::Pending,
                "skip_gadget on node {id} in state {:?}",
                gadget.state
            );
            gadget.state = GadgetState::Skipped;
            gadget.skip_reason = Some(reason);
            gadget.failed_dependency = failed_dependency;
            gadget.error = error;
            invocation_id = gadget.invocation_id.clone();
            node.completed_at = Some(SystemTime::now());
        }
        self.emit(TreeEvent::GadgetSkipped { id, invocation_id });
    }

    // -- Queries -----------------------------------------------------------

    /// Fetch a node by id.
    #[must_use]
    pub fn get_node(&self, id: NodeId) -> Option<TreeNode> {
        self.read().nodes.get(&id).cloned()
    }

    /// Fetch a gadget node by invocation id.
    #[must_use]
    pub fn get_node_by_invocation_id(&self, invocation_id: &str) -> Option<TreeNode> {
        let state = self.read();
        state
            .by_invocation
            .get(invocation_id)
            .and_then(|id| state.nodes.get(id))
            .cloned()
    }

    /// All nodes in creation order.
    #[must_use]
    pub fn get_all_nodes(&self) -> Vec<TreeNode> {
        let state = self.read();
        state
            .order
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .cloned()
            .collect()
    }

    /// All descendants of a node, in creation order.
    #[must_use]
    pub fn get_descendants(&self, id: NodeId) -> Vec<TreeNode> {
        let state = self.read();
        let mut result = Vec::new();
        let mut stack = vec![id];
        let mut ids = Vec::new();
        while let Some(current) = stack.pop() {
            if let Some(children) = state.children.get(&current) {
                for &child in children {
                    ids.push(child);
                    stack.push(child);
                }
            }
        }
        for node_id in &state.order {
            if ids.contains(node_id)
                && let Some(node) = state.nodes.get(node_id)
            {
                result.push(node.clone());
            }
        }
        result
    }

    /// Sum of costs over a node and its descendants.
    #[must_use]
    pub fn get_subtree_cost(&self, id: NodeId) -> f64 {
        self.fold_subtree(id, 0.0, |acc, node| acc + node_cost(node))
    }

    /// Sum of token usage over a node and its descendants.
    #[must_use]
    pub fn get_subtree_tokens(&self, id: NodeId) -> TokenUsage {
        self.fold_subtree(id, TokenUsage::zero(), |acc, node| acc + node_tokens(node))
    }

    /// All media referenced in a node and its descendants.
    #[must_use]
    pub fn get_subtree_media(&self, id: NodeId) -> Vec<MediaRef> {
        self.fold_subtree(id, Vec::new(), |mut acc, node| {
            if let NodeKind::Gadget(g) = &node.kind {
                acc.extend(g.media.iter().cloned());
            }
            acc
        })
    }

    /// Sum of costs over every node in the tree.
    #[must_use]
    pub fn get_total_cost(&self) -> f64 {
        let state = self.read();
        state.nodes.values().map(node_cost).sum()
    }

    /// Sum of token usage over every node in the tree.
    #[must_use]
    pub fn get_total_tokens(&self) -> TokenUsage {
        let state = self.read();
        state
            .nodes
            .values()
            .fold(TokenUsage::zero(), |acc, node| acc + node_tokens(node))
    }

    fn fold_subtree<T>(&self, id: NodeId, init: T, mut f: impl FnMut(T, &TreeNode) -> T) -> T {
        let state = self.read();
        let mut acc = init;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = state.nodes.get(&current) {
                acc = f(acc, node);
            }
            if let Some(children) = state.children.get(&current) {
                stack.extend(children.iter().copied());
            }
        }
        acc
    }
}

fn node_mut(state: &mut TreeState, id: NodeId) -> &mut TreeNode {
    state
        .nodes
        .get_mut(&id)
        .unwrap_or_else(|| panic!("unknown node {id}"))
}

fn llm_call_mut(state: &mut TreeState, id: NodeId) -> &mut LlmCallNode {
    match &mut node_mut(state, id).kind {
        NodeKind::LlmCall(call) => call,
        NodeKind::Gadget(_) => panic!("node {id} is not an LLM-call node"),
    }
}

fn gadget_mut(state: &mut TreeState, id: NodeId) -> &mut GadgetNode {
    match &mut node_mut(state, id).kind {
        NodeKind::Gadget(gadget) => gadget,
        NodeKind::LlmCall(_) => panic!("node {id} is not a gadget node"),
    }
}

fn node_cost(node: &TreeNode) -> f64 {
    match &node.kind {
        NodeKind::LlmCall(c) => c.cost.unwrap_or(0.0),
        NodeKind::Gadget(g) => g.cost.unwrap_or(0.0),
    }
}

fn node_tokens(node: &TreeNode) -> TokenUsage {
    match &node.kind {
        NodeKind::LlmCall(c) => c.usage.unwrap_or_else(TokenUsage::zero),
        NodeKind::Gadget(_) => TokenUsage::zero(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gadget_spec(invocation_id: &str, parent: NodeId) -> GadgetSpec {
        GadgetSpec {
            invocation_id: invocation_id.to_owned(),
            name: "probe".to_owned(),
            params: json!({}),
            dependencies: Vec::new(),
            parent,
        }
    }

    #[test]
    fn llm_call_lifecycle() {
        let tree = ExecutionTree::new();
        let id = tree.add_llm_call(0, "m", None, vec![Message::user("hi")]);
        tree.start_llm_response(id);
        tree.end_llm_response(id, Some(FinishReason::Stop), Some(TokenUsage::new(10, 5)));
        tree.complete_llm_call(
            id,
            LlmCallCompletion {
                response: Some("hello".to_owned()),
                cost: Some(0.25),
                ..LlmCallCompletion::default()
            },
        );

        let node = tree.get_node(id).unwrap();
        assert_eq!(node.depth, 0);
        assert!(node.completed_at.is_some());
        let call = node.as_llm_call().unwrap();
        assert_eq!(call.state, LlmCallState::Completed);
        assert_eq!(call.response.as_deref(), Some("hello"));
        assert_eq!(call.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn gadget_depth_is_parent_plus_one() {
        let tree = ExecutionTree::new();
        let llm = tree.add_llm_call(0, "m", None, Vec::new());
        let gadget = tree.add_gadget(gadget_spec("g1", llm));
        assert_eq!(tree.get_node(gadget).unwrap().depth, 1);

        // A subagent LLM call parents to the spawning gadget.
        let sub_llm = tree.add_llm_call(0, "m", Some(gadget), Vec::new());
        assert_eq!(tree.get_node(sub_llm).unwrap().depth, 2);
    }

    #[test]
    #[should_panic(expected = "duplicate invocation id")]
    fn duplicate_invocation_id_panics() {
        let tree = ExecutionTree::new();
        let llm = tree.add_llm_call(0, "m", None, Vec::new());
        tree.add_gadget(gadget_spec("g1", llm));
        tree.add_gadget(gadget_spec("g1", llm));
    }

    #[test]
    #[should_panic(expected = "complete_gadget on node")]
    fn double_complete_panics() {
        let tree = ExecutionTree::new();
        let llm = tree.add_llm_call(0, "m", None, Vec::new());
        let id = tree.add_gadget(gadget_spec("g1", llm));
        tree.start_gadget(id);
        tree.complete_gadget(id, GadgetCompletion::default());
        tree.complete_gadget(id, GadgetCompletion::default());
    }

    #[test]
    fn completed_at_set_only_on_terminal_states() {
        let tree = ExecutionTree::new();
        let llm = tree.add_llm_call(0, "m", None, Vec::new());
        let id = tree.add_gadget(gadget_spec("g1", llm));
        assert!(tree.get_node(id).unwrap().completed_at.is_none());
        tree.start_gadget(id);
        assert!(tree.get_node(id).unwrap().completed_at.is_none());
        tree.complete_gadget(id, GadgetCompletion::default());
        assert!(tree.get_node(id).unwrap().completed_at.is_some());
    }

    #[test]
    fn skip_records_reason_and_dependency() {
        let tree = ExecutionTree::new();
        let llm = tree.add_llm_call(0, "m", None, Vec::new());
        let id = tree.add_gadget(gadget_spec("g1", llm));
        tree.skip_gadget(
            id,
            Some("g0".to_owned()),
            Some("dependency failed".to_owned()),
            SkipReason::DependencyFailed,
        );
        let node = tree.get_node(id).unwrap();
        let gadget = node.as_gadget().unwrap();
        assert_eq!(gadget.state, GadgetState::Skipped);
        assert_eq!(gadget.skip_reason, Some(SkipReason::DependencyFailed));
        assert_eq!(gadget.failed_dependency.as_deref(), Some("g0"));
    }

    #[test]
    fn subtree_aggregates_sum_costs_and_tokens() {
        let tree = ExecutionTree::new();
        let root = tree.add_llm_call(0, "m", None, Vec::new());
        tree.complete_llm_call(
            root,
            LlmCallCompletion {
                usage: Some(TokenUsage::new(100, 50)),
                cost: Some(1.0),
                ..LlmCallCompletion::default()
            },
        );
        let gadget = tree.add_gadget(gadget_spec("g1", root));
        tree.start_gadget(gadget);
        tree.complete_gadget(
            gadget,
            GadgetCompletion {
                cost: Some(0.5),
                ..GadgetCompletion::default()
            },
        );
        let sub = tree.add_llm_call(0, "m", Some(gadget), Vec::new());
        tree.complete_llm_call(
            sub,
            LlmCallCompletion {
                usage: Some(TokenUsage::new(10, 5)),
                cost: Some(0.25),
                ..LlmCallCompletion::default()
            },
        );

        assert!((tree.get_subtree_cost(root) - 1.75).abs() < 1e-9);
        assert!((tree.get_subtree_cost(gadget) - 0.75).abs() < 1e-9);
        assert!((tree.get_total_cost() - 1.75).abs() < 1e-9);
        assert_eq!(tree.get_subtree_tokens(root).total(), 165);
        assert_eq!(tree.get_total_tokens().input_tokens, 110);
    }

    #[test]
    fn lookup_by_invocation_id() {
        let tree = ExecutionTree::new();
        let llm = tree.add_llm_call(0, "m", None, Vec::new());
        tree.add_gadget(gadget_spec("g1", llm));
        let node = tree.get_node_by_invocation_id("g1").unwrap();
        assert_eq!(node.as_gadget().unwrap().invocation_id, "g1");
        assert!(tree.get_node_by_invocation_id("nope").is_none());
    }

    #[tokio::test]
    async fn event_bus_order_matches_mutation_order() {
        let tree = ExecutionTree::new();
        let mut rx = tree.subscribe();

        let llm = tree.add_llm_call(0, "m", None, Vec::new());
        let gadget = tree.add_gadget(gadget_spec("g1", llm));
        tree.start_gadget(gadget);
        tree.complete_gadget(gadget, GadgetCompletion::default());

        assert!(matches!(rx.recv().await.unwrap(), TreeEvent::LlmCallStart { .. }));
        assert!(matches!(rx.recv().await.unwrap(), TreeEvent::GadgetAdded { .. }));
        assert!(matches!(rx.recv().await.unwrap(), TreeEvent::GadgetStarted { .. }));
        assert!(matches!(rx.recv().await.unwrap(), TreeEvent::GadgetCompleted { .. }));
    }

    #[test]
    fn interrupt_marks_finish_reason() {
        let tree = ExecutionTree::new();
        let id = tree.add_llm_call(0, "m", None, Vec::new());
        tree.start_llm_response(id);
        tree.interrupt_llm_call(id);
        let node = tree.get_node(id).unwrap();
        let call = node.as_llm_call().unwrap();
        assert_eq!(call.state, LlmCallState::Interrupted);
        assert_eq!(call.finish_reason, Some(FinishReason::Interrupted));
        assert!(node.completed_at.is_some());
    }

    #[test]
    fn descendants_are_in_creation_order() {
        let tree = ExecutionTree::new();
        let root = tree.add_llm_call(0, "m", None, Vec::new());
        let a = tree.add_gadget(gadget_spec("a1", root));
        let b = tree.add_gadget(gadget_spec("b1", root));
        let descendants = tree.get_descendants(root);
        assert_eq!(descendants.len(), 2);
        assert_eq!(descendants[0].id, a);
        assert_eq!(descendants[1].id, b);
    }
}
