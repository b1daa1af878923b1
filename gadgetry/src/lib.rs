//! Gadgetry is a streaming LLM agent loop with a dependency-aware
//! gadget scheduler.
//!
//! The model invokes side-effectful **gadgets** through a marker-based
//! wire format embedded in its text output. Per iteration, the
//! [`processor::StreamProcessor`] parses the response stream
//! incrementally, schedules gadget calls the moment they close (running
//! independent calls in parallel, parking calls whose dependencies are
//! still in flight), and yields typed [`events::StreamEvent`]s in real
//! time. The [`agent::AgentLoop`] drives iterations around it: retries
//! wrapped around whole stream consumptions, proactive rate limiting,
//! context compaction, hook dispatch, and conversation bookkeeping.
//! Everything an agent and its recursively spawned subagents do is
//! recorded in one shared [`tree::ExecutionTree`].

// Core data model
pub mod error;
pub mod message;
pub mod usage;

// Collaborator surfaces
pub mod catalog;
pub mod transport;

// Gadget machinery
pub mod executor;
pub mod gadget;
pub mod media;
pub mod output_store;
pub mod parser;

// The engine
pub mod agent;
pub mod events;
pub mod hooks;
pub mod processor;
pub mod tree;

// Policies
pub mod rate_limit;
pub mod retry;

// Ambient
pub mod session_log;

#[doc(hidden)]
pub mod testing;

pub mod prelude;

pub use error::{Error, Result};
