//! Workflow execution engine.
//!
//! A workflow is a [`WorkflowDag`] of [`Node`]s linked by dependency sets.
//! [`WorkflowEngine::submit`] validates the graph and hands it to a
//! per-execution scheduler task, which dispatches ready nodes concurrently
//! through the [`AgentRegistry`](evoflow_agents::AgentRegistry), wires outputs
//! into downstream inputs via the [`ContextStore`], and reports every status
//! transition on the event bus and to the configured recorder.

pub mod approval;
pub mod context;
pub mod dag;
pub mod engine;
pub mod event_log;
pub mod retry;
mod scheduler;
pub mod template;

pub use approval::{ApprovalBroker, PendingApproval};
pub use context::ContextStore;
pub use dag::{Node, RetryPolicy, WorkflowDag};
pub use engine::WorkflowEngine;
pub use event_log::EventLogger;
pub use retry::EffectiveRetry;
