use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::types::*;

/// Uniform contract for every task executor.
pub trait Agent: Send + Sync + 'static {
    /// Registry key that workflow nodes refer to in `agent_type`.
    fn agent_type(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Capability tags, informational only.
    fn capabilities(&self) -> Vec<String> {
        vec![]
    }

    /// Check the resolved input before dispatch.
    ///
    /// A rejection fails the node permanently without consuming an attempt.
    fn validate_input(&self, input: &Value) -> std::result::Result<(), String>;

    /// Do the work.
    fn execute(
        &self,
        input: Value,
        ctx: AgentContext,
    ) -> BoxFuture<'_, std::result::Result<AgentResult, AgentError>>;

    /// Informational cost estimate; never blocks execution.
    fn estimate_cost(&self, _input: &Value) -> f64 {
        0.0
    }

    /// Default per-attempt deadline in seconds.
    fn timeout_secs(&self) -> u64 {
        300
    }
}

/// Persistence sink for status transitions.
pub trait ExecutionRecorder: Send + Sync + 'static {
    /// Persist the execution-level record (tasks are recorded separately).
    fn record_execution(&self, execution: &WorkflowExecution) -> BoxFuture<'_, Result<()>>;

    /// Persist one task record.
    fn record_task(
        &self,
        execution_id: &ExecutionId,
        task: &TaskExecution,
    ) -> BoxFuture<'_, Result<()>>;
}
