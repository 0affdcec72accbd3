use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Aborted because the engine broke one of its own invariants.
    InternalError,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "internal_error" => Ok(Self::InternalError),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// Lifecycle of one node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Retrying,
    AwaitingInput,
    Succeeded,
    Failed,
    Skipped,
    /// Never dispatched because the execution stopped first.
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::AwaitingInput => "awaiting_input",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "retrying" => Ok(Self::Retrying),
            "awaiting_input" => Ok(Self::AwaitingInput),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// Optional bookkeeping an agent reports with its output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

/// Successful result of an agent execution.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    pub output: Value,
    pub metadata: AgentMetadata,
}

impl AgentResult {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            metadata: AgentMetadata::default(),
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.metadata.tokens_used = Some(tokens);
        self
    }

    pub fn with_latency_ms(mut self, ms: u64) -> Self {
        self.metadata.latency_ms = Some(ms);
        self
    }
}

/// Context passed to agents during execution.
#[derive(Clone)]
pub struct AgentContext {
    pub execution_id: ExecutionId,
    pub node_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Per-node `agent_config` from the workflow definition.
    pub config: Value,
    /// Initial input payload of the execution.
    pub workflow_input: Value,
    /// Cancelled when the execution is cancelled or halted.
    pub cancel: CancellationToken,
}

impl fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContext")
            .field("execution_id", &self.execution_id)
            .field("node_id", &self.node_id)
            .field("attempt", &self.attempt)
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Descriptor for a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_type: String,
    pub description: String,
    pub capabilities: Vec<String>,
}

/// External answer to a node awaiting human input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ResumeSignal {
    /// The payload becomes the node's output.
    Approve { payload: Value },
    Reject { reason: String },
}

/// Per-node run record within a workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub node_id: String,
    pub agent_type: String,
    pub status: TaskStatus,
    /// Input after placeholder resolution.
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub attempt_count: u32,
    pub cost_estimate: Option<f64>,
    #[serde(default)]
    pub metadata: Option<AgentMetadata>,
    pub elapsed_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskExecution {
    pub fn new(node_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            agent_type: agent_type.into(),
            status: TaskStatus::Pending,
            input_data: None,
            output_data: None,
            error_message: None,
            attempt_count: 0,
            cost_estimate: None,
            metadata: None,
            elapsed_ms: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// One run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: ExecutionId,
    pub workflow_name: Option<String>,
    pub status: ExecutionStatus,
    pub input_data: Value,
    pub output_data: Option<Value>,
    /// Names the first permanently failed node and its error.
    pub error_summary: Option<String>,
    pub failed_node: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Task records keyed by node id.
    pub tasks: BTreeMap<String, TaskExecution>,
}

impl WorkflowExecution {
    pub fn new(execution_id: ExecutionId, workflow_name: Option<String>, input_data: Value) -> Self {
        Self {
            execution_id,
            workflow_name,
            status: ExecutionStatus::Pending,
            input_data,
            output_data: None,
            error_summary: None,
            failed_node: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            tasks: BTreeMap::new(),
        }
    }

    pub fn task(&self, node_id: &str) -> Option<&TaskExecution> {
        self.tasks.get(node_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Error message of every failed node, for diagnostics.
    pub fn node_errors(&self) -> BTreeMap<String, String> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| {
                (
                    t.node_id.clone(),
                    t.error_message.clone().unwrap_or_default(),
                )
            })
            .collect()
    }

    /// Count tasks per status.
    pub fn status_counts(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(s), Some(c)) => Some((c - s).num_milliseconds()),
            _ => None,
        }
    }
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Execution began dispatching.
    ExecutionStarted {
        execution_id: ExecutionId,
        node_count: usize,
        at: DateTime<Utc>,
    },
    /// Execution reached a terminal status.
    ExecutionFinished {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    /// A task moved to a new status.
    TaskStatusChanged {
        execution_id: ExecutionId,
        node_id: String,
        status: TaskStatus,
        attempt: u32,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    /// A transient failure will be retried after `delay_ms`.
    TaskRetrying {
        execution_id: ExecutionId,
        node_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
        at: DateTime<Utc>,
    },
    ApprovalRequested {
        execution_id: ExecutionId,
        node_id: String,
        input: Value,
        at: DateTime<Utc>,
    },
    ApprovalResolved {
        execution_id: ExecutionId,
        node_id: String,
        approved: bool,
        at: DateTime<Utc>,
    },
    CancellationRequested {
        execution_id: ExecutionId,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::ExecutionFinished { execution_id, .. }
            | Self::TaskStatusChanged { execution_id, .. }
            | Self::TaskRetrying { execution_id, .. }
            | Self::ApprovalRequested { execution_id, .. }
            | Self::ApprovalResolved { execution_id, .. }
            | Self::CancellationRequested { execution_id, .. } => execution_id,
        }
    }
}
