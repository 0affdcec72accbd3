use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvoflowError {
    // Workflow structure errors
    #[error("Invalid DAG: {0}")]
    InvalidDag(DagViolation),

    #[error("Workflow definition parse error: {0}")]
    WorkflowParse(String),

    // Agent errors
    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("Input validation failed for agent {agent_type}: {message}")]
    Validation { agent_type: String, message: String },

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    // Engine invariant violations
    #[error("Unresolved dependency: node '{node_id}' has no stored output")]
    UnresolvedDependency { node_id: String },

    #[error("Duplicate output for node '{node_id}'")]
    DuplicateOutput { node_id: String },

    // Engine facade errors
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution already exists: {0}")]
    ExecutionExists(String),

    #[error("Execution still running: {0}")]
    ExecutionRunning(String),

    #[error("Node not found: {execution_id}/{node_id}")]
    NodeNotFound {
        execution_id: String,
        node_id: String,
    },

    #[error("Node {execution_id}/{node_id} is not awaiting input")]
    NotAwaitingInput {
        execution_id: String,
        node_id: String,
    },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EvoflowError {
    /// Engine bugs rather than user-facing failures.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::UnresolvedDependency { .. } | Self::DuplicateOutput { .. }
        )
    }
}

impl From<DagViolation> for EvoflowError {
    fn from(v: DagViolation) -> Self {
        Self::InvalidDag(v)
    }
}

pub type Result<T> = std::result::Result<T, EvoflowError>;

/// A structural rule broken by a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum DagViolation {
    InvalidId { node: String },
    DuplicateId { node: String },
    DanglingReference { node: String, missing: String },
    Cycle { path: Vec<String> },
    NoRoot,
    UndeclaredReference { node: String, reference: String },
}

impl DagViolation {
    /// Node ids implicated by this violation.
    pub fn nodes(&self) -> Vec<&str> {
        match self {
            Self::InvalidId { node } => vec![node.as_str()],
            Self::DuplicateId { node } => vec![node.as_str()],
            Self::DanglingReference { node, .. } => vec![node.as_str()],
            Self::Cycle { path } => path.iter().map(|s| s.as_str()).collect(),
            Self::NoRoot => vec![],
            Self::UndeclaredReference { node, .. } => vec![node.as_str()],
        }
    }
}

impl fmt::Display for DagViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId { node } => write!(
                f,
                "node id '{}' must be non-empty without '.', '{{', '}}' or whitespace",
                node
            ),
            Self::DuplicateId { node } => write!(f, "duplicate node id '{}'", node),
            Self::DanglingReference { node, missing } => {
                write!(f, "node '{}' depends on unknown node '{}'", node, missing)
            }
            Self::Cycle { path } => write!(f, "cycle detected: {}", path.join(" -> ")),
            Self::NoRoot => write!(f, "no node without dependencies"),
            Self::UndeclaredReference { node, reference } => write!(
                f,
                "node '{}' references output of '{}' which is not among its dependencies",
                node, reference
            ),
        }
    }
}

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
    /// The agent stopped because the execution was halted.
    Cancelled,
}

/// Error returned by an agent's `execute`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct AgentError {
    pub kind: FailureKind,
    pub message: String,
}

impl AgentError {
    /// Retryable failure (timeouts, rate limits, flaky upstreams).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    /// Failure that no amount of retrying will fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    /// The agent gave up because its cancellation token fired.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_lists_path() {
        let v = DagViolation::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(v.to_string(), "cycle detected: a -> b -> a");
        assert_eq!(v.nodes(), vec!["a", "b", "a"]);
    }

    #[test]
    fn test_invalid_dag_error_message() {
        let err = EvoflowError::from(DagViolation::DanglingReference {
            node: "b".into(),
            missing: "zzz".into(),
        });
        assert_eq!(
            err.to_string(),
            "Invalid DAG: node 'b' depends on unknown node 'zzz'"
        );
        assert!(!err.is_internal());
    }

    #[test]
    fn test_internal_errors() {
        assert!(EvoflowError::DuplicateOutput {
            node_id: "a".into()
        }
        .is_internal());
        assert!(EvoflowError::UnresolvedDependency {
            node_id: "a".into()
        }
        .is_internal());
    }

    #[test]
    fn test_agent_error_kinds() {
        assert!(AgentError::transient("rate limited").is_transient());
        assert!(!AgentError::permanent("malformed").is_transient());
        assert_eq!(AgentError::permanent("malformed").to_string(), "malformed");
        let cancelled = AgentError::cancelled("stopped");
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_transient());
    }
}
