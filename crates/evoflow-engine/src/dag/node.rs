use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One task in a workflow.
///
/// `input_data` is an opaque payload that may embed placeholders such as
/// `${dependency_fetch}` or `${topic}`; they are resolved right before
/// dispatch, once every dependency has produced its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the workflow.
    pub id: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Registry key of the agent that runs this node.
    pub agent_type: String,
    #[serde(default = "empty_object")]
    pub input_data: Value,
    /// Node ids that must succeed before this node may start.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Overrides for the global `[retry]` settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Per-attempt deadline; falls back to the agent's own default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Wait for an external approve/reject signal instead of running an agent.
    #[serde(default)]
    pub requires_approval: bool,
    /// Expression evaluated against the workflow input; when true the node is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<String>,
    /// Opaque per-node configuration handed to the agent.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub agent_config: Value,
    /// A failure here does not fail the execution; dependents see `null`.
    #[serde(default)]
    pub optional: bool,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Per-node retry overrides. Unset fields inherit from the global config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub initial_backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
}

impl Node {
    /// Create a node with an empty object input and no dependencies.
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            agent_type: agent_type.into(),
            input_data: empty_object(),
            dependencies: BTreeSet::new(),
            retry_policy: None,
            timeout_secs: None,
            requires_approval: false,
            skip_if: None,
            agent_config: Value::Null,
            optional: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input_data = input;
        self
    }

    /// Add one dependency.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Shorthand for a retry policy that only sets `max_attempts`.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        let mut policy = self.retry_policy.take().unwrap_or_default();
        policy.max_attempts = Some(attempts);
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_skip_if(mut self, expr: impl Into<String>) -> Self {
        self.skip_if = Some(expr.into());
        self
    }

    pub fn with_agent_config(mut self, config: Value) -> Self {
        self.agent_config = config;
        self
    }

    pub fn as_optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn is_root(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Name for display, falling back to the id.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}
