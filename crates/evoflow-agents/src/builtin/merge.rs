use futures::future::BoxFuture;
use serde_json::{Map, Value};

use evoflow_core::error::AgentError;
use evoflow_core::traits::Agent;
use evoflow_core::types::{AgentContext, AgentResult};

/// Shallow-merges the object values of its input into one object.
///
/// Given `{"a": {"x": 1}, "b": {"y": 2}}` the output is `{"x": 1, "y": 2}`.
/// Later keys (in key order) win on conflict. Non-object values are kept
/// under their own key.
pub struct MergeAgent;

impl Agent for MergeAgent {
    fn agent_type(&self) -> &str {
        "merge"
    }

    fn description(&self) -> &str {
        "Shallow-merge object inputs (typically dependency outputs) into one object."
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["aggregation".into()]
    }

    fn validate_input(&self, input: &Value) -> Result<(), String> {
        if input.is_object() {
            Ok(())
        } else {
            Err("merge input must be a JSON object".into())
        }
    }

    fn execute(
        &self,
        input: Value,
        _ctx: AgentContext,
    ) -> BoxFuture<'_, Result<AgentResult, AgentError>> {
        Box::pin(async move {
            let Value::Object(fields) = input else {
                return Err(AgentError::permanent("merge input must be a JSON object"));
            };

            let mut merged = Map::new();
            for (key, value) in fields {
                match value {
                    Value::Object(inner) => merged.extend(inner),
                    other => {
                        merged.insert(key, other);
                    }
                }
            }
            Ok(AgentResult::new(Value::Object(merged)))
        })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }
}
