use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::{json, Value};

use evoflow_core::error::AgentError;
use evoflow_core::traits::Agent;
use evoflow_core::types::{AgentContext, AgentResult};

/// Sleeps for `duration_ms`, stopping early on cancellation.
pub struct DelayAgent;

fn duration_ms(input: &Value) -> Option<u64> {
    input.get("duration_ms").and_then(|v| v.as_u64())
}

impl Agent for DelayAgent {
    fn agent_type(&self) -> &str {
        "delay"
    }

    fn description(&self) -> &str {
        "Wait for `duration_ms` milliseconds, then pass the input through."
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["timing".into()]
    }

    fn validate_input(&self, input: &Value) -> Result<(), String> {
        match duration_ms(input) {
            Some(_) => Ok(()),
            None => Err("missing non-negative integer field 'duration_ms'".into()),
        }
    }

    fn execute(
        &self,
        input: Value,
        ctx: AgentContext,
    ) -> BoxFuture<'_, Result<AgentResult, AgentError>> {
        Box::pin(async move {
            let ms = duration_ms(&input)
                .ok_or_else(|| AgentError::permanent("missing field 'duration_ms'"))?;
            let start = Instant::now();

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                _ = ctx.cancel.cancelled() => {
                    return Err(AgentError::cancelled("delay cancelled"));
                }
            }

            let slept = start.elapsed().as_millis() as u64;
            Ok(AgentResult::new(json!({ "slept_ms": slept, "input": input })).with_latency_ms(slept))
        })
    }

    fn estimate_cost(&self, _input: &Value) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoflow_core::types::ExecutionId;
    use tokio_util::sync::CancellationToken;

    fn ctx(cancel: CancellationToken) -> AgentContext {
        AgentContext {
            execution_id: ExecutionId::new(),
            node_id: "wait".into(),
            attempt: 1,
            config: Value::Null,
            workflow_input: Value::Null,
            cancel,
        }
    }

    #[test]
    fn test_requires_duration() {
        assert!(DelayAgent.validate_input(&json!({})).is_err());
        assert!(DelayAgent.validate_input(&json!({"duration_ms": -1})).is_err());
        assert!(DelayAgent.validate_input(&json!({"duration_ms": 10})).is_ok());
    }

    #[tokio::test]
    async fn test_sleeps_then_returns() {
        let result = DelayAgent
            .execute(json!({"duration_ms": 5}), ctx(CancellationToken::new()))
            .await
            .unwrap();
        assert!(result.output["slept_ms"].as_u64().unwrap() >= 5);
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = DelayAgent
            .execute(json!({"duration_ms": 60_000}), ctx(cancel))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
