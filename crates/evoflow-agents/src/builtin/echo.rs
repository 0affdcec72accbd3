use futures::future::BoxFuture;
use serde_json::Value;

use evoflow_core::error::AgentError;
use evoflow_core::traits::Agent;
use evoflow_core::types::{AgentContext, AgentResult};

/// Returns its resolved input unchanged.
pub struct EchoAgent;

impl Agent for EchoAgent {
    fn agent_type(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the resolved input as output."
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["passthrough".into()]
    }

    fn validate_input(&self, _input: &Value) -> Result<(), String> {
        Ok(())
    }

    fn execute(
        &self,
        input: Value,
        _ctx: AgentContext,
    ) -> BoxFuture<'_, Result<AgentResult, AgentError>> {
        Box::pin(async move { Ok(AgentResult::new(input)) })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoflow_core::types::ExecutionId;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_echoes_input() {
        let ctx = AgentContext {
            execution_id: ExecutionId::new(),
            node_id: "n".into(),
            attempt: 1,
            config: Value::Null,
            workflow_input: Value::Null,
            cancel: CancellationToken::new(),
        };
        let input = serde_json::json!({"text": "hi"});
        let result = EchoAgent.execute(input.clone(), ctx).await.unwrap();
        assert_eq!(result.output, input);
    }
}
