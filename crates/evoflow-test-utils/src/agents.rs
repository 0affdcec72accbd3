use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use evoflow_core::error::AgentError;
use evoflow_core::traits::Agent;
use evoflow_core::types::{AgentContext, AgentResult};

/// Shared, ordered log of `start:<node>` / `end:<node>` entries across agents.
pub type DispatchLog = Arc<Mutex<Vec<String>>>;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Ok(Value),
    Transient(String),
    Permanent(String),
    Panic,
}

/// What a scripted agent saw on one call.
#[derive(Debug, Clone)]
pub struct AgentCall {
    pub node_id: String,
    pub attempt: u32,
    pub input: Value,
    pub config: Value,
}

/// Agent that plays back a fixed sequence of outcomes.
///
/// Once the script runs out every call echoes its input.
pub struct ScriptedAgent {
    agent_type: String,
    steps: Mutex<VecDeque<Step>>,
    calls: Arc<Mutex<Vec<AgentCall>>>,
    delay: Option<Duration>,
    dispatch_log: Option<DispatchLog>,
}

impl ScriptedAgent {
    pub fn new(agent_type: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            steps: Mutex::new(VecDeque::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            dispatch_log: None,
        }
    }

    pub fn then(self, step: Step) -> Self {
        self.steps.lock().unwrap().push_back(step);
        self
    }

    pub fn then_ok(self, output: Value) -> Self {
        self.then(Step::Ok(output))
    }

    pub fn then_transient(self, message: &str) -> Self {
        self.then(Step::Transient(message.to_string()))
    }

    pub fn then_permanent(self, message: &str) -> Self {
        self.then(Step::Permanent(message.to_string()))
    }

    pub fn then_panic(self) -> Self {
        self.then(Step::Panic)
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_dispatch_log(mut self, log: DispatchLog) -> Self {
        self.dispatch_log = Some(log);
        self
    }

    /// Handle on the recorded calls, usable after the agent moved into a registry.
    pub fn call_log(&self) -> Arc<Mutex<Vec<AgentCall>>> {
        self.calls.clone()
    }
}

impl Agent for ScriptedAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn description(&self) -> &str {
        "Scripted test agent"
    }

    fn validate_input(&self, _input: &Value) -> Result<(), String> {
        Ok(())
    }

    fn execute(
        &self,
        input: Value,
        ctx: AgentContext,
    ) -> BoxFuture<'_, Result<AgentResult, AgentError>> {
        Box::pin(async move {
            if let Some(log) = &self.dispatch_log {
                log.lock().unwrap().push(format!("start:{}", ctx.node_id));
            }
            self.calls.lock().unwrap().push(AgentCall {
                node_id: ctx.node_id.clone(),
                attempt: ctx.attempt,
                input: input.clone(),
                config: ctx.config.clone(),
            });

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let step = self.steps.lock().unwrap().pop_front();
            let result = match step {
                Some(Step::Ok(output)) => Ok(AgentResult::new(output).with_tokens(10)),
                Some(Step::Transient(msg)) => Err(AgentError::transient(msg)),
                Some(Step::Permanent(msg)) => Err(AgentError::permanent(msg)),
                Some(Step::Panic) => panic!("scripted panic in {}", ctx.node_id),
                None => Ok(AgentResult::new(input)),
            };

            if let Some(log) = &self.dispatch_log {
                log.lock().unwrap().push(format!("end:{}", ctx.node_id));
            }
            result
        })
    }

    fn estimate_cost(&self, _input: &Value) -> f64 {
        0.25
    }
}

/// Agent that sleeps, tracking how many of its calls overlap.
pub struct SlowAgent {
    agent_type: String,
    duration: Duration,
    honor_cancel: bool,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl SlowAgent {
    pub fn new(agent_type: &str, duration: Duration) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            duration,
            honor_cancel: true,
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Keep sleeping even after the execution is cancelled.
    pub fn ignoring_cancellation(mut self) -> Self {
        self.honor_cancel = false;
        self
    }

    /// Highest number of simultaneous calls observed.
    pub fn peak_concurrency(&self) -> Arc<AtomicUsize> {
        self.peak.clone()
    }

    /// Calls that ran to completion (not cancelled or abandoned).
    pub fn finished(&self) -> Arc<AtomicUsize> {
        self.finished.clone()
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Agent for SlowAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn validate_input(&self, _input: &Value) -> Result<(), String> {
        Ok(())
    }

    fn execute(
        &self,
        _input: Value,
        ctx: AgentContext,
    ) -> BoxFuture<'_, Result<AgentResult, AgentError>> {
        Box::pin(async move {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(self.current.clone());

            if self.honor_cancel {
                tokio::select! {
                    _ = tokio::time::sleep(self.duration) => {}
                    _ = ctx.cancel.cancelled() => {
                        return Err(AgentError::cancelled("cancelled"));
                    }
                }
            } else {
                tokio::time::sleep(self.duration).await;
            }

            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(AgentResult::new(json!({ "node": ctx.node_id })))
        })
    }
}

/// Agent whose input validation always fails. Counts calls to `execute`.
pub struct RejectingAgent {
    agent_type: String,
    executed: Arc<AtomicUsize>,
}

impl RejectingAgent {
    pub fn new(agent_type: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            executed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn executed(&self) -> Arc<AtomicUsize> {
        self.executed.clone()
    }
}

impl Agent for RejectingAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn validate_input(&self, _input: &Value) -> Result<(), String> {
        Err("input rejected by validator".into())
    }

    fn execute(
        &self,
        input: Value,
        _ctx: AgentContext,
    ) -> BoxFuture<'_, Result<AgentResult, AgentError>> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(AgentResult::new(input)) })
    }
}
