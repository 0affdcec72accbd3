use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use evoflow_agents::AgentRegistry;
use evoflow_core::config::AppConfig;
use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::event::EventBus;
use evoflow_core::traits::ExecutionRecorder;
use evoflow_core::types::*;

use crate::approval::{ApprovalBroker, PendingApproval};
use crate::dag::WorkflowDag;
use crate::event_log::EventLogger;
use crate::scheduler::{Scheduler, SchedulerParams, Tracker};

/// Live handle on one submitted execution.
struct ExecutionHandle {
    state: Arc<RwLock<WorkflowExecution>>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    tracker: Tracker,
}

/// Entry point for submitting, observing, and steering workflow executions.
///
/// Each submitted execution gets its own scheduler task; this type only keeps
/// handles to them. Failures inside a run never surface as `Err` here: they
/// are recorded on the execution and observed through [`status`](Self::status).
///
/// Handles stay in memory until [`forget`](Self::forget) or
/// [`prune_finished`](Self::prune_finished) drops them; long-term history
/// belongs in the [`ExecutionRecorder`].
pub struct WorkflowEngine {
    registry: Arc<AgentRegistry>,
    config: Arc<AppConfig>,
    event_bus: Arc<EventBus>,
    broker: Arc<ApprovalBroker>,
    recorder: Option<Arc<dyn ExecutionRecorder>>,
    executions: RwLock<HashMap<ExecutionId, Arc<ExecutionHandle>>>,
    shutdown: CancellationToken,
}

impl WorkflowEngine {
    /// Zero `max_concurrency` or `max_attempts` are raised to 1.
    pub fn new(registry: AgentRegistry, mut config: AppConfig) -> Self {
        if config.engine.max_concurrency == 0 {
            warn!("engine.max_concurrency is 0, using 1");
            config.engine.max_concurrency = 1;
        }
        if config.retry.max_attempts == 0 {
            warn!("retry.max_attempts is 0, using 1");
            config.retry.max_attempts = 1;
        }
        let event_bus = Arc::new(EventBus::default());
        Self {
            registry: Arc::new(registry),
            config: Arc::new(config),
            broker: Arc::new(ApprovalBroker::new(event_bus.clone())),
            event_bus,
            recorder: None,
            executions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Persist every state transition through `recorder`.
    pub fn with_recorder(mut self, recorder: Arc<dyn ExecutionRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Descriptors of every registered agent.
    pub fn agents(&self) -> Vec<AgentInfo> {
        self.registry.describe()
    }

    /// Start a run of `dag` with `input` and return its id immediately.
    ///
    /// An invalid DAG still yields an execution; it is marked `Failed` with
    /// the validation error and no node is dispatched.
    pub async fn submit(&self, dag: WorkflowDag, input: Value) -> Result<ExecutionId> {
        self.submit_with_id(ExecutionId::new(), dag, input).await
    }

    /// Like [`submit`](Self::submit) with a caller-chosen id, so a subscriber
    /// from [`EventBus::subscribe_execution`] can be in place before the run starts.
    pub async fn submit_with_id(
        &self,
        execution_id: ExecutionId,
        dag: WorkflowDag,
        input: Value,
    ) -> Result<ExecutionId> {
        if self.executions.read().await.contains_key(&execution_id) {
            return Err(EvoflowError::ExecutionExists(execution_id.to_string()));
        }
        let validation = dag.validate();

        let mut execution =
            WorkflowExecution::new(execution_id.clone(), dag.name.clone(), input.clone());
        if validation.is_ok() {
            for node in &dag.nodes {
                execution.tasks.insert(
                    node.id.clone(),
                    TaskExecution::new(node.id.clone(), node.agent_type.clone()),
                );
            }
        }

        let state = Arc::new(RwLock::new(execution));
        let cancel = self.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        let tracker = Tracker::new(
            execution_id.clone(),
            state.clone(),
            self.event_bus.clone(),
            self.recorder.clone(),
        );

        self.executions.write().await.insert(
            execution_id.clone(),
            Arc::new(ExecutionHandle {
                state,
                cancel: cancel.clone(),
                done: done_rx,
                tracker: tracker.clone(),
            }),
        );

        if let Some(dir) = self.config.log_dir() {
            EventLogger::new(dir).spawn(&self.event_bus, execution_id.clone(), self.shutdown.clone());
        }

        info!(
            execution_id = %execution_id,
            workflow = dag.name.as_deref().unwrap_or("<unnamed>"),
            nodes = dag.len(),
            "Execution submitted"
        );

        if let Err(e) = validation {
            warn!(execution_id = %execution_id, error = %e, "Workflow rejected");
            let summary = e.to_string();
            tracker
                .update_execution(|x| {
                    x.status = ExecutionStatus::Failed;
                    x.error_summary = Some(summary.clone());
                    x.completed_at = Some(Utc::now());
                })
                .await;
            tracker.publish(EngineEvent::ExecutionFinished {
                execution_id: execution_id.clone(),
                status: ExecutionStatus::Failed,
                error: Some(summary),
                at: Utc::now(),
            });
            let _ = done_tx.send(true);
            return Ok(execution_id);
        }

        let scheduler = Scheduler::new(SchedulerParams {
            execution_id: execution_id.clone(),
            dag,
            workflow_input: input,
            registry: self.registry.clone(),
            broker: self.broker.clone(),
            tracker,
            engine: self.config.engine.clone(),
            retry: self.config.retry.clone(),
            cancel,
            done: done_tx,
        });
        tokio::spawn(scheduler.run());

        Ok(execution_id)
    }

    /// Submit and wait for the terminal state.
    pub async fn run(&self, dag: WorkflowDag, input: Value) -> Result<WorkflowExecution> {
        let id = self.submit(dag, input).await?;
        self.wait(&id).await
    }

    /// Snapshot of an execution and all of its task records.
    pub async fn status(&self, execution_id: &ExecutionId) -> Result<WorkflowExecution> {
        let handle = self.handle(execution_id).await?;
        let snapshot = handle.state.read().await.clone();
        Ok(snapshot)
    }

    /// Snapshot of one task record.
    pub async fn task(&self, execution_id: &ExecutionId, node_id: &str) -> Result<TaskExecution> {
        let handle = self.handle(execution_id).await?;
        let state = handle.state.read().await;
        state
            .tasks
            .get(node_id)
            .cloned()
            .ok_or_else(|| EvoflowError::NodeNotFound {
                execution_id: execution_id.to_string(),
                node_id: node_id.to_string(),
            })
    }

    /// Request cancellation. Returns false when the execution already ended
    /// or was already asked to stop. The final state arrives asynchronously.
    pub async fn cancel(&self, execution_id: &ExecutionId) -> Result<bool> {
        let handle = self.handle(execution_id).await?;
        if *handle.done.borrow() || handle.cancel.is_cancelled() {
            return Ok(false);
        }
        info!(execution_id = %execution_id, "Cancellation requested");
        handle.tracker.publish(EngineEvent::CancellationRequested {
            execution_id: execution_id.clone(),
            at: Utc::now(),
        });
        handle.cancel.cancel();
        Ok(true)
    }

    /// Deliver an approve/reject decision to a node awaiting input.
    pub async fn resume(
        &self,
        execution_id: &ExecutionId,
        node_id: &str,
        signal: ResumeSignal,
    ) -> Result<()> {
        let handle = self.handle(execution_id).await?;
        if !handle.state.read().await.tasks.contains_key(node_id) {
            return Err(EvoflowError::NodeNotFound {
                execution_id: execution_id.to_string(),
                node_id: node_id.to_string(),
            });
        }
        if self.broker.respond(execution_id, node_id, signal).await {
            Ok(())
        } else {
            Err(EvoflowError::NotAwaitingInput {
                execution_id: execution_id.to_string(),
                node_id: node_id.to_string(),
            })
        }
    }

    /// Nodes of an execution currently awaiting a decision.
    pub async fn pending_approvals(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<PendingApproval>> {
        self.handle(execution_id).await?;
        Ok(self.broker.pending(execution_id).await)
    }

    /// Wait until the execution reaches a terminal state and return it.
    pub async fn wait(&self, execution_id: &ExecutionId) -> Result<WorkflowExecution> {
        let handle = self.handle(execution_id).await?;
        let mut done = handle.done.clone();
        // An error means the scheduler is gone; whatever it recorded is final.
        let _ = done.wait_for(|finished| *finished).await;
        let snapshot = handle.state.read().await.clone();
        Ok(snapshot)
    }

    /// Ids of every execution this engine has seen.
    pub async fn executions(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<ExecutionId> = self.executions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop the handle of a finished execution and return its final state.
    pub async fn forget(&self, execution_id: &ExecutionId) -> Result<WorkflowExecution> {
        let mut executions = self.executions.write().await;
        let handle = executions
            .get(execution_id)
            .cloned()
            .ok_or_else(|| EvoflowError::ExecutionNotFound(execution_id.to_string()))?;
        if !*handle.done.borrow() {
            return Err(EvoflowError::ExecutionRunning(execution_id.to_string()));
        }
        executions.remove(execution_id);
        let snapshot = handle.state.read().await.clone();
        Ok(snapshot)
    }

    /// Drop the handles of every finished execution. Returns how many went.
    pub async fn prune_finished(&self) -> usize {
        let mut executions = self.executions.write().await;
        let before = executions.len();
        executions.retain(|_, handle| !*handle.done.borrow());
        let pruned = before - executions.len();
        if pruned > 0 {
            debug!(pruned, remaining = executions.len(), "Pruned finished executions");
        }
        pruned
    }

    /// Cancel every running execution and stop event loggers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn handle(&self, execution_id: &ExecutionId) -> Result<Arc<ExecutionHandle>> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| EvoflowError::ExecutionNotFound(execution_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use evoflow_core::config::FailurePolicy;
    use evoflow_test_utils::{MemoryRecorder, ScriptedAgent, SlowAgent};
    use serde_json::json;

    use crate::dag::Node;

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 5;
        config.retry.jitter = false;
        config
    }

    fn engine_with(agents: Vec<ScriptedAgent>, config: AppConfig) -> WorkflowEngine {
        let mut registry = AgentRegistry::with_builtins();
        for agent in agents {
            registry.register(agent);
        }
        WorkflowEngine::new(registry, config)
    }

    #[tokio::test]
    async fn test_dependency_output_flows_downstream() {
        let engine = engine_with(vec![], fast_config());
        let dag = WorkflowDag::new(vec![
            Node::new("a", "echo").with_input(json!({"text": "${topic}"})),
            Node::new("b", "echo")
                .depends_on("a")
                .with_input(json!({"upstream": "${dependency_a.text}"})),
        ]);

        let exec = engine.run(dag, json!({"topic": "dags"})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Succeeded);

        let a = exec.task("a").unwrap();
        let b = exec.task("b").unwrap();
        assert!(a.completed_at.unwrap() <= b.started_at.unwrap());
        assert_eq!(b.input_data.as_ref().unwrap()["upstream"], json!("dags"));
        assert_eq!(
            b.input_data.as_ref().unwrap()["dependency_a"],
            json!({"text": "dags"})
        );
        assert_eq!(exec.output_data.unwrap()["a"], json!({"text": "dags"}));
    }

    #[tokio::test]
    async fn test_invalid_dag_fails_without_dispatch() {
        let agent = ScriptedAgent::new("scripted");
        let calls = agent.call_log();
        let engine = engine_with(vec![agent], fast_config());
        let dag = WorkflowDag::new(vec![
            Node::new("a", "scripted").depends_on("b"),
            Node::new("b", "scripted").depends_on("a"),
        ]);

        let exec = engine.run(dag, Value::Null).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.error_summary.unwrap().contains("cycle detected"));
        assert!(exec.tasks.is_empty());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let agent = ScriptedAgent::new("flaky")
            .then_transient("rate limited")
            .then_transient("rate limited")
            .then_ok(json!("done"));
        let engine = engine_with(vec![agent], fast_config());
        let dag = WorkflowDag::new(vec![Node::new("a", "flaky").with_max_attempts(3)]);

        let exec = engine.run(dag, Value::Null).await.unwrap();
        let task = exec.task("a").unwrap();
        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempt_count, 3);
        assert_eq!(task.output_data, Some(json!("done")));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let agent = ScriptedAgent::new("strict").then_permanent("malformed");
        let engine = engine_with(vec![agent], fast_config());
        let dag = WorkflowDag::new(vec![Node::new("a", "strict").with_max_attempts(5)]);

        let exec = engine.run(dag, Value::Null).await.unwrap();
        let task = exec.task("a").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 1);
        assert_eq!(exec.failed_node.as_deref(), Some("a"));
        assert_eq!(exec.error_summary.as_deref(), Some("node 'a' failed: malformed"));
    }

    #[tokio::test]
    async fn test_unknown_agent_type_fails_node() {
        let engine = engine_with(vec![], fast_config());
        let dag = WorkflowDag::new(vec![Node::new("a", "web_search")]);

        let exec = engine.run(dag, Value::Null).await.unwrap();
        let task = exec.task("a").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 0);
        assert!(task.error_message.as_ref().unwrap().contains("Unknown agent type"));
    }

    #[tokio::test]
    async fn test_validation_failure_consumes_no_attempt() {
        let engine = engine_with(vec![], fast_config());
        let dag = WorkflowDag::new(vec![Node::new("wait", "delay").with_input(json!({}))]);

        let exec = engine.run(dag, Value::Null).await.unwrap();
        let task = exec.task("wait").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 0);
        assert!(task.error_message.as_ref().unwrap().contains("duration_ms"));
    }

    #[tokio::test]
    async fn test_skip_if_satisfies_dependents() {
        let engine = engine_with(vec![], fast_config());
        let dag = WorkflowDag::new(vec![
            Node::new("notify", "echo").with_skip_if(r#"mode == "dry_run""#),
            Node::new("report", "echo").depends_on("notify"),
        ]);

        let exec = engine.run(dag, json!({"mode": "dry_run"})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert_eq!(exec.task("notify").unwrap().status, TaskStatus::Skipped);
        let report = exec.task("report").unwrap();
        assert_eq!(report.status, TaskStatus::Succeeded);
        assert_eq!(report.output_data, Some(json!({"dependency_notify": null})));
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let slow = SlowAgent::new("slow", Duration::from_millis(50));
        let peak = slow.peak_concurrency();
        let mut registry = AgentRegistry::new();
        registry.register(slow);
        let mut config = fast_config();
        config.engine.max_concurrency = 2;
        let engine = WorkflowEngine::new(registry, config);

        let nodes: Vec<Node> = (0..6).map(|i| Node::new(format!("n{}", i), "slow")).collect();
        let exec = engine.run(WorkflowDag::new(nodes), Value::Null).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_best_effort_runs_independent_branches() {
        let bad = ScriptedAgent::new("bad").then_permanent("boom");
        let mut config = fast_config();
        config.engine.failure_policy = FailurePolicy::BestEffort;
        let engine = engine_with(vec![bad], config);
        let dag = WorkflowDag::new(vec![
            Node::new("a", "bad"),
            Node::new("b", "echo").depends_on("a"),
            Node::new("c", "echo").depends_on("b"),
            Node::new("x", "echo"),
            Node::new("y", "echo").depends_on("x"),
        ]);

        let exec = engine.run(dag, Value::Null).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        for id in ["b", "c"] {
            let t = exec.task(id).unwrap();
            assert_eq!(t.status, TaskStatus::Failed);
            assert_eq!(t.attempt_count, 0);
            assert!(t
                .error_message
                .as_ref()
                .unwrap()
                .starts_with("blocked by dependency failure"));
        }
        assert_eq!(exec.task("y").unwrap().status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_recorder_sees_terminal_states() {
        let recorder = Arc::new(MemoryRecorder::new());
        let engine =
            engine_with(vec![], fast_config()).with_recorder(recorder.clone());
        let dag = WorkflowDag::new(vec![Node::new("a", "echo"), Node::new("b", "echo").depends_on("a")]);

        let exec = engine.run(dag, Value::Null).await.unwrap();
        let recorded = recorder.execution(&exec.execution_id).unwrap();
        assert_eq!(recorded.status, ExecutionStatus::Succeeded);
        let statuses = recorder.task_statuses(&exec.execution_id, "b");
        assert_eq!(statuses.first(), Some(&TaskStatus::Ready));
        assert_eq!(statuses.last(), Some(&TaskStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let engine = engine_with(vec![], fast_config());
        let id = ExecutionId::from_string("missing");
        assert!(matches!(
            engine.status(&id).await,
            Err(EvoflowError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            engine.cancel(&id).await,
            Err(EvoflowError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_after_finish_is_noop() {
        let engine = engine_with(vec![], fast_config());
        let exec = engine
            .run(WorkflowDag::new(vec![Node::new("a", "echo")]), Value::Null)
            .await
            .unwrap();
        assert!(!engine.cancel(&exec.execution_id).await.unwrap());
        assert_eq!(
            engine.status(&exec.execution_id).await.unwrap().status,
            ExecutionStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_resume_rejects_node_not_waiting() {
        let engine = engine_with(vec![], fast_config());
        let exec = engine
            .run(WorkflowDag::new(vec![Node::new("a", "echo")]), Value::Null)
            .await
            .unwrap();
        let err = engine
            .resume(
                &exec.execution_id,
                "a",
                ResumeSignal::Approve { payload: Value::Null },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EvoflowError::NotAwaitingInput { .. }));

        let err = engine
            .resume(
                &exec.execution_id,
                "zzz",
                ResumeSignal::Approve { payload: Value::Null },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EvoflowError::NodeNotFound { .. }));
    }

    #[tokio::test]
    async fn test_empty_workflow_succeeds() {
        let engine = engine_with(vec![], fast_config());
        let exec = engine.run(WorkflowDag::default(), json!({})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert_eq!(exec.output_data, Some(json!({})));
    }

    #[tokio::test]
    async fn test_event_log_written_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        config.engine.workspace = dir.path().display().to_string();
        config.log = Some(evoflow_core::config::LogConfig {
            enabled: true,
            log_dir: None,
        });
        let engine = engine_with(vec![], config);

        let exec = engine
            .run(WorkflowDag::new(vec![Node::new("a", "echo")]), Value::Null)
            .await
            .unwrap();

        let path = dir
            .path()
            .join("logs")
            .join(format!("{}.jsonl", exec.execution_id));
        let mut content = String::new();
        for _ in 0..50 {
            content = std::fs::read_to_string(&path).unwrap_or_default();
            if content.contains("execution_finished") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(content.lines().next().unwrap().contains("execution_started"));
        assert!(content.contains("execution_finished"));
    }

    #[tokio::test]
    async fn test_failure_after_halt_still_blocks_dependents() {
        let bad = ScriptedAgent::new("bad").then_permanent("boom");
        let late = ScriptedAgent::new("late")
            .with_delay(Duration::from_millis(100))
            .then_permanent("real failure");
        let engine = engine_with(vec![bad, late], fast_config());
        let dag = WorkflowDag::new(vec![
            Node::new("a", "bad"),
            Node::new("b", "late"),
            Node::new("c", "echo").depends_on("b"),
        ]);

        let exec = engine.run(dag, Value::Null).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.failed_node.as_deref(), Some("a"));

        let b = exec.task("b").unwrap();
        assert_eq!(b.status, TaskStatus::Failed);
        assert_eq!(b.error_message.as_deref(), Some("real failure"));
        let c = exec.task("c").unwrap();
        assert_eq!(c.status, TaskStatus::Failed);
        assert_eq!(
            c.error_message.as_deref(),
            Some("blocked by dependency failure: b")
        );
    }

    #[tokio::test]
    async fn test_optional_failure_does_not_fail_execution() {
        let flaky = ScriptedAgent::new("flaky").then_permanent("unavailable");
        let engine = engine_with(vec![flaky], fast_config());
        let dag = WorkflowDag::new(vec![
            Node::new("enrich", "flaky").as_optional(),
            Node::new("report", "echo")
                .depends_on("enrich")
                .with_input(json!({"extra": "${dependency_enrich}"})),
            Node::new("other", "echo"),
        ]);

        let exec = engine.run(dag, Value::Null).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert!(exec.failed_node.is_none());
        assert!(exec.error_summary.is_none());

        let enrich = exec.task("enrich").unwrap();
        assert_eq!(enrich.status, TaskStatus::Failed);
        assert_eq!(enrich.error_message.as_deref(), Some("unavailable"));
        let report = exec.task("report").unwrap();
        assert_eq!(report.status, TaskStatus::Succeeded);
        assert_eq!(report.output_data.as_ref().unwrap()["extra"], Value::Null);
        assert_eq!(exec.task("other").unwrap().status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_raised_to_one() {
        let mut config = fast_config();
        config.engine.max_concurrency = 0;
        config.retry.max_attempts = 0;
        let engine = engine_with(vec![], config);
        assert_eq!(engine.config().engine.max_concurrency, 1);
        assert_eq!(engine.config().retry.max_attempts, 1);

        let dag = WorkflowDag::new(vec![Node::new("a", "echo"), Node::new("b", "echo")]);
        let exec = tokio::time::timeout(Duration::from_secs(5), engine.run(dag, Value::Null))
            .await
            .expect("execution finishes")
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_submit_with_id_streams_own_events() {
        let engine = engine_with(vec![], fast_config());
        let id = ExecutionId::from_string("chosen");
        let mut events = engine.event_bus().subscribe_execution(id.clone());

        let dag = WorkflowDag::new(vec![Node::new("a", "echo")]);
        engine.submit_with_id(id.clone(), dag.clone(), Value::Null).await.unwrap();
        assert!(matches!(
            engine.submit_with_id(id.clone(), dag, Value::Null).await,
            Err(EvoflowError::ExecutionExists(_))
        ));

        let mut kinds = Vec::new();
        while let Some(event) = events.recv().await {
            kinds.push(event);
        }
        assert!(matches!(kinds.first(), Some(EngineEvent::ExecutionStarted { .. })));
        assert!(matches!(
            kinds.last(),
            Some(EngineEvent::ExecutionFinished {
                status: ExecutionStatus::Succeeded,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_forget_and_prune_finished() {
        let slow = SlowAgent::new("slow", Duration::from_secs(30));
        let mut registry = AgentRegistry::with_builtins();
        registry.register(slow);
        let engine = WorkflowEngine::new(registry, fast_config());

        let first = engine
            .run(WorkflowDag::new(vec![Node::new("a", "echo")]), Value::Null)
            .await
            .unwrap();
        let second = engine
            .run(WorkflowDag::new(vec![Node::new("a", "echo")]), Value::Null)
            .await
            .unwrap();
        let running = engine
            .submit(WorkflowDag::new(vec![Node::new("a", "slow")]), Value::Null)
            .await
            .unwrap();

        assert!(matches!(
            engine.forget(&running).await,
            Err(EvoflowError::ExecutionRunning(_))
        ));

        let forgotten = engine.forget(&first.execution_id).await.unwrap();
        assert_eq!(forgotten.status, ExecutionStatus::Succeeded);
        assert!(matches!(
            engine.status(&first.execution_id).await,
            Err(EvoflowError::ExecutionNotFound(_))
        ));

        assert_eq!(engine.prune_finished().await, 1);
        assert_eq!(engine.executions().await, vec![running.clone()]);
        assert!(matches!(
            engine.status(&second.execution_id).await,
            Err(EvoflowError::ExecutionNotFound(_))
        ));

        engine.cancel(&running).await.unwrap();
        let cancelled = engine.wait(&running).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    }
}
