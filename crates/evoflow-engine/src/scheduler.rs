//! Per-execution scheduler.
//!
//! One [`Scheduler`] task owns the mutable state of one execution: the
//! [`ContextStore`], the ready queue, and the remaining-dependency counters.
//! Agent attempts and approval waits run as independent tasks in a `JoinSet`
//! and report back a [`Outcome`]; every state transition goes through the
//! [`Tracker`], which updates the shared record, publishes an event, and
//! hands the new state to the recorder.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use evoflow_agents::AgentRegistry;
use evoflow_core::config::{EngineConfig, FailurePolicy, RetryConfig};
use evoflow_core::error::{AgentError, EvoflowError};
use evoflow_core::event::EventBus;
use evoflow_core::traits::{Agent, ExecutionRecorder};
use evoflow_core::types::*;

use crate::approval::ApprovalBroker;
use crate::context::ContextStore;
use crate::dag::condition::evaluate_condition;
use crate::dag::{Node, WorkflowDag};
use crate::retry::EffectiveRetry;

/// Applies state transitions to the shared execution record.
#[derive(Clone)]
pub(crate) struct Tracker {
    execution_id: ExecutionId,
    state: Arc<RwLock<WorkflowExecution>>,
    event_bus: Arc<EventBus>,
    recorder: Option<Arc<dyn ExecutionRecorder>>,
}

impl Tracker {
    pub(crate) fn new(
        execution_id: ExecutionId,
        state: Arc<RwLock<WorkflowExecution>>,
        event_bus: Arc<EventBus>,
        recorder: Option<Arc<dyn ExecutionRecorder>>,
    ) -> Self {
        Self {
            execution_id,
            state,
            event_bus,
            recorder,
        }
    }

    pub(crate) fn publish(&self, event: EngineEvent) {
        self.event_bus.publish(event);
    }

    /// Mutate one task record. Publishes `TaskStatusChanged` when the status moved.
    pub(crate) async fn update_task<F>(&self, node_id: &str, f: F)
    where
        F: FnOnce(&mut TaskExecution),
    {
        let (before, task) = {
            let mut state = self.state.write().await;
            let Some(task) = state.tasks.get_mut(node_id) else {
                warn!(execution_id = %self.execution_id, node_id, "Update for unknown task ignored");
                return;
            };
            let before = task.status;
            f(task);
            (before, task.clone())
        };

        if before != task.status {
            let error = match task.status {
                TaskStatus::Failed | TaskStatus::Retrying | TaskStatus::Cancelled => {
                    task.error_message.clone()
                }
                _ => None,
            };
            self.publish(EngineEvent::TaskStatusChanged {
                execution_id: self.execution_id.clone(),
                node_id: node_id.to_string(),
                status: task.status,
                attempt: task.attempt_count,
                error,
                at: Utc::now(),
            });
        }

        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.record_task(&self.execution_id, &task).await {
                warn!(execution_id = %self.execution_id, node_id, error = %e, "Failed to record task");
            }
        }
    }

    pub(crate) async fn set_status(&self, node_id: &str, status: TaskStatus) {
        self.update_task(node_id, |t| t.status = status).await;
    }

    /// Mutate the execution-level record.
    pub(crate) async fn update_execution<F>(&self, f: F)
    where
        F: FnOnce(&mut WorkflowExecution),
    {
        let snapshot = {
            let mut state = self.state.write().await;
            f(&mut state);
            state.clone()
        };
        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.record_execution(&snapshot).await {
                warn!(execution_id = %self.execution_id, error = %e, "Failed to record execution");
            }
        }
    }

    pub(crate) async fn task_status(&self, node_id: &str) -> Option<TaskStatus> {
        self.state.read().await.tasks.get(node_id).map(|t| t.status)
    }
}

/// How a node task ended, reported back to the scheduler loop.
#[derive(Debug)]
enum Outcome {
    Succeeded {
        node_id: String,
        result: AgentResult,
        elapsed_ms: u64,
    },
    Failed {
        node_id: String,
        error: String,
        elapsed_ms: u64,
        /// The agent stopped because the execution was halted.
        cancelled: bool,
    },
    Approved {
        node_id: String,
        payload: Value,
    },
    Rejected {
        node_id: String,
        reason: String,
    },
    /// Approval wait ended because the execution stopped.
    Abandoned { node_id: String },
}

/// Why a node ended `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureCause {
    Error,
    Rejection,
    Cancellation,
}

/// Everything a scheduler needs from the engine.
pub(crate) struct SchedulerParams {
    pub execution_id: ExecutionId,
    pub dag: WorkflowDag,
    pub workflow_input: Value,
    pub registry: Arc<AgentRegistry>,
    pub broker: Arc<ApprovalBroker>,
    pub tracker: Tracker,
    pub engine: EngineConfig,
    pub retry: RetryConfig,
    pub cancel: CancellationToken,
    pub done: watch::Sender<bool>,
}

pub(crate) struct Scheduler {
    execution_id: ExecutionId,
    nodes: BTreeMap<String, Node>,
    dependents: BTreeMap<String, Vec<String>>,
    workflow_input: Value,
    registry: Arc<AgentRegistry>,
    broker: Arc<ApprovalBroker>,
    tracker: Tracker,
    engine: EngineConfig,
    retry: RetryConfig,
    /// External cancellation request.
    cancel: CancellationToken,
    /// Stops dispatching and signals in-flight agents. Child of `cancel`.
    halt: CancellationToken,
    done: watch::Sender<bool>,

    store: ContextStore,
    remaining: BTreeMap<String, usize>,
    ready: VecDeque<String>,
    running: usize,
    joins: JoinSet<Outcome>,
    first_failure: Option<(String, String)>,
    internal_error: Option<String>,
}

impl Scheduler {
    pub(crate) fn new(params: SchedulerParams) -> Self {
        let dependents = params
            .dag
            .dependents()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.into_iter().map(str::to_string).collect()))
            .collect();
        let remaining = params
            .dag
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.dependencies.len()))
            .collect();
        let nodes = params
            .dag
            .nodes
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        let halt = params.cancel.child_token();

        Self {
            execution_id: params.execution_id,
            nodes,
            dependents,
            workflow_input: params.workflow_input,
            registry: params.registry,
            broker: params.broker,
            tracker: params.tracker,
            engine: params.engine,
            retry: params.retry,
            cancel: params.cancel,
            halt,
            done: params.done,
            store: ContextStore::new(),
            remaining,
            ready: VecDeque::new(),
            running: 0,
            joins: JoinSet::new(),
            first_failure: None,
            internal_error: None,
        }
    }

    /// Drive the execution to a terminal state.
    pub(crate) async fn run(mut self) {
        let node_count = self.nodes.len();
        self.tracker
            .update_execution(|e| {
                e.status = ExecutionStatus::Running;
                e.started_at = Some(Utc::now());
            })
            .await;
        self.tracker.publish(EngineEvent::ExecutionStarted {
            execution_id: self.execution_id.clone(),
            node_count,
            at: Utc::now(),
        });
        info!(execution_id = %self.execution_id, nodes = node_count, "Execution started");

        let roots: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.is_root())
            .map(|n| n.id.clone())
            .collect();
        self.enqueue(roots).await;

        loop {
            self.dispatch_ready().await;

            if self.joins.is_empty() {
                if self.ready.is_empty() || self.halt.is_cancelled() {
                    break;
                }
                continue;
            }

            match self.joins.join_next().await {
                Some(Ok(outcome)) => self.handle_outcome(outcome).await,
                Some(Err(e)) => {
                    self.abort_internal(format!("node task aborted: {}", e));
                }
                None => {}
            }
        }

        self.finish().await;
    }

    /// Start queued nodes in FIFO order until the queue empties or every
    /// running slot is taken. Approval waits and skips do not take a slot.
    async fn dispatch_ready(&mut self) {
        while !self.halt.is_cancelled() {
            let Some(node_id) = self.ready.front().cloned() else {
                break;
            };
            let Some(node) = self.nodes.get(&node_id).cloned() else {
                self.ready.pop_front();
                continue;
            };

            let skip = node
                .skip_if
                .as_deref()
                .is_some_and(|expr| evaluate_condition(expr, &self.workflow_input));
            let needs_slot = !skip && !node.requires_approval;
            if needs_slot && self.running >= self.engine.max_concurrency {
                break;
            }
            self.ready.pop_front();

            if skip {
                self.skip(&node).await;
            } else if node.requires_approval {
                self.await_approval(&node).await;
            } else {
                self.start_agent(&node).await;
            }
        }
    }

    async fn skip(&mut self, node: &Node) {
        debug!(execution_id = %self.execution_id, node_id = %node.id, "Skip condition matched");
        if let Err(e) = self.store.set(node.id.clone(), Value::Null) {
            self.abort_internal(e.to_string());
            return;
        }
        self.tracker
            .update_task(&node.id, |t| {
                t.status = TaskStatus::Skipped;
                t.output_data = Some(Value::Null);
                t.completed_at = Some(Utc::now());
            })
            .await;
        self.release_dependents(&node.id).await;
    }

    async fn await_approval(&mut self, node: &Node) {
        let input = match self.resolve_input(node) {
            Ok(input) => input,
            Err(e) => {
                self.abort_internal(e.to_string());
                return;
            }
        };

        self.tracker
            .update_task(&node.id, |t| {
                t.status = TaskStatus::AwaitingInput;
                t.input_data = Some(input.clone());
                t.started_at = Some(Utc::now());
            })
            .await;
        info!(execution_id = %self.execution_id, node_id = %node.id, "Node awaiting approval");

        let rx = self.broker.request(&self.execution_id, &node.id, input).await;
        let broker = self.broker.clone();
        let halt = self.halt.clone();
        let execution_id = self.execution_id.clone();
        let node_id = node.id.clone();

        self.joins.spawn(async move {
            tokio::select! {
                signal = rx => match signal {
                    Ok(ResumeSignal::Approve { payload }) => Outcome::Approved { node_id, payload },
                    Ok(ResumeSignal::Reject { reason }) => Outcome::Rejected { node_id, reason },
                    Err(_) => Outcome::Abandoned { node_id },
                },
                _ = halt.cancelled() => {
                    broker.withdraw(&execution_id, &node_id).await;
                    Outcome::Abandoned { node_id }
                }
            }
        });
    }

    async fn start_agent(&mut self, node: &Node) {
        let Some(agent) = self.registry.get(&node.agent_type) else {
            let error = EvoflowError::UnknownAgentType(node.agent_type.clone()).to_string();
            self.fail_node(&node.id, error, FailureCause::Error).await;
            return;
        };

        let input = match self.resolve_input(node) {
            Ok(input) => input,
            Err(e) => {
                self.abort_internal(e.to_string());
                return;
            }
        };

        if let Err(message) = agent.validate_input(&input) {
            let error = EvoflowError::Validation {
                agent_type: node.agent_type.clone(),
                message,
            }
            .to_string();
            self.tracker
                .update_task(&node.id, |t| t.input_data = Some(input.clone()))
                .await;
            self.fail_node(&node.id, error, FailureCause::Error).await;
            return;
        }

        let cost = agent.estimate_cost(&input);
        let deadline_secs = node
            .timeout_secs
            .or(self.engine.default_timeout_secs)
            .unwrap_or_else(|| agent.timeout_secs());
        self.tracker
            .update_task(&node.id, |t| {
                t.input_data = Some(input.clone());
                t.cost_estimate = Some(cost);
            })
            .await;

        let run = NodeRun {
            execution_id: self.execution_id.clone(),
            node_id: node.id.clone(),
            agent,
            input,
            agent_config: node.agent_config.clone(),
            workflow_input: self.workflow_input.clone(),
            retry: EffectiveRetry::merge(&self.retry, node.retry_policy.as_ref()),
            deadline: Duration::from_secs(deadline_secs),
            tracker: self.tracker.clone(),
            halt: self.halt.clone(),
        };
        self.running += 1;
        debug!(
            execution_id = %self.execution_id,
            node_id = %node.id,
            agent_type = %node.agent_type,
            running = self.running,
            "Node dispatched"
        );
        self.joins.spawn(run.execute());
    }

    fn resolve_input(&self, node: &Node) -> evoflow_core::Result<Value> {
        self.store
            .resolve_for_node(&node.input_data, &node.dependencies, &self.workflow_input)
    }

    async fn handle_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded {
                node_id,
                result,
                elapsed_ms,
            } => {
                self.running = self.running.saturating_sub(1);
                if let Err(e) = self.store.set(node_id.clone(), result.output.clone()) {
                    self.abort_internal(e.to_string());
                    return;
                }
                let metadata =
                    (result.metadata != AgentMetadata::default()).then_some(result.metadata);
                self.tracker
                    .update_task(&node_id, |t| {
                        t.status = TaskStatus::Succeeded;
                        t.output_data = Some(result.output);
                        t.metadata = metadata;
                        t.error_message = None;
                        t.elapsed_ms = Some(elapsed_ms);
                        t.completed_at = Some(Utc::now());
                    })
                    .await;
                info!(execution_id = %self.execution_id, node_id = %node_id, elapsed_ms, "Node succeeded");
                self.release_dependents(&node_id).await;
            }
            Outcome::Failed {
                node_id,
                error,
                elapsed_ms,
                cancelled,
            } => {
                self.running = self.running.saturating_sub(1);
                self.tracker
                    .update_task(&node_id, |t| t.elapsed_ms = Some(elapsed_ms))
                    .await;
                let cause = if cancelled {
                    FailureCause::Cancellation
                } else {
                    FailureCause::Error
                };
                self.fail_node(&node_id, error, cause).await;
            }
            Outcome::Approved { node_id, payload } => {
                if let Err(e) = self.store.set(node_id.clone(), payload.clone()) {
                    self.abort_internal(e.to_string());
                    return;
                }
                self.tracker
                    .update_task(&node_id, |t| {
                        t.status = TaskStatus::Succeeded;
                        t.output_data = Some(payload);
                        t.completed_at = Some(Utc::now());
                    })
                    .await;
                info!(execution_id = %self.execution_id, node_id = %node_id, "Node approved");
                self.release_dependents(&node_id).await;
            }
            Outcome::Rejected { node_id, reason } => {
                info!(execution_id = %self.execution_id, node_id = %node_id, reason = %reason, "Node rejected");
                self.fail_node(
                    &node_id,
                    format!("rejected: {}", reason),
                    FailureCause::Rejection,
                )
                .await;
            }
            Outcome::Abandoned { node_id } => {
                self.tracker
                    .update_task(&node_id, |t| {
                        t.status = TaskStatus::Cancelled;
                        t.error_message = Some("cancelled while awaiting input".into());
                        t.completed_at = Some(Utc::now());
                    })
                    .await;
            }
        }
    }

    /// Mark a node failed and every transitive dependent blocked.
    ///
    /// A failure caused by a halt leaves dependents for `finish` to mark
    /// cancelled. An optional node's failure stores `null` and releases its
    /// dependents instead. Only errors on required nodes trigger fail-fast.
    async fn fail_node(&mut self, node_id: &str, error: String, cause: FailureCause) {
        warn!(execution_id = %self.execution_id, node_id, error = %error, "Node failed");
        self.tracker
            .update_task(node_id, |t| {
                t.status = TaskStatus::Failed;
                t.error_message = Some(error.clone());
                t.completed_at = Some(Utc::now());
            })
            .await;

        let halted = self.halt.is_cancelled();
        if cause == FailureCause::Cancellation && halted {
            if self.first_failure.is_none() {
                self.first_failure = Some((node_id.to_string(), error));
            }
            return;
        }

        let optional = self.nodes.get(node_id).is_some_and(|n| n.optional);
        if optional {
            info!(execution_id = %self.execution_id, node_id, "Optional node failed, continuing");
            if let Err(e) = self.store.set(node_id.to_string(), Value::Null) {
                self.abort_internal(e.to_string());
                return;
            }
            self.release_dependents(node_id).await;
            return;
        }

        if self.first_failure.is_none() {
            self.first_failure = Some((node_id.to_string(), error));
        }

        let reason = format!("blocked by dependency failure: {}", node_id);
        let mut stack: Vec<String> = self.dependents.get(node_id).cloned().unwrap_or_default();
        let mut seen = HashSet::new();
        while let Some(child) = stack.pop() {
            if !seen.insert(child.clone()) {
                continue;
            }
            if matches!(
                self.tracker.task_status(&child).await,
                Some(TaskStatus::Pending | TaskStatus::Ready)
            ) {
                self.tracker
                    .update_task(&child, |t| {
                        t.status = TaskStatus::Failed;
                        t.error_message = Some(reason.clone());
                        t.completed_at = Some(Utc::now());
                    })
                    .await;
                self.ready.retain(|id| id != &child);
            }
            if let Some(next) = self.dependents.get(&child) {
                stack.extend(next.iter().cloned());
            }
        }

        if cause == FailureCause::Error
            && self.engine.failure_policy == FailurePolicy::FailFast
            && !halted
        {
            warn!(execution_id = %self.execution_id, node_id, "Fail-fast: halting execution");
            self.halt.cancel();
        }
    }

    /// Count down the dependents of a completed node and queue the ones now ready.
    async fn release_dependents(&mut self, node_id: &str) {
        if self.halt.is_cancelled() {
            return;
        }
        let mut newly_ready = Vec::new();
        for child in self.dependents.get(node_id).cloned().unwrap_or_default() {
            if let Some(count) = self.remaining.get_mut(&child) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    newly_ready.push(child);
                }
            }
        }
        newly_ready.sort();
        self.enqueue(newly_ready).await;
    }

    async fn enqueue(&mut self, ids: Vec<String>) {
        for id in ids {
            if self.tracker.task_status(&id).await != Some(TaskStatus::Pending) {
                continue;
            }
            self.tracker.set_status(&id, TaskStatus::Ready).await;
            self.ready.push_back(id);
        }
    }

    fn abort_internal(&mut self, message: String) {
        error!(execution_id = %self.execution_id, error = %message, "Engine invariant violated, aborting execution");
        self.internal_error.get_or_insert(message);
        self.halt.cancel();
    }

    async fn finish(mut self) {
        let leftovers: Vec<String> = {
            let state = self.tracker.state.read().await;
            state
                .tasks
                .values()
                .filter(|t| !t.status.is_terminal())
                .map(|t| t.node_id.clone())
                .collect()
        };
        for id in leftovers {
            self.tracker
                .update_task(&id, |t| {
                    t.status = TaskStatus::Cancelled;
                    t.error_message
                        .get_or_insert_with(|| "cancelled before dispatch".into());
                    t.completed_at = Some(Utc::now());
                })
                .await;
        }
        self.ready.clear();

        let (status, summary, failed_node) = if let Some(message) = self.internal_error.take() {
            (
                ExecutionStatus::InternalError,
                Some(format!("internal error: {}", message)),
                None,
            )
        } else if self.cancel.is_cancelled() {
            (
                ExecutionStatus::Cancelled,
                Some("cancelled by request".to_string()),
                None,
            )
        } else if let Some((node_id, error)) = self.first_failure.take() {
            (
                ExecutionStatus::Failed,
                Some(format!("node '{}' failed: {}", node_id, error)),
                Some(node_id),
            )
        } else {
            (ExecutionStatus::Succeeded, None, None)
        };

        let output: Map<String, Value> = self
            .store
            .outputs()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        self.tracker
            .update_execution(|e| {
                e.status = status;
                e.output_data = Some(Value::Object(output));
                e.error_summary = summary.clone();
                e.failed_node = failed_node;
                e.completed_at = Some(Utc::now());
            })
            .await;
        self.tracker.publish(EngineEvent::ExecutionFinished {
            execution_id: self.execution_id.clone(),
            status,
            error: summary.clone(),
            at: Utc::now(),
        });

        match status {
            ExecutionStatus::Succeeded => {
                info!(execution_id = %self.execution_id, "Execution succeeded")
            }
            _ => warn!(
                execution_id = %self.execution_id,
                status = %status,
                summary = summary.as_deref().unwrap_or(""),
                "Execution did not succeed"
            ),
        }

        // Receivers may all be gone; the state is recorded either way.
        let _ = self.done.send(true);
    }
}

/// One node's attempt loop, run as its own task.
struct NodeRun {
    execution_id: ExecutionId,
    node_id: String,
    agent: Arc<dyn Agent>,
    input: Value,
    agent_config: Value,
    workflow_input: Value,
    retry: EffectiveRetry,
    deadline: Duration,
    tracker: Tracker,
    halt: CancellationToken,
}

impl NodeRun {
    async fn execute(self) -> Outcome {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.tracker
                .update_task(&self.node_id, |t| {
                    t.status = TaskStatus::Running;
                    t.attempt_count = attempt;
                    t.started_at.get_or_insert_with(Utc::now);
                })
                .await;

            let ctx = AgentContext {
                execution_id: self.execution_id.clone(),
                node_id: self.node_id.clone(),
                attempt,
                config: self.agent_config.clone(),
                workflow_input: self.workflow_input.clone(),
                cancel: self.halt.clone(),
            };
            let call = AssertUnwindSafe(self.agent.execute(self.input.clone(), ctx)).catch_unwind();

            let result = match tokio::time::timeout(self.deadline, call).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(AgentError::permanent("agent panicked")),
                Err(_) if self.halt.is_cancelled() => Err(AgentError::cancelled(
                    "cancelled: agent abandoned after deadline",
                )),
                Err(_) => Err(AgentError::transient(format!(
                    "timed out after {}ms",
                    self.deadline.as_millis()
                ))),
            };

            let elapsed_ms = started.elapsed().as_millis() as u64;
            let err = match result {
                Ok(result) => {
                    return Outcome::Succeeded {
                        node_id: self.node_id,
                        result,
                        elapsed_ms,
                    }
                }
                Err(err) => err,
            };

            if self.halt.is_cancelled() || !err.is_transient() {
                return Outcome::Failed {
                    node_id: self.node_id,
                    cancelled: err.is_cancelled(),
                    error: err.message,
                    elapsed_ms,
                };
            }
            if !self.retry.allows_retry_after(attempt) {
                return Outcome::Failed {
                    node_id: self.node_id,
                    error: format!("{} (gave up after {} attempts)", err.message, attempt),
                    elapsed_ms,
                    cancelled: false,
                };
            }

            let delay = self.retry.backoff(attempt);
            warn!(
                execution_id = %self.execution_id,
                node_id = %self.node_id,
                attempt,
                max_attempts = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying node after transient failure"
            );
            self.tracker
                .update_task(&self.node_id, |t| {
                    t.status = TaskStatus::Retrying;
                    t.error_message = Some(err.message.clone());
                })
                .await;
            self.tracker.publish(EngineEvent::TaskRetrying {
                execution_id: self.execution_id.clone(),
                node_id: self.node_id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: err.message.clone(),
                at: Utc::now(),
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.halt.cancelled() => {
                    return Outcome::Failed {
                        node_id: self.node_id,
                        error: format!("cancelled during retry backoff: {}", err.message),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        cancelled: true,
                    };
                }
            }
        }
    }
}
