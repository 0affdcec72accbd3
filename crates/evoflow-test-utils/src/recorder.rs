use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use evoflow_core::error::Result;
use evoflow_core::traits::ExecutionRecorder;
use evoflow_core::types::{ExecutionId, TaskExecution, TaskStatus, WorkflowExecution};

/// Recorder that keeps every write in memory.
#[derive(Default)]
pub struct MemoryRecorder {
    executions: Mutex<HashMap<ExecutionId, WorkflowExecution>>,
    tasks: Mutex<Vec<(ExecutionId, TaskExecution)>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest execution record written.
    pub fn execution(&self, id: &ExecutionId) -> Option<WorkflowExecution> {
        self.executions.lock().unwrap().get(id).cloned()
    }

    /// Every task write for one node, oldest first.
    pub fn task_history(&self, id: &ExecutionId, node_id: &str) -> Vec<TaskExecution> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, t)| e == id && t.node_id == node_id)
            .map(|(_, t)| t.clone())
            .collect()
    }

    /// Status sequence for one node with consecutive repeats collapsed.
    pub fn task_statuses(&self, id: &ExecutionId, node_id: &str) -> Vec<TaskStatus> {
        let mut statuses: Vec<TaskStatus> = self
            .task_history(id, node_id)
            .into_iter()
            .map(|t| t.status)
            .collect();
        statuses.dedup();
        statuses
    }
}

impl ExecutionRecorder for MemoryRecorder {
    fn record_execution(&self, execution: &WorkflowExecution) -> BoxFuture<'_, Result<()>> {
        self.executions
            .lock()
            .unwrap()
            .insert(execution.execution_id.clone(), execution.clone());
        Box::pin(async { Ok(()) })
    }

    fn record_task(
        &self,
        execution_id: &ExecutionId,
        task: &TaskExecution,
    ) -> BoxFuture<'_, Result<()>> {
        self.tasks
            .lock()
            .unwrap()
            .push((execution_id.clone(), task.clone()));
        Box::pin(async { Ok(()) })
    }
}
