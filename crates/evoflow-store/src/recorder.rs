use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::debug;

use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::traits::ExecutionRecorder;
use evoflow_core::types::{
    AgentMetadata, ExecutionId, ExecutionStatus, TaskExecution, TaskStatus, WorkflowExecution,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflow_executions (
        execution_id TEXT PRIMARY KEY,
        workflow_name TEXT,
        status TEXT NOT NULL,
        input_data TEXT NOT NULL,
        output_data TEXT,
        error_summary TEXT,
        failed_node TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_executions_created
        ON workflow_executions(created_at DESC);

    CREATE TABLE IF NOT EXISTS task_executions (
        execution_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        agent_type TEXT NOT NULL,
        status TEXT NOT NULL,
        input_data TEXT,
        output_data TEXT,
        error_message TEXT,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        cost_estimate REAL,
        metadata TEXT,
        elapsed_ms INTEGER,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        PRIMARY KEY (execution_id, node_id)
    );";

/// One row of the execution history listing.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub execution_id: ExecutionId,
    pub workflow_name: Option<String>,
    pub status: ExecutionStatus,
    pub error_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub task_count: usize,
}

/// Execution recorder backed by SQLite.
///
/// Every write is an upsert, so the tables always hold the latest state of
/// each execution and task.
pub struct SqliteRecorder {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> EvoflowError {
    EvoflowError::Database(e.to_string())
}

impl SqliteRecorder {
    /// Open or create the history database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Execution store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, mostly for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn upsert_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT INTO workflow_executions
                (execution_id, workflow_name, status, input_data, output_data,
                 error_summary, failed_node, created_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(execution_id) DO UPDATE SET
                workflow_name = excluded.workflow_name,
                status = excluded.status,
                input_data = excluded.input_data,
                output_data = excluded.output_data,
                error_summary = excluded.error_summary,
                failed_node = excluded.failed_node,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at",
            params![
                execution.execution_id.as_str(),
                execution.workflow_name,
                execution.status.as_str(),
                serde_json::to_string(&execution.input_data)?,
                to_json_opt(execution.output_data.as_ref())?,
                execution.error_summary,
                execution.failed_node,
                execution.created_at.to_rfc3339(),
                execution.started_at.map(|t| t.to_rfc3339()),
                execution.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn upsert_task(&self, execution_id: &ExecutionId, task: &TaskExecution) -> Result<()> {
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT INTO task_executions
                (execution_id, node_id, agent_type, status, input_data, output_data,
                 error_message, attempt_count, cost_estimate, metadata, elapsed_ms,
                 created_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(execution_id, node_id) DO UPDATE SET
                agent_type = excluded.agent_type,
                status = excluded.status,
                input_data = excluded.input_data,
                output_data = excluded.output_data,
                error_message = excluded.error_message,
                attempt_count = excluded.attempt_count,
                cost_estimate = excluded.cost_estimate,
                metadata = excluded.metadata,
                elapsed_ms = excluded.elapsed_ms,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at",
            params![
                execution_id.as_str(),
                task.node_id,
                task.agent_type,
                task.status.as_str(),
                to_json_opt(task.input_data.as_ref())?,
                to_json_opt(task.output_data.as_ref())?,
                task.error_message,
                task.attempt_count as i64,
                task.cost_estimate,
                to_json_opt(task.metadata.as_ref())?,
                task.elapsed_ms.map(|ms| ms as i64),
                task.created_at.to_rfc3339(),
                task.started_at.map(|t| t.to_rfc3339()),
                task.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Load an execution together with all of its task records.
    pub fn load_execution(&self, id: &ExecutionId) -> Result<Option<WorkflowExecution>> {
        let conn = self.conn.lock().map_err(db_err)?;

        let row = conn
            .query_row(
                "SELECT execution_id, workflow_name, status, input_data, output_data,
                        error_summary, failed_node, created_at, started_at, completed_at
                 FROM workflow_executions WHERE execution_id = ?1",
                params![id.as_str()],
                ExecutionRow::from_row,
            )
            .optional()
            .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut execution = row.into_execution()?;

        let mut stmt = conn
            .prepare(
                "SELECT node_id, agent_type, status, input_data, output_data, error_message,
                        attempt_count, cost_estimate, metadata, elapsed_ms,
                        created_at, started_at, completed_at
                 FROM task_executions WHERE execution_id = ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![id.as_str()], TaskRow::from_row)
            .map_err(db_err)?;

        let mut tasks = BTreeMap::new();
        for row in rows {
            let task = row.map_err(db_err)?.into_task()?;
            tasks.insert(task.node_id.clone(), task);
        }
        execution.tasks = tasks;

        Ok(Some(execution))
    }

    /// Most recent executions first.
    pub fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionSummary>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT e.execution_id, e.workflow_name, e.status, e.error_summary,
                        e.created_at, e.completed_at,
                        (SELECT COUNT(*) FROM task_executions t
                         WHERE t.execution_id = e.execution_id)
                 FROM workflow_executions e
                 ORDER BY e.created_at DESC, e.rowid DESC
                 LIMIT ?1",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let id: String = row.get(0)?;
                let name: Option<String> = row.get(1)?;
                let status: String = row.get(2)?;
                let error: Option<String> = row.get(3)?;
                let created: String = row.get(4)?;
                let completed: Option<String> = row.get(5)?;
                let count: i64 = row.get(6)?;
                Ok((id, name, status, error, created, completed, count))
            })
            .map_err(db_err)?;

        let mut summaries = Vec::new();
        for row in rows {
            let (id, name, status, error, created, completed, count) = row.map_err(db_err)?;
            summaries.push(ExecutionSummary {
                execution_id: ExecutionId(id),
                workflow_name: name,
                status: status.parse().map_err(db_err)?,
                error_summary: error,
                created_at: parse_time(&created),
                completed_at: completed.as_deref().map(parse_time),
                task_count: count.max(0) as usize,
            });
        }
        Ok(summaries)
    }
}

impl ExecutionRecorder for SqliteRecorder {
    fn record_execution(&self, execution: &WorkflowExecution) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();
        Box::pin(async move { self.upsert_execution(&execution) })
    }

    fn record_task(
        &self,
        execution_id: &ExecutionId,
        task: &TaskExecution,
    ) -> BoxFuture<'_, Result<()>> {
        let execution_id = execution_id.clone();
        let task = task.clone();
        Box::pin(async move { self.upsert_task(&execution_id, &task) })
    }
}

struct ExecutionRow {
    id: String,
    name: Option<String>,
    status: String,
    input: String,
    output: Option<String>,
    error_summary: Option<String>,
    failed_node: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            status: row.get(2)?,
            input: row.get(3)?,
            output: row.get(4)?,
            error_summary: row.get(5)?,
            failed_node: row.get(6)?,
            created_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    fn into_execution(self) -> Result<WorkflowExecution> {
        Ok(WorkflowExecution {
            execution_id: ExecutionId(self.id),
            workflow_name: self.name,
            status: self.status.parse().map_err(db_err)?,
            input_data: serde_json::from_str(&self.input)?,
            output_data: from_json_opt(self.output)?,
            error_summary: self.error_summary,
            failed_node: self.failed_node,
            created_at: parse_time(&self.created_at),
            started_at: self.started_at.as_deref().map(parse_time),
            completed_at: self.completed_at.as_deref().map(parse_time),
            tasks: BTreeMap::new(),
        })
    }
}

struct TaskRow {
    node_id: String,
    agent_type: String,
    status: String,
    input: Option<String>,
    output: Option<String>,
    error: Option<String>,
    attempts: i64,
    cost: Option<f64>,
    metadata: Option<String>,
    elapsed_ms: Option<i64>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            node_id: row.get(0)?,
            agent_type: row.get(1)?,
            status: row.get(2)?,
            input: row.get(3)?,
            output: row.get(4)?,
            error: row.get(5)?,
            attempts: row.get(6)?,
            cost: row.get(7)?,
            metadata: row.get(8)?,
            elapsed_ms: row.get(9)?,
            created_at: row.get(10)?,
            started_at: row.get(11)?,
            completed_at: row.get(12)?,
        })
    }

    fn into_task(self) -> Result<TaskExecution> {
        let status: TaskStatus = self.status.parse().map_err(db_err)?;
        let metadata: Option<AgentMetadata> = from_json_opt(self.metadata)?;
        Ok(TaskExecution {
            node_id: self.node_id,
            agent_type: self.agent_type,
            status,
            input_data: from_json_opt(self.input)?,
            output_data: from_json_opt(self.output)?,
            error_message: self.error,
            attempt_count: self.attempts.max(0) as u32,
            cost_estimate: self.cost,
            metadata,
            elapsed_ms: self.elapsed_ms.map(|ms| ms.max(0) as u64),
            created_at: parse_time(&self.created_at),
            started_at: self.started_at.as_deref().map(parse_time),
            completed_at: self.completed_at.as_deref().map(parse_time),
        })
    }
}

fn to_json_opt<T: Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(EvoflowError::from)
}

fn from_json_opt<T: serde::de::DeserializeOwned>(text: Option<String>) -> Result<Option<T>> {
    text.as_deref()
        .map(|s| serde_json::from_str(s))
        .transpose()
        .map_err(EvoflowError::from)
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_execution(name: &str) -> WorkflowExecution {
        let mut execution =
            WorkflowExecution::new(ExecutionId::new(), Some(name.into()), json!({"topic": "rust"}));
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        execution
    }

    #[tokio::test]
    async fn test_round_trips_execution_with_tasks() {
        let store = SqliteRecorder::in_memory().unwrap();
        let mut execution = sample_execution("pipeline");
        store.record_execution(&execution).await.unwrap();

        let mut task = TaskExecution::new("fetch", "echo");
        task.status = TaskStatus::Running;
        task.attempt_count = 1;
        store.record_task(&execution.execution_id, &task).await.unwrap();

        task.status = TaskStatus::Succeeded;
        task.output_data = Some(json!({"items": [1, 2]}));
        task.cost_estimate = Some(0.5);
        task.elapsed_ms = Some(42);
        task.metadata = Some(AgentMetadata {
            tokens_used: Some(7),
            ..Default::default()
        });
        store.record_task(&execution.execution_id, &task).await.unwrap();

        execution.status = ExecutionStatus::Succeeded;
        execution.output_data = Some(json!({"fetch": {"items": [1, 2]}}));
        execution.completed_at = Some(Utc::now());
        store.record_execution(&execution).await.unwrap();

        let loaded = store
            .load_execution(&execution.execution_id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Succeeded);
        assert_eq!(loaded.workflow_name.as_deref(), Some("pipeline"));
        assert_eq!(loaded.input_data, json!({"topic": "rust"}));
        assert_eq!(loaded.tasks.len(), 1);

        let fetch = loaded.task("fetch").unwrap();
        assert_eq!(fetch.status, TaskStatus::Succeeded);
        assert_eq!(fetch.attempt_count, 1);
        assert_eq!(fetch.output_data, Some(json!({"items": [1, 2]})));
        assert_eq!(fetch.cost_estimate, Some(0.5));
        assert_eq!(fetch.elapsed_ms, Some(42));
        assert_eq!(fetch.metadata.as_ref().unwrap().tokens_used, Some(7));
    }

    #[test]
    fn test_unknown_execution_is_none() {
        let store = SqliteRecorder::in_memory().unwrap();
        assert!(store
            .load_execution(&ExecutionId::from_string("missing"))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_lists_most_recent_first() {
        let store = SqliteRecorder::in_memory().unwrap();
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut execution = sample_execution(&format!("wf-{}", i));
            execution.created_at = Utc::now() + chrono::Duration::seconds(i);
            store.record_execution(&execution).await.unwrap();
            store
                .record_task(&execution.execution_id, &TaskExecution::new("a", "echo"))
                .await
                .unwrap();
            ids.push(execution.execution_id);
        }

        let listed = store.list_executions(2).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].execution_id, ids[2]);
        assert_eq!(listed[1].execution_id, ids[1]);
        assert_eq!(listed[0].task_count, 1);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("executions.db");
        let execution = sample_execution("durable");
        {
            let store = SqliteRecorder::open(&path).unwrap();
            store.record_execution(&execution).await.unwrap();
        }
        let store = SqliteRecorder::open(&path).unwrap();
        let loaded = store.load_execution(&execution.execution_id).unwrap();
        assert_eq!(loaded.unwrap().status, ExecutionStatus::Running);
    }
}
