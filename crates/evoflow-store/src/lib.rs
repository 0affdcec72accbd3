//! SQLite persistence of workflow executions and their task records.

mod recorder;

pub use recorder::{ExecutionSummary, SqliteRecorder};
