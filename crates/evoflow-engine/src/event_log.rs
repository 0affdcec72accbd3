use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use evoflow_core::event::{EventBus, ExecutionEvents};
use evoflow_core::types::ExecutionId;

/// JSONL event logger for one execution.
///
/// Writes every event of that execution as one JSON object per line to
/// `{log_dir}/{execution_id}.jsonl`, flushing after each line so a crash
/// leaves every earlier line intact.
pub struct EventLogger {
    log_dir: PathBuf,
}

impl EventLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    /// Path of the log file for an execution.
    pub fn log_path(&self, execution_id: &ExecutionId) -> PathBuf {
        log_path(&self.log_dir, execution_id)
    }

    /// Subscribe now and log in the background until the execution finishes,
    /// the bus closes, or `cancel` fires.
    ///
    /// Subscribing happens before this returns, so events published right
    /// after the call are not missed.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let events = event_bus.subscribe_execution(execution_id);
        tokio::spawn(self.run(events, cancel))
    }

    async fn run(self, mut events: ExecutionEvents, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let path = self.log_path(events.execution_id());
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to open event log");
                return;
            }
        };

        debug!(path = %path.display(), "EventLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("EventLogger cancelled");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("Execution finished or bus closed, EventLogger stopping");
                        break;
                    };
                    match serde_json::to_string(&event) {
                        Ok(json) => {
                            let line = format!("{}\n", json);
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write event log entry");
                                break;
                            }
                            if let Err(e) = writer.flush().await {
                                error!(error = %e, "Failed to flush event log");
                            }
                        }
                        Err(e) => error!(error = %e, "Failed to serialize event"),
                    }
                }
            }
        }

        writer.flush().await.ok();
        info!(path = %path.display(), "Event log written");
    }
}

fn log_path(dir: &Path, execution_id: &ExecutionId) -> PathBuf {
    dir.join(format!("{}.jsonl", execution_id))
}
