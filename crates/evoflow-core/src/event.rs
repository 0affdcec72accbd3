use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::types::{EngineEvent, ExecutionId};

/// Fan-out of engine events to every subscriber, across all executions.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns how many subscribers saw the event.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Subscribe to the events of one execution only.
    pub fn subscribe_execution(&self, execution_id: ExecutionId) -> ExecutionEvents {
        ExecutionEvents {
            rx: self.tx.subscribe(),
            execution_id,
            finished: false,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Event stream filtered to one execution, ending after `ExecutionFinished`.
pub struct ExecutionEvents {
    rx: broadcast::Receiver<EngineEvent>,
    execution_id: ExecutionId,
    finished: bool,
}

impl ExecutionEvents {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Next event of this execution, or `None` once it finished or the bus closed.
    ///
    /// A slow reader skips the events it lagged behind on.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) if event.execution_id() == &self.execution_id => {
                    self.finished = matches!(event, EngineEvent::ExecutionFinished { .. });
                    return Some(event);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(execution_id = %self.execution_id, skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
