use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use evoflow_core::event::EventBus;
use evoflow_core::types::{EngineEvent, ExecutionId, ResumeSignal};

/// A node waiting for an external decision.
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub execution_id: ExecutionId,
    pub node_id: String,
    /// The node's resolved input, shown to whoever decides.
    pub input: Value,
    pub requested_at: DateTime<Utc>,
}

type Key = (ExecutionId, String);

/// Manages pending approvals with oneshot channels, one per awaiting node.
pub struct ApprovalBroker {
    pending: Mutex<HashMap<Key, (PendingApproval, oneshot::Sender<ResumeSignal>)>>,
    event_bus: Arc<EventBus>,
}

impl ApprovalBroker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Register a node as awaiting input, publish the request, and return the
    /// receiver the scheduler waits on.
    pub async fn request(
        &self,
        execution_id: &ExecutionId,
        node_id: &str,
        input: Value,
    ) -> oneshot::Receiver<ResumeSignal> {
        let (tx, rx) = oneshot::channel();
        let approval = PendingApproval {
            execution_id: execution_id.clone(),
            node_id: node_id.to_string(),
            input: input.clone(),
            requested_at: Utc::now(),
        };

        self.pending
            .lock()
            .await
            .insert((execution_id.clone(), node_id.to_string()), (approval, tx));

        self.event_bus.publish(EngineEvent::ApprovalRequested {
            execution_id: execution_id.clone(),
            node_id: node_id.to_string(),
            input,
            at: Utc::now(),
        });
        rx
    }

    /// Deliver a decision. Returns false when no such node is waiting.
    pub async fn respond(
        &self,
        execution_id: &ExecutionId,
        node_id: &str,
        signal: ResumeSignal,
    ) -> bool {
        let entry = self
            .pending
            .lock()
            .await
            .remove(&(execution_id.clone(), node_id.to_string()));
        let Some((_, tx)) = entry else {
            return false;
        };

        let approved = matches!(signal, ResumeSignal::Approve { .. });
        // The waiter may already be gone if the execution was cancelled.
        let delivered = tx.send(signal).is_ok();
        if delivered {
            self.event_bus.publish(EngineEvent::ApprovalResolved {
                execution_id: execution_id.clone(),
                node_id: node_id.to_string(),
                approved,
                at: Utc::now(),
            });
        }
        delivered
    }

    /// Drop a pending request without deciding it.
    pub async fn withdraw(&self, execution_id: &ExecutionId, node_id: &str) {
        self.pending
            .lock()
            .await
            .remove(&(execution_id.clone(), node_id.to_string()));
    }

    /// Pending approvals for one execution, ordered by node id.
    pub async fn pending(&self, execution_id: &ExecutionId) -> Vec<PendingApproval> {
        let mut list: Vec<PendingApproval> = self
            .pending
            .lock()
            .await
            .values()
            .filter(|(a, _)| &a.execution_id == execution_id)
            .map(|(a, _)| a.clone())
            .collect();
        list.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        list
    }

    pub async fn is_pending(&self, execution_id: &ExecutionId, node_id: &str) -> bool {
        self.pending
            .lock()
            .await
            .contains_key(&(execution_id.clone(), node_id.to_string()))
    }
}
