use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Weak;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::concurrency::manager::ConcurrencyManager;
use crate::error::{EngineError, Result};
use crate::priority::TaskPriority;

/// Admission domain of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    Workflow,
    Node,
    Task,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotKind::Workflow => "workflow",
            SlotKind::Node => "node",
            SlotKind::Task => "task",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRequest {
    pub kind: SlotKind,
    pub instance_id: String,
    pub node_id: Option<String>,
    pub task_id: Option<String>,
    pub priority: TaskPriority,
}

impl SlotRequest {
    pub fn workflow(instance_id: impl Into<String>, priority: TaskPriority) -> Self {
        Self {
            kind: SlotKind::Workflow,
            instance_id: instance_id.into(),
            node_id: None,
            task_id: None,
            priority,
        }
    }

    pub fn node(instance_id: impl Into<String>, node_id: impl Into<String>, priority: TaskPriority) -> Self {
        Self {
            kind: SlotKind::Node,
            instance_id: instance_id.into(),
            node_id: Some(node_id.into()),
            task_id: None,
            priority,
        }
    }

    pub fn task(
        instance_id: impl Into<String>,
        node_id: impl Into<String>,
        task_id: impl Into<String>,
        priority: TaskPriority,
    ) -> Self {
        Self {
            kind: SlotKind::Task,
            instance_id: instance_id.into(),
            node_id: Some(node_id.into()),
            task_id: Some(task_id.into()),
            priority,
        }
    }
}

/// 执行槽位
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSlot {
    pub id: Uuid,
    pub kind: SlotKind,
    pub instance_id: String,
    pub node_id: Option<String>,
    pub task_id: Option<String>,
    pub priority: TaskPriority,
    pub acquired_at: DateTime<Utc>,
}

impl ExecutionSlot {
    pub(crate) fn grant(request: SlotRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: request.kind,
            instance_id: request.instance_id,
            node_id: request.node_id,
            task_id: request.task_id,
            priority: request.priority,
            acquired_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub enum Admission {
    Granted(ExecutionSlot),
    Queued(QueuedAdmission),
}

/// A waiting request. Dropping it withdraws the request; a slot granted to it
/// but never received is released back to the manager.
#[derive(Debug)]
pub struct QueuedAdmission {
    pub(crate) id: Uuid,
    pub(crate) receiver: oneshot::Receiver<ExecutionSlot>,
    pub(crate) manager: Weak<ConcurrencyManager>,
}

impl QueuedAdmission {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn wait(mut self) -> Result<ExecutionSlot> {
        let id = self.id;
        (&mut self.receiver)
            .await
            .map_err(|_| EngineError::AdmissionWithdrawn(id))
    }
}

impl Drop for QueuedAdmission {
    fn drop(&mut self) {
        self.receiver.close();
        if let Ok(slot) = self.receiver.try_recv() {
            if let Some(manager) = self.manager.upgrade() {
                manager.release(slot.id);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConcurrencyStats {
    pub active_workflows: usize,
    pub active_node_slots: usize,
    pub active_task_slots: usize,
    pub queued: usize,
    pub memory_percent: f64,
    pub cpu_percent: f64,
}
