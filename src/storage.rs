use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::warn;

use crate::priority::TaskPriority;
use crate::tree::status::{NodeStatus, TriggerType};

// --- Interfaces ---

/// A task node row as the durable store keeps it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedTask {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub name: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub executor_name: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Every persisted row. Used once at startup for recovery.
    async fn find_all(&self) -> Result<Vec<PersistedTask>>;
}

/// Mirror of one in-memory transition, emitted fire-and-forget.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSyncEvent {
    pub task_id: String,
    pub from_status: NodeStatus,
    pub to_status: NodeStatus,
    pub progress: u8,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
    pub trigger_type: TriggerType,
    pub full_task_data: Value,
}

pub trait StatusSyncSink: Send + Sync {
    /// Must not block; delivery is not awaited by the state machine.
    fn publish(&self, event: StatusSyncEvent);
}

// --- In-Memory Implementations ---

#[derive(Default)]
pub struct InMemoryTaskStore {
    rows: DashMap<String, PersistedTask>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = PersistedTask>) -> Self {
        let store = Self::new();
        for row in rows {
            store.upsert(row);
        }
        store
    }

    pub fn upsert(&self, row: PersistedTask) {
        self.rows.insert(row.id.clone(), row);
    }

    pub fn get(&self, id: &str) -> Option<PersistedTask> {
        self.rows.get(id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn find_all(&self) -> Result<Vec<PersistedTask>> {
        let mut rows: Vec<PersistedTask> = self.rows.iter().map(|r| r.value().clone()).collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }
}

/// Loads persisted rows from a YAML list (used by the CLI and fixtures).
pub fn load_tasks_from_yaml(file_path: impl AsRef<Path>) -> Result<Vec<PersistedTask>> {
    let file_path = file_path.as_ref();
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path.display()))?;

    let rows: Vec<PersistedTask> = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize YAML content from {}", file_path.display()))?;

    Ok(rows)
}

/// Forwards sync events to an unbounded channel drained by a persistence worker.
pub struct ChannelStatusSink {
    sender: mpsc::UnboundedSender<StatusSyncEvent>,
}

impl ChannelStatusSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusSyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sender: tx }, rx)
    }
}

impl StatusSyncSink for ChannelStatusSink {
    fn publish(&self, event: StatusSyncEvent) {
        if let Err(e) = self.sender.send(event) {
            warn!(task_id = %e.0.task_id, "Status sync channel closed, dropping event");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusSink;

impl StatusSyncSink for NoopStatusSink {
    fn publish(&self, _event: StatusSyncEvent) {}
}
