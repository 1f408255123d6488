use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::concurrency::slots::SlotRequest;
use crate::error::{EngineError, Result};
use crate::priority::TaskPriority;
use crate::retry::classifier::{ErrorKey, ErrorType};

/// A unit of schedulable work. `cancel` fires when the task is cancelled; honouring it is up to the job.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

struct FnJob<F>(F);

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        (self.0)(cancel).await
    }
}

/// Wraps a closure as a [`Job`].
pub fn job_fn<F, Fut>(f: F) -> Arc<dyn Job>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnJob(f))
}

/// 任务定义
#[derive(Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub owner: Option<String>,
    pub priority: TaskPriority,
    /// Falls back to the scheduler's default.
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
    /// Slot to hold while the job runs.
    pub admission: Option<SlotRequest>,
    /// Failure counter identity shared by every scheduling of the same work.
    /// Without one each task counts its failures on its own.
    pub error_key: Option<ErrorKey>,
    pub job: Arc<dyn Job>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, job: Arc<dyn Job>) -> Self {
        Self {
            name: name.into(),
            owner: None,
            priority: TaskPriority::Normal,
            max_retries: None,
            timeout: None,
            admission: None,
            error_key: None,
            job,
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn admission(mut self, request: SlotRequest) -> Self {
        self.admission = Some(request);
        self
    }

    pub fn error_key(mut self, key: ErrorKey) -> Self {
        self.error_key = Some(key);
        self
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("priority", &self.priority)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("admission", &self.admission)
            .field("error_key", &self.error_key)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuedTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl QueuedTaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueuedTaskStatus::Completed | QueuedTaskStatus::Failed | QueuedTaskStatus::Cancelled
        )
    }

    /// Listing order: running, then pending, then everything else.
    pub(crate) fn list_rank(self) -> u8 {
        match self {
            QueuedTaskStatus::Running => 0,
            QueuedTaskStatus::Pending => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for QueuedTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueuedTaskStatus::Pending => "pending",
            QueuedTaskStatus::Running => "running",
            QueuedTaskStatus::Completed => "completed",
            QueuedTaskStatus::Failed => "failed",
            QueuedTaskStatus::Cancelled => "cancelled",
            QueuedTaskStatus::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

/// Scheduler-side record of one scheduled task.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedTask {
    pub id: Uuid,
    pub name: String,
    pub owner: Option<String>,
    pub status: QueuedTaskStatus,
    pub priority: TaskPriority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub error_type: Option<ErrorType>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<QueuedTaskStatus>,
    pub priority: Option<TaskPriority>,
    pub owner: Option<String>,
}

impl TaskFilter {
    pub fn status(mut self, status: QueuedTaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub(crate) fn matches(&self, task: &QueuedTask) -> bool {
        self.status.is_none_or(|s| s == task.status)
            && self.priority.is_none_or(|p| p == task.priority)
            && self
                .owner
                .as_deref()
                .is_none_or(|o| task.owner.as_deref() == Some(o))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Handle returned by `schedule`; resolves with the final record.
#[derive(Debug)]
pub struct TaskTicket {
    pub(crate) id: Uuid,
    pub(crate) receiver: oneshot::Receiver<QueuedTask>,
}

impl TaskTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn wait(self) -> Result<QueuedTask> {
        self.receiver
            .await
            .map_err(|_| EngineError::ShuttingDown("scheduler"))
    }
}
