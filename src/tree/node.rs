use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::priority::TaskPriority;
use crate::tree::context::SharedContext;
use crate::tree::events::EventBus;
use crate::tree::executor::Executor;
use crate::tree::status::{NodeStatus, TriggerType};

pub type NodeId = String;

/// One recorded status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub from: NodeStatus,
    pub to: NodeStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
    pub trigger: TriggerType,
}

/// 占位节点：已完成子树的不可变快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNodePlaceholder {
    pub id: NodeId,
    pub name: String,
    pub status: NodeStatus,
    pub progress: u8,
    pub completed_at: DateTime<Utc>,
    /// Nodes below this one when it was compacted.
    pub descendant_count: usize,
    pub last_transition: Option<HistoryEntry>,
}

/// A child position: either a live node in the arena or a frozen placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildSlot {
    Live(NodeId),
    Placeholder(TaskNodePlaceholder),
}

impl ChildSlot {
    pub fn id(&self) -> &str {
        match self {
            ChildSlot::Live(id) => id,
            ChildSlot::Placeholder(p) => &p.id,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ChildSlot::Live(_))
    }
}

/// Parameters for creating a node.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub id: Option<NodeId>,
    pub name: String,
    pub parent_id: Option<NodeId>,
    pub priority: TaskPriority,
    pub executor: Option<String>,
    pub metadata: Map<String, Value>,
    pub max_retries: Option<u32>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            parent_id: None,
            priority: TaskPriority::Normal,
            executor: None,
            metadata: Map::new(),
            max_retries: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn executor(mut self, name: impl Into<String>) -> Self {
        self.executor = Some(name.into());
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }
}

/// How a node is being materialized.
#[derive(Debug, Clone)]
pub enum CreateMode {
    New,
    /// Rehydrated from the durable store: state is restored, no hooks fire.
    Recover {
        status: NodeStatus,
        progress: u8,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },
}

/// 任务节点
pub struct TaskNode {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) status: NodeStatus,
    pub(crate) progress: u8,
    pub(crate) priority: TaskPriority,
    pub(crate) metadata: Map<String, Value>,
    pub(crate) executor_name: Option<String>,
    pub(crate) executor: Option<Arc<dyn Executor>>,
    pub(crate) context: Option<SharedContext>,
    pub(crate) parent_id: Option<NodeId>,
    pub(crate) children: Vec<ChildSlot>,
    pub(crate) bus: EventBus,
    pub(crate) history: VecDeque<HistoryEntry>,
    pub(crate) retry_count: u32,
    pub(crate) max_retries: u32,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) tree_completion_emitted: bool,
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("progress", &self.progress)
            .field("parent_id", &self.parent_id)
            .field("children", &self.children.len())
            .finish()
    }
}

impl TaskNode {
    pub(crate) fn new(id: NodeId, spec: &NodeSpec, default_max_retries: u32, mode: &CreateMode) -> Self {
        let now = Utc::now();
        let (status, progress, created_at, updated_at) = match mode {
            CreateMode::New => (NodeStatus::Pending, 0, now, now),
            CreateMode::Recover {
                status,
                progress,
                created_at,
                updated_at,
            } => (*status, (*progress).min(100), *created_at, *updated_at),
        };
        Self {
            id,
            name: spec.name.clone(),
            status,
            progress,
            priority: spec.priority,
            metadata: spec.metadata.clone(),
            executor_name: spec.executor.clone(),
            executor: None,
            context: None,
            parent_id: spec.parent_id.clone(),
            children: Vec::new(),
            bus: EventBus::new(),
            history: VecDeque::new(),
            retry_count: restored_retry_count(spec, mode),
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            created_at,
            updated_at,
            started_at: None,
            completed_at: None,
            tree_completion_emitted: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn children(&self) -> &[ChildSlot] {
        &self.children
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    pub fn has_live_children(&self) -> bool {
        self.children.iter().any(ChildSlot::is_live)
    }

    pub(crate) fn record_transition(&mut self, entry: HistoryEntry, max_entries: usize) {
        self.history.push_front(entry);
        self.history.truncate(max_entries.max(1));
    }

    /// Names of references still held after cleanup. Empty when fully released.
    pub(crate) fn residual_references(&self) -> Vec<&'static str> {
        let mut residual = Vec::new();
        if self.executor.is_some() {
            residual.push("executor");
        }
        if self.context.is_some() {
            residual.push("shared_context");
        }
        if self.parent_id.is_some() {
            residual.push("parent");
        }
        if self.has_live_children() {
            residual.push("live_children");
        }
        if !self.bus.is_empty() {
            residual.push("subscriptions");
        }
        residual
    }

    pub(crate) fn to_placeholder(&self, descendant_count: usize) -> TaskNodePlaceholder {
        TaskNodePlaceholder {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            progress: self.progress,
            completed_at: self.completed_at.unwrap_or(self.updated_at),
            descendant_count,
            last_transition: self.history.front().cloned(),
        }
    }

    pub fn snapshot(&self) -> TaskNodeSnapshot {
        TaskNodeSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            progress: self.progress,
            priority: self.priority,
            metadata: self.metadata.clone(),
            executor_name: self.executor_name.clone(),
            parent_id: self.parent_id.clone(),
            children: self
                .children
                .iter()
                .map(|c| ChildSummary {
                    id: c.id().to_string(),
                    placeholder: !c.is_live(),
                })
                .collect(),
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Recovered nodes resume their retry budget from the persisted attempt log.
fn restored_retry_count(spec: &NodeSpec, mode: &CreateMode) -> u32 {
    match mode {
        CreateMode::New => 0,
        CreateMode::Recover { .. } => spec
            .metadata
            .get("retry_attempts")
            .and_then(Value::as_array)
            .map_or(0, |attempts| attempts.len() as u32),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSummary {
    pub id: NodeId,
    pub placeholder: bool,
}

/// Owned, read-only view of a live node handed to hooks, sinks and callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNodeSnapshot {
    pub id: NodeId,
    pub name: String,
    pub status: NodeStatus,
    pub progress: u8,
    pub priority: TaskPriority,
    pub metadata: Map<String, Value>,
    pub executor_name: Option<String>,
    pub parent_id: Option<NodeId>,
    pub children: Vec<ChildSummary>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result of looking a node up in the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeView {
    Live(TaskNodeSnapshot),
    Placeholder(TaskNodePlaceholder),
}

impl NodeView {
    pub fn id(&self) -> &str {
        match self {
            NodeView::Live(n) => &n.id,
            NodeView::Placeholder(p) => &p.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            NodeView::Live(n) => &n.name,
            NodeView::Placeholder(p) => &p.name,
        }
    }

    pub fn status(&self) -> NodeStatus {
        match self {
            NodeView::Live(n) => n.status,
            NodeView::Placeholder(p) => p.status,
        }
    }

    pub fn progress(&self) -> u8 {
        match self {
            NodeView::Live(n) => n.progress,
            NodeView::Placeholder(p) => p.progress,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, NodeView::Placeholder(_))
    }
}

/// Recursive view of a whole tree, carried by the tree-completion event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub id: NodeId,
    pub name: String,
    pub status: NodeStatus,
    pub progress: u8,
    pub placeholder: bool,
    pub children: Vec<TreeSnapshot>,
}

impl TreeSnapshot {
    /// Ids of every node in the snapshot, root first.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids = vec![self.id.clone()];
        for child in &self.children {
            ids.extend(child.ids());
        }
        ids
    }
}

/// Fired once when a root reaches a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct TreeCompletion {
    pub root_id: NodeId,
    pub status: NodeStatus,
    pub total_tasks: usize,
    pub tree: TreeSnapshot,
    pub completed_at: DateTime<Utc>,
}
