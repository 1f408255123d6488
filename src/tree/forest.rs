//! The task-node state machine.
//!
//! Nodes live in an arena keyed by id. A parent owns its children through its
//! ordered `ChildSlot` list; a child only remembers its parent's id. Cascade
//! wiring is expressed as `Subscriber::Node` entries on each side's event bus,
//! and every state change flows through [`TaskForest::apply_transition`].

use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TreeConfig;
use crate::error::{EngineError, Result};
use crate::storage::{StatusSyncEvent, StatusSyncSink};
use crate::tree::context::SharedContext;
use crate::tree::events::{NodeEvent, NodeEventKind, NodeListener, Subscriber, SubscriptionId};
use crate::tree::executor::{Executor, ExecutorRegistry};
use crate::tree::node::{
    ChildSlot, CreateMode, HistoryEntry, NodeId, NodeSpec, NodeView, TaskNode, TaskNodePlaceholder,
    TaskNodeSnapshot, TreeCompletion, TreeSnapshot,
};
use crate::tree::status::{NodeStatus, TriggerType};

/// An arena slot: a live node or the placeholder that replaced it.
#[derive(Debug)]
pub enum TreeEntry {
    Live(TaskNode),
    Placeholder(TaskNodePlaceholder),
}

/// Work the forest cannot do itself, handed to the owning service.
#[derive(Debug, Clone)]
pub enum ForestEffect {
    /// A node with an executor entered RUNNING from PENDING.
    Dispatch { node_id: NodeId },
    /// A root entered RUNNING from PENDING.
    RootStarted { root_id: NodeId },
    /// A child was replaced by a placeholder; its former subtree may be evicted.
    Compacted {
        node_id: NodeId,
        former_descendants: Vec<NodeId>,
    },
    TreeCompleted(TreeCompletion),
}

/// Everything needed to run a node's work outside the arena lock.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub node: TaskNodeSnapshot,
    pub root_id: NodeId,
    pub executor: Arc<dyn Executor>,
    pub context: SharedContext,
}

#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    pub reason: Option<String>,
    pub reset_progress: bool,
}

pub struct TaskForest {
    entries: HashMap<NodeId, TreeEntry>,
    config: TreeConfig,
    executors: Arc<dyn ExecutorRegistry>,
    sink: Arc<dyn StatusSyncSink>,
    effects: Vec<ForestEffect>,
}

impl TaskForest {
    pub fn new(config: TreeConfig, executors: Arc<dyn ExecutorRegistry>, sink: Arc<dyn StatusSyncSink>) -> Self {
        Self {
            entries: HashMap::new(),
            config,
            executors,
            sink,
            effects: Vec::new(),
        }
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    // --- Factory ---

    /// Creates a node, wires cascade subscriptions with its parent and resolves its executor.
    pub fn create_node(&mut self, spec: NodeSpec, mode: CreateMode) -> Result<NodeId> {
        let id = spec.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.entries.contains_key(&id) {
            return Err(EngineError::DuplicateNode(id));
        }

        let executor = match &spec.executor {
            Some(name) => Some(
                self.executors
                    .resolve(name)
                    .ok_or_else(|| EngineError::ExecutorNotFound(name.clone()))?,
            ),
            None => None,
        };

        let context = match &spec.parent_id {
            Some(parent_id) => {
                let parent = match self.entries.get(parent_id) {
                    Some(TreeEntry::Live(parent)) => parent,
                    Some(TreeEntry::Placeholder(_)) => {
                        return Err(EngineError::InvalidParent {
                            parent: parent_id.clone(),
                            child: id,
                            reason: "parent has been compacted into a placeholder".to_string(),
                        });
                    }
                    None => return Err(EngineError::NodeNotFound(parent_id.clone())),
                };
                if matches!(mode, CreateMode::New) && parent.status.is_terminal() {
                    return Err(EngineError::InvalidParent {
                        parent: parent_id.clone(),
                        child: id,
                        reason: format!("parent is already {}", parent.status),
                    });
                }
                parent.context.clone().unwrap_or_default()
            }
            None => SharedContext::new(),
        };

        let mut node = TaskNode::new(id.clone(), &spec, self.config.default_max_retries, &mode);
        node.executor = executor;
        node.context = Some(context);

        if let Some(parent_id) = &spec.parent_id {
            // parent listens to the child, child listens to the parent
            node.bus.subscribe(Subscriber::Node(parent_id.clone()));
            let parent = self.live_mut(parent_id)?;
            parent.children.push(ChildSlot::Live(id.clone()));
            parent.bus.subscribe(Subscriber::Node(id.clone()));
        }

        debug!(node_id = %id, name = %node.name, parent_id = ?spec.parent_id, "Task node created");
        self.entries.insert(id.clone(), TreeEntry::Live(node));

        if let (Some(parent_id), CreateMode::New) = (&spec.parent_id, &mode) {
            self.recompute_progress(parent_id);
        }
        Ok(id)
    }

    /// Installs a terminal persisted child directly as a placeholder under `parent_id`.
    pub fn attach_placeholder(&mut self, parent_id: &str, placeholder: TaskNodePlaceholder) -> Result<()> {
        if self.entries.contains_key(&placeholder.id) {
            return Err(EngineError::DuplicateNode(placeholder.id));
        }
        let parent = self.live_mut(parent_id)?;
        parent.children.push(ChildSlot::Placeholder(placeholder.clone()));
        self.entries
            .insert(placeholder.id.clone(), TreeEntry::Placeholder(placeholder));
        Ok(())
    }

    /// Installs a terminal persisted root as a placeholder.
    pub fn insert_placeholder(&mut self, placeholder: TaskNodePlaceholder) -> Result<()> {
        if self.entries.contains_key(&placeholder.id) {
            return Err(EngineError::DuplicateNode(placeholder.id));
        }
        self.entries
            .insert(placeholder.id.clone(), TreeEntry::Placeholder(placeholder));
        Ok(())
    }

    // --- Caller-driven transitions ---

    pub fn start(&mut self, id: &str) -> Result<()> {
        self.request(id, &[NodeStatus::Pending], NodeStatus::Running, None, TriggerType::Manual)
    }

    pub fn pause(&mut self, id: &str) -> Result<()> {
        self.request(id, &[NodeStatus::Running], NodeStatus::Paused, None, TriggerType::Manual)
    }

    pub fn resume(&mut self, id: &str) -> Result<()> {
        self.request(id, &[NodeStatus::Paused], NodeStatus::Running, None, TriggerType::Manual)
    }

    pub fn succeed(&mut self, id: &str, trigger: TriggerType) -> Result<()> {
        self.request(id, &[NodeStatus::Running], NodeStatus::Success, None, trigger)
    }

    pub fn complete(&mut self, id: &str) -> Result<()> {
        self.request(id, &[NodeStatus::Running], NodeStatus::Completed, None, TriggerType::Manual)
    }

    pub fn fail(&mut self, id: &str, reason: impl Into<String>, trigger: TriggerType) -> Result<()> {
        let reason = reason.into();
        self.request(
            id,
            &[NodeStatus::Pending, NodeStatus::Running, NodeStatus::Paused],
            NodeStatus::Failed,
            Some(reason.clone()),
            trigger,
        )?;
        if let Ok(node) = self.live_mut(id) {
            node.metadata.insert("last_error".to_string(), Value::String(reason));
        }
        Ok(())
    }

    pub fn cancel(&mut self, id: &str, reason: Option<String>) -> Result<()> {
        self.request(
            id,
            &[NodeStatus::Pending, NodeStatus::Running, NodeStatus::Paused],
            NodeStatus::Cancelled,
            reason,
            TriggerType::Manual,
        )
    }

    /// Re-enters PENDING from FAILED and immediately starts again.
    pub fn retry(&mut self, id: &str, options: RetryOptions) -> Result<()> {
        if let Some(parent_id) = self.live(id)?.parent_id.clone() {
            if let Ok(parent) = self.live(&parent_id) {
                if parent.status.is_terminal() {
                    return Err(EngineError::ParentSettled {
                        id: id.to_string(),
                        parent: parent_id,
                        parent_status: parent.status,
                    });
                }
            }
        }
        let node = self.live_mut(id)?;
        if node.status != NodeStatus::Failed {
            return Err(EngineError::RetryNotAllowed {
                id: id.to_string(),
                current: node.status,
            });
        }
        if node.has_live_children() {
            return Err(EngineError::NodeHasChildren {
                id: id.to_string(),
                current: node.status,
                to: NodeStatus::Pending,
            });
        }
        if node.retry_count >= node.max_retries {
            return Err(EngineError::MaxRetriesExceeded {
                id: id.to_string(),
                max: node.max_retries,
            });
        }

        node.retry_count += 1;
        let attempt = json!({
            "attempt": node.retry_count,
            "timestamp": Utc::now(),
            "reason": options.reason,
        });
        match node.metadata.get_mut("retry_attempts") {
            Some(Value::Array(attempts)) => attempts.push(attempt),
            _ => {
                node.metadata
                    .insert("retry_attempts".to_string(), Value::Array(vec![attempt]));
            }
        }
        if options.reset_progress {
            node.progress = 0;
        }
        node.tree_completion_emitted = false;
        info!(node_id = %id, attempt = node.retry_count, max_retries = node.max_retries, "Retrying task node");

        self.apply_transition(id, NodeStatus::Pending, options.reason.clone(), TriggerType::Retry)?;
        self.apply_transition(id, NodeStatus::Running, options.reason, TriggerType::Retry)
    }

    pub fn update_progress(&mut self, id: &str, progress: u8) -> Result<()> {
        let node = self.live_mut(id)?;
        if node.has_live_children() {
            return Err(EngineError::DerivedProgress { id: id.to_string() });
        }
        if node.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                id: id.to_string(),
                from: node.status,
                to: node.status,
            });
        }
        let progress = progress.min(100);
        if node.progress != progress {
            node.progress = progress;
            node.updated_at = Utc::now();
            self.emit(id, NodeEventKind::ProgressChanged);
        }
        Ok(())
    }

    pub fn set_metadata(&mut self, id: &str, key: &str, value: Value) -> Result<()> {
        let node = self.live_mut(id)?;
        node.metadata.insert(key.to_string(), value);
        node.updated_at = Utc::now();
        Ok(())
    }

    pub fn subscribe(&mut self, id: &str, listener: NodeListener) -> Result<SubscriptionId> {
        Ok(self.live_mut(id)?.bus.subscribe(Subscriber::Listener(listener)))
    }

    pub fn unsubscribe(&mut self, id: &str, subscription: SubscriptionId) -> Result<bool> {
        Ok(self.live_mut(id)?.bus.unsubscribe(subscription))
    }

    /// Replaces a terminal child of `parent_id` with a placeholder.
    /// Returns `false` when the child is already a placeholder.
    pub fn compact(&mut self, parent_id: &str, child_id: &str) -> Result<bool> {
        let parent = self.live(parent_id)?;
        let slot = parent
            .children
            .iter()
            .find(|c| c.id() == child_id)
            .ok_or_else(|| EngineError::NodeNotFound(child_id.to_string()))?;
        if !slot.is_live() {
            return Ok(false);
        }
        let status = self.live(child_id)?.status;
        if !status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                id: child_id.to_string(),
                from: status,
                to: status,
            });
        }
        Ok(self.compact_child(parent_id, child_id))
    }

    /// Re-runs the cascade for a parent whose children are all terminal.
    pub fn reconcile(&mut self, id: &str) {
        let Ok(node) = self.live(id) else { return };
        if node.status.is_terminal() || node.children.is_empty() {
            return;
        }
        self.recompute_progress(id);
        self.evaluate_cascade(id);
    }

    // --- Queries ---

    pub fn get(&self, id: &str) -> Option<NodeView> {
        self.entries.get(id).map(|entry| match entry {
            TreeEntry::Live(node) => NodeView::Live(node.snapshot()),
            TreeEntry::Placeholder(p) => NodeView::Placeholder(p.clone()),
        })
    }

    pub fn entry(&self, id: &str) -> Option<&TreeEntry> {
        self.entries.get(id)
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        match self.entries.get(id) {
            Some(TreeEntry::Live(node)) => Some(node),
            _ => None,
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeView> {
        self.entries
            .iter()
            .find(|(_, entry)| match entry {
                TreeEntry::Live(node) => node.name == name,
                TreeEntry::Placeholder(p) => p.name == name,
            })
            .and_then(|(id, _)| self.get(id))
    }

    /// A FAILED node that [`TaskForest::retry`] would still accept, parent aside.
    pub fn is_retryable(&self, id: &str) -> bool {
        self.node(id).is_some_and(|n| {
            n.status == NodeStatus::Failed && n.retry_count < n.max_retries && !n.has_live_children()
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn context(&self, id: &str) -> Option<SharedContext> {
        self.node(id).and_then(|n| n.context.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, TreeEntry::Live(_)))
            .count()
    }

    pub fn root_of(&self, id: &str) -> NodeId {
        let mut current = id.to_string();
        while let Some(parent) = self.node(&current).and_then(|n| n.parent_id.clone()) {
            current = parent;
        }
        current
    }

    pub fn dispatch_plan(&self, id: &str) -> Option<DispatchPlan> {
        let node = self.node(id)?;
        if node.status != NodeStatus::Running {
            return None;
        }
        Some(DispatchPlan {
            node: node.snapshot(),
            root_id: self.root_of(id),
            executor: node.executor.clone()?,
            context: node.context.clone().unwrap_or_default(),
        })
    }

    pub fn tree_snapshot(&self, id: &str) -> Option<TreeSnapshot> {
        match self.entries.get(id)? {
            TreeEntry::Placeholder(p) => Some(placeholder_snapshot(p)),
            TreeEntry::Live(node) => Some(TreeSnapshot {
                id: node.id.clone(),
                name: node.name.clone(),
                status: node.status,
                progress: node.progress,
                placeholder: false,
                children: node
                    .children
                    .iter()
                    .filter_map(|slot| match slot {
                        ChildSlot::Live(child) => self.tree_snapshot(child),
                        ChildSlot::Placeholder(p) => Some(placeholder_snapshot(p)),
                    })
                    .collect(),
            }),
        }
    }

    /// Nodes in the tree rooted at `id`, counting everything placeholders stand for.
    pub fn count_nodes(&self, id: &str) -> usize {
        match self.entries.get(id) {
            None => 0,
            Some(TreeEntry::Placeholder(p)) => 1 + p.descendant_count,
            Some(TreeEntry::Live(node)) => 1 + node.children.iter().map(|slot| self.slot_size(slot)).sum::<usize>(),
        }
    }

    // --- Cache maintenance ---

    pub fn evict<'a>(&mut self, ids: impl IntoIterator<Item = &'a NodeId>) -> usize {
        ids.into_iter()
            .filter(|id| self.entries.remove(id.as_str()).is_some())
            .count()
    }

    pub fn take_effects(&mut self) -> Vec<ForestEffect> {
        std::mem::take(&mut self.effects)
    }

    // --- Internals ---

    fn live(&self, id: &str) -> Result<&TaskNode> {
        match self.entries.get(id) {
            Some(TreeEntry::Live(node)) => Ok(node),
            Some(TreeEntry::Placeholder(_)) => Err(EngineError::NodeCompacted { id: id.to_string() }),
            None => Err(EngineError::NodeNotFound(id.to_string())),
        }
    }

    fn live_mut(&mut self, id: &str) -> Result<&mut TaskNode> {
        match self.entries.get_mut(id) {
            Some(TreeEntry::Live(node)) => Ok(node),
            Some(TreeEntry::Placeholder(_)) => Err(EngineError::NodeCompacted { id: id.to_string() }),
            None => Err(EngineError::NodeNotFound(id.to_string())),
        }
    }

    fn request(
        &mut self,
        id: &str,
        allowed_from: &[NodeStatus],
        to: NodeStatus,
        reason: Option<String>,
        trigger: TriggerType,
    ) -> Result<()> {
        let node = self.live(id)?;
        if to.is_terminal() && node.has_live_children() {
            return Err(EngineError::NodeHasChildren {
                id: id.to_string(),
                current: node.status,
                to,
            });
        }
        if !allowed_from.contains(&node.status) || !node.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                id: id.to_string(),
                from: node.status,
                to,
            });
        }
        self.apply_transition(id, to, reason, trigger)
    }

    /// State + history, then status sync, then executor hook, then subscribers.
    fn apply_transition(&mut self, id: &str, to: NodeStatus, reason: Option<String>, trigger: TriggerType) -> Result<()> {
        let max_history = self.config.max_history_entries;
        let now = Utc::now();
        let node = self.live_mut(id)?;
        let from = node.status;

        node.status = to;
        node.updated_at = now;
        match to {
            NodeStatus::Running if from == NodeStatus::Pending => node.started_at = Some(now),
            NodeStatus::Pending => node.completed_at = None,
            NodeStatus::Success => node.progress = 100,
            _ => {}
        }
        if to.is_terminal() {
            node.completed_at = Some(now);
        }
        node.record_transition(
            HistoryEntry {
                from,
                to,
                at: now,
                reason: reason.clone(),
                trigger,
            },
            max_history,
        );

        let snapshot = node.snapshot();
        let executor = node.executor.clone();
        let context = node.context.clone().unwrap_or_default();
        let is_root = node.parent_id.is_none();
        debug!(node_id = %id, %from, %to, %trigger, "Task node transition");

        self.sink.publish(StatusSyncEvent {
            task_id: id.to_string(),
            from_status: from,
            to_status: to,
            progress: snapshot.progress,
            timestamp: now,
            reason,
            trigger_type: trigger,
            full_task_data: serde_json::to_value(&snapshot).unwrap_or(Value::Null),
        });

        if let Some(executor) = &executor {
            invoke_hook(executor.as_ref(), from, to, &snapshot, &context);
        }

        if to == NodeStatus::Running && from == NodeStatus::Pending {
            if executor.as_ref().is_some_and(|e| e.runs_work()) {
                self.effects.push(ForestEffect::Dispatch { node_id: id.to_string() });
            }
            if is_root {
                self.effects.push(ForestEffect::RootStarted { root_id: id.to_string() });
            }
        }

        if let Some(kind) = NodeEventKind::for_transition(from, to) {
            self.emit(id, kind);
        }

        if to.is_terminal() && is_root {
            self.complete_tree(id);
        }
        Ok(())
    }

    fn emit(&mut self, source: &str, kind: NodeEventKind) {
        let Ok(node) = self.live(source) else { return };
        let event = NodeEvent {
            kind,
            source: source.to_string(),
            status: node.status,
            progress: node.progress,
            at: Utc::now(),
        };
        for subscriber in node.bus.subscribers() {
            match subscriber {
                Subscriber::Node(target) => self.deliver(&target, &event),
                Subscriber::Listener(listener) => listener(&event),
            }
        }
    }

    fn deliver(&mut self, target: &str, event: &NodeEvent) {
        let Ok(node) = self.live(target) else { return };
        if node.parent_id.as_deref() == Some(event.source.as_str()) {
            self.follow_parent(target, event);
        } else if node
            .children
            .iter()
            .any(|c| c.is_live() && c.id() == event.source)
        {
            self.on_child_event(target, event);
        }
    }

    /// Downward propagation of start / pause / resume.
    fn follow_parent(&mut self, child: &str, event: &NodeEvent) {
        let Ok(node) = self.live(child) else { return };
        let next = match (event.kind, node.status) {
            (NodeEventKind::Started | NodeEventKind::Resumed, NodeStatus::Pending | NodeStatus::Paused) => {
                NodeStatus::Running
            }
            (NodeEventKind::Paused, NodeStatus::Running) => NodeStatus::Paused,
            _ => return,
        };
        let reason = format!("parent {} {:?}", event.source, event.kind);
        if let Err(e) = self.apply_transition(child, next, Some(reason), TriggerType::Cascade) {
            warn!(node_id = %child, error = %e, "Failed to follow parent transition");
        }
    }

    /// Upward cascade: compaction, progress averaging, derived terminal status.
    fn on_child_event(&mut self, parent: &str, event: &NodeEvent) {
        match event.kind {
            NodeEventKind::ProgressChanged | NodeEventKind::Retried => self.recompute_progress(parent),
            kind if kind.is_terminal() => {
                // a failed child with retries left stays live until the parent settles
                if self.config.compact_completed_children && !self.is_retryable(&event.source) {
                    self.compact_child(parent, &event.source);
                }
                self.recompute_progress(parent);
                self.evaluate_cascade(parent);
            }
            _ => {}
        }
    }

    fn child_state(&self, slot: &ChildSlot) -> (NodeStatus, u8) {
        match slot {
            ChildSlot::Placeholder(p) => (p.status, 100),
            ChildSlot::Live(id) => match self.entries.get(id) {
                Some(TreeEntry::Live(node)) => (node.status, node.progress),
                Some(TreeEntry::Placeholder(p)) => (p.status, 100),
                None => (NodeStatus::Pending, 0),
            },
        }
    }

    fn recompute_progress(&mut self, parent: &str) {
        let Ok(node) = self.live(parent) else { return };
        if node.status.is_terminal() || node.children.is_empty() {
            return;
        }
        let total: u32 = node
            .children
            .iter()
            .map(|slot| self.child_state(slot).1 as u32)
            .sum();
        let average = (total as f64 / node.children.len() as f64).round() as u8;
        if average == node.progress {
            return;
        }
        if let Ok(node) = self.live_mut(parent) {
            node.progress = average;
            node.updated_at = Utc::now();
        }
        self.emit(parent, NodeEventKind::ProgressChanged);
    }

    fn evaluate_cascade(&mut self, parent: &str) {
        let Ok(node) = self.live(parent) else { return };
        if node.status.is_terminal() {
            return;
        }
        let statuses: Vec<NodeStatus> = node
            .children
            .iter()
            .map(|slot| self.child_state(slot).0)
            .collect();
        debug_assert!(!statuses.is_empty(), "cascade evaluated for a node without children");
        if statuses.is_empty() || !statuses.iter().all(|s| s.is_terminal()) {
            return;
        }

        let derived = if statuses.iter().all(|s| *s == NodeStatus::Success) {
            NodeStatus::Success
        } else if statuses.iter().all(|s| *s == NodeStatus::Failed) {
            NodeStatus::Failed
        } else {
            NodeStatus::Completed
        };

        if self.config.compact_completed_children {
            let held: Vec<NodeId> = node
                .children
                .iter()
                .filter(|c| c.is_live())
                .map(|c| c.id().to_string())
                .collect();
            for child in held {
                self.compact_child(parent, &child);
            }
            self.recompute_progress(parent);
        }
        let reason = format!("derived from {} terminal children", statuses.len());
        if let Err(e) = self.apply_transition(parent, derived, Some(reason), TriggerType::Cascade) {
            warn!(node_id = %parent, error = %e, "Cascade transition failed");
        }
    }

    fn compact_child(&mut self, parent: &str, child_id: &str) -> bool {
        let Some(position) = self
            .node(parent)
            .and_then(|p| p.children.iter().position(|c| c.is_live() && c.id() == child_id))
        else {
            return false;
        };
        if !matches!(self.entries.get(child_id), Some(TreeEntry::Live(n)) if n.status.is_terminal()) {
            return false;
        }

        let former_descendants = self.descendant_ids(child_id);
        let descendant_count = self.count_nodes(child_id).saturating_sub(1);
        let Some(TreeEntry::Live(mut child)) = self.entries.remove(child_id) else {
            return false;
        };

        // release the subtree and tear down both directions of the cascade wiring
        child.children.clear();
        child.bus.clear();
        child.executor = None;
        child.context = None;
        child.parent_id = None;
        let retained = &self.config.retained_metadata_keys;
        child.metadata.retain(|k, _| retained.contains(k));
        child.history.truncate(1);

        let residual = child.residual_references();
        if !residual.is_empty() {
            warn!(node_id = %child_id, ?residual, "Possible leak: references remain after compaction");
        }

        let placeholder = child.to_placeholder(descendant_count);
        if let Ok(parent_node) = self.live_mut(parent) {
            parent_node.bus.unsubscribe_node(child_id);
            parent_node.children[position] = ChildSlot::Placeholder(placeholder.clone());
        }
        self.entries
            .insert(child_id.to_string(), TreeEntry::Placeholder(placeholder));
        debug!(node_id = %child_id, parent_id = %parent, descendants = descendant_count, "Task node compacted into placeholder");

        self.effects.push(ForestEffect::Compacted {
            node_id: child_id.to_string(),
            former_descendants,
        });
        true
    }

    fn descendant_ids(&self, id: &str) -> Vec<NodeId> {
        let mut ids = Vec::new();
        if let Some(node) = self.node(id) {
            for slot in &node.children {
                ids.push(slot.id().to_string());
                if let ChildSlot::Live(child) = slot {
                    ids.extend(self.descendant_ids(child));
                }
            }
        }
        ids
    }

    fn slot_size(&self, slot: &ChildSlot) -> usize {
        match slot {
            ChildSlot::Placeholder(p) => 1 + p.descendant_count,
            ChildSlot::Live(id) => self.count_nodes(id),
        }
    }

    fn complete_tree(&mut self, root_id: &str) {
        let Ok(root) = self.live_mut(root_id) else { return };
        if root.tree_completion_emitted {
            return;
        }
        root.tree_completion_emitted = true;
        let status = root.status;
        let context = root.context.clone();

        let Some(tree) = self.tree_snapshot(root_id) else { return };
        let total_tasks = self.count_nodes(root_id);
        if let Some(context) = context {
            context.clear();
        }
        info!(root_id = %root_id, %status, total_tasks, "Task tree completed");

        self.effects.push(ForestEffect::TreeCompleted(TreeCompletion {
            root_id: root_id.to_string(),
            status,
            total_tasks,
            tree,
            completed_at: Utc::now(),
        }));
    }
}

fn placeholder_snapshot(p: &TaskNodePlaceholder) -> TreeSnapshot {
    TreeSnapshot {
        id: p.id.clone(),
        name: p.name.clone(),
        status: p.status,
        progress: p.progress,
        placeholder: true,
        children: Vec::new(),
    }
}

fn invoke_hook(
    executor: &dyn Executor,
    from: NodeStatus,
    to: NodeStatus,
    node: &TaskNodeSnapshot,
    ctx: &SharedContext,
) {
    let (hook, result) = match to {
        NodeStatus::Running if from == NodeStatus::Paused => ("on_resume", executor.on_resume(node, ctx)),
        NodeStatus::Running => ("on_start", executor.on_start(node, ctx)),
        NodeStatus::Paused => ("on_pause", executor.on_pause(node, ctx)),
        NodeStatus::Success => ("on_success", executor.on_success(node, ctx)),
        NodeStatus::Failed => ("on_fail", executor.on_fail(node, ctx)),
        NodeStatus::Cancelled => ("on_cancel", executor.on_cancel(node, ctx)),
        NodeStatus::Completed => ("on_complete", executor.on_complete(node, ctx)),
        NodeStatus::Pending => return,
    };
    if let Err(e) = result {
        warn!(node_id = %node.id, executor = executor.name(), hook, error = %e, "Executor hook failed; transition stands");
    }
}
