use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::tree::node::NodeId;
use crate::tree::status::NodeStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEventKind {
    Started,
    Paused,
    Resumed,
    Succeeded,
    Failed,
    Cancelled,
    Completed,
    ProgressChanged,
    Retried,
}

impl NodeEventKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeEventKind::Succeeded | NodeEventKind::Failed | NodeEventKind::Cancelled | NodeEventKind::Completed
        )
    }

    /// Event published when a node enters `to` from `from`.
    pub fn for_transition(from: NodeStatus, to: NodeStatus) -> Option<Self> {
        match (from, to) {
            (NodeStatus::Paused, NodeStatus::Running) => Some(NodeEventKind::Resumed),
            (_, NodeStatus::Running) => Some(NodeEventKind::Started),
            (_, NodeStatus::Paused) => Some(NodeEventKind::Paused),
            (_, NodeStatus::Success) => Some(NodeEventKind::Succeeded),
            (_, NodeStatus::Failed) => Some(NodeEventKind::Failed),
            (_, NodeStatus::Cancelled) => Some(NodeEventKind::Cancelled),
            (_, NodeStatus::Completed) => Some(NodeEventKind::Completed),
            (NodeStatus::Failed, NodeStatus::Pending) => Some(NodeEventKind::Retried),
            (_, NodeStatus::Pending) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    pub source: NodeId,
    pub status: NodeStatus,
    pub progress: u8,
    pub at: DateTime<Utc>,
}

pub type NodeListener = Arc<dyn Fn(&NodeEvent) + Send + Sync>;

/// 事件订阅者
#[derive(Clone)]
pub enum Subscriber {
    /// Cascade wiring between a parent and one of its children.
    Node(NodeId),
    Listener(NodeListener),
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscriber::Node(id) => f.debug_tuple("Node").field(id).finish(),
            Subscriber::Listener(_) => f.write_str("Listener(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone)]
struct Subscription {
    id: SubscriptionId,
    subscriber: Subscriber,
}

/// Per-node event bus. Delivery is synchronous and in subscription order.
#[derive(Debug, Default)]
pub struct EventBus {
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscriptions.push(Subscription { id, subscriber });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        before != self.subscriptions.len()
    }

    pub fn unsubscribe_node(&mut self, node_id: &str) {
        self.subscriptions
            .retain(|s| !matches!(&s.subscriber, Subscriber::Node(id) if id == node_id));
    }

    /// Snapshot of current subscribers, so delivery can mutate the bus.
    pub fn subscribers(&self) -> Vec<Subscriber> {
        self.subscriptions.iter().map(|s| s.subscriber.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
