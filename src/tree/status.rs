use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Running,
    Paused,
    Success,
    Failed,
    Cancelled,
    /// Mixed outcome of a parent's children.
    Completed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "PENDING",
            NodeStatus::Running => "RUNNING",
            NodeStatus::Paused => "PAUSED",
            NodeStatus::Success => "SUCCESS",
            NodeStatus::Failed => "FAILED",
            NodeStatus::Cancelled => "CANCELLED",
            NodeStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(NodeStatus::Pending),
            "RUNNING" => Some(NodeStatus::Running),
            "PAUSED" => Some(NodeStatus::Paused),
            "SUCCESS" => Some(NodeStatus::Success),
            "FAILED" => Some(NodeStatus::Failed),
            "CANCELLED" => Some(NodeStatus::Cancelled),
            "COMPLETED" => Some(NodeStatus::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Failed | NodeStatus::Cancelled | NodeStatus::Completed
        )
    }

    /// Transitions a caller may request directly.
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Completed)
                | (Paused, Running)
                | (Paused, Failed)
                | (Paused, Cancelled)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Cascade,
    Executor,
    Retry,
    Recovery,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerType::Manual => "manual",
            TriggerType::Cascade => "cascade",
            TriggerType::Executor => "executor",
            TriggerType::Retry => "retry",
            TriggerType::Recovery => "recovery",
        };
        f.write_str(s)
    }
}
