use thiserror::Error;
use uuid::Uuid;

use crate::tree::status::NodeStatus;

/// Engine-local errors. Raised synchronously on API misuse and never retried.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task node {0} not found")]
    NodeNotFound(String),

    #[error("task node {0} already exists")]
    DuplicateNode(String),

    #[error("task node {id} is a placeholder and can no longer change state")]
    NodeCompacted { id: String },

    #[error("invalid transition for task node {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("task node {id} has live children; {to} is derived from its children (current status {current})")]
    NodeHasChildren {
        id: String,
        current: NodeStatus,
        to: NodeStatus,
    },

    #[error("task node {id} cannot retry from status {current}")]
    RetryNotAllowed { id: String, current: NodeStatus },

    #[error("task node {id} cannot retry: parent {parent} already settled as {parent_status}")]
    ParentSettled {
        id: String,
        parent: String,
        parent_status: NodeStatus,
    },

    #[error("task node {id} reached max retries ({max})")]
    MaxRetriesExceeded { id: String, max: u32 },

    #[error("parent {parent} of task node {child} cannot accept children: {reason}")]
    InvalidParent {
        parent: String,
        child: String,
        reason: String,
    },

    #[error("task node {id} has progress only derived from its children")]
    DerivedProgress { id: String },

    #[error("executor '{0}' is not registered")]
    ExecutorNotFound(String),

    #[error("slot queue is full ({0} waiting requests)")]
    SlotQueueFull(usize),

    #[error("admission request {0} was withdrawn before a slot was granted")]
    AdmissionWithdrawn(Uuid),

    #[error("scheduled task {0} not found")]
    TaskNotFound(Uuid),

    #[error("scheduled task {0} timed out after {1:?}")]
    TaskTimedOut(Uuid, std::time::Duration),

    #[error("{0} is shutting down")]
    ShuttingDown(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
