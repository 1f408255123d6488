pub mod context;
pub mod events;
pub mod executor;
pub mod forest;
pub mod node;
pub mod recovery;
pub mod service;
pub mod status;

pub use context::SharedContext;
pub use events::{NodeEvent, NodeEventKind, NodeListener, SubscriptionId};
pub use executor::{Executor, ExecutorRegistry, InMemoryExecutorRegistry};
pub use forest::{ForestEffect, RetryOptions, TaskForest};
pub use node::{NodeId, NodeSpec, NodeView, TaskNodePlaceholder, TaskNodeSnapshot, TreeCompletion, TreeSnapshot};
pub use recovery::{RecoveryError, RecoveryReport};
pub use service::{TaskTreeService, TreeListener, TreeServiceBuilder};
pub use status::{NodeStatus, TriggerType};
