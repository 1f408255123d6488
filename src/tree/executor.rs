use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::tree::context::SharedContext;
use crate::tree::node::TaskNodeSnapshot;

/// 执行器接口：节点生命周期钩子
///
/// Hooks run synchronously inside the state transition that triggered them.
/// A hook error is logged and swallowed; it never blocks or reverses the transition.
/// Hooks must not call back into the tree service.
#[async_trait]
pub trait Executor: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn on_start(&self, _node: &TaskNodeSnapshot, _ctx: &SharedContext) -> Result<()> {
        Ok(())
    }

    fn on_pause(&self, _node: &TaskNodeSnapshot, _ctx: &SharedContext) -> Result<()> {
        Ok(())
    }

    fn on_resume(&self, _node: &TaskNodeSnapshot, _ctx: &SharedContext) -> Result<()> {
        Ok(())
    }

    fn on_success(&self, _node: &TaskNodeSnapshot, _ctx: &SharedContext) -> Result<()> {
        Ok(())
    }

    fn on_fail(&self, _node: &TaskNodeSnapshot, _ctx: &SharedContext) -> Result<()> {
        Ok(())
    }

    fn on_cancel(&self, _node: &TaskNodeSnapshot, _ctx: &SharedContext) -> Result<()> {
        Ok(())
    }

    fn on_complete(&self, _node: &TaskNodeSnapshot, _ctx: &SharedContext) -> Result<()> {
        Ok(())
    }

    /// The node's actual work, dispatched through the scheduler when the node starts.
    /// `cancel` is signalled when the scheduled task is cancelled; observing it is optional.
    async fn on_run(&self, _node: TaskNodeSnapshot, _ctx: SharedContext, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Whether starting a node bound to this executor dispatches `on_run`.
    fn runs_work(&self) -> bool {
        true
    }
}

pub trait ExecutorRegistry: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Executor>>;
}

#[derive(Default)]
pub struct InMemoryExecutorRegistry {
    executors: DashMap<String, Arc<dyn Executor>>,
}

impl InMemoryExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl ExecutorRegistry for InMemoryExecutorRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(name).map(|e| e.value().clone())
    }
}
