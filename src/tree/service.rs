use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::concurrency::slots::SlotRequest;
use crate::config::TreeConfig;
use crate::error::{EngineError, Result};
use crate::lease::renewal::LeaseRenewalService;
use crate::retry::classifier::ErrorKey;
use crate::scheduler::task::{Job, QueuedTask, QueuedTaskStatus, TaskDefinition};
use crate::scheduler::PriorityScheduler;
use crate::storage::{NoopStatusSink, StatusSyncSink};
use crate::tree::context::SharedContext;
use crate::tree::events::{NodeListener, SubscriptionId};
use crate::tree::executor::{Executor, ExecutorRegistry, InMemoryExecutorRegistry};
use crate::tree::forest::{DispatchPlan, ForestEffect, RetryOptions, TaskForest};
use crate::tree::node::{CreateMode, HistoryEntry, NodeId, NodeSpec, NodeView, TaskNodeSnapshot, TreeCompletion};
use crate::tree::status::TriggerType;

pub type TreeListener = Arc<dyn Fn(&TreeCompletion) + Send + Sync>;

/// Runs a node's executor as a scheduled job.
struct NodeRunJob {
    executor: Arc<dyn Executor>,
    node: TaskNodeSnapshot,
    context: SharedContext,
}

#[async_trait]
impl Job for NodeRunJob {
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.executor
            .on_run(self.node.clone(), self.context.clone(), cancel)
            .await
    }
}

pub struct TreeServiceBuilder {
    config: TreeConfig,
    executors: Arc<dyn ExecutorRegistry>,
    sink: Arc<dyn StatusSyncSink>,
    scheduler: Option<Arc<PriorityScheduler>>,
    leases: Option<(Arc<LeaseRenewalService>, String)>,
}

impl TreeServiceBuilder {
    pub fn config(mut self, config: TreeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn executors(mut self, executors: Arc<dyn ExecutorRegistry>) -> Self {
        self.executors = executors;
        self
    }

    pub fn status_sink(mut self, sink: Arc<dyn StatusSyncSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Executor work is dispatched through this scheduler. Without one it is spawned directly.
    pub fn scheduler(mut self, scheduler: Arc<PriorityScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Roots acquire a lease owned by `owner` when they start, renewed until the tree completes.
    pub fn lease_renewal(mut self, renewal: Arc<LeaseRenewalService>, owner: impl Into<String>) -> Self {
        self.leases = Some((renewal, owner.into()));
        self
    }

    pub fn build(self) -> Arc<TaskTreeService> {
        Arc::new_cyclic(|me| TaskTreeService {
            forest: Mutex::new(TaskForest::new(self.config, self.executors, self.sink)),
            scheduler: self.scheduler,
            leases: self.leases,
            tree_listeners: RwLock::new(Vec::new()),
            runs: DashMap::new(),
            me: me.clone(),
        })
    }
}

/// 任务树服务：节点缓存、创建、恢复与清理
pub struct TaskTreeService {
    forest: Mutex<TaskForest>,
    scheduler: Option<Arc<PriorityScheduler>>,
    leases: Option<(Arc<LeaseRenewalService>, String)>,
    tree_listeners: RwLock<Vec<TreeListener>>,
    /// Scheduled task currently running each node's executor.
    runs: DashMap<NodeId, Uuid>,
    me: Weak<TaskTreeService>,
}

impl TaskTreeService {
    pub fn builder() -> TreeServiceBuilder {
        TreeServiceBuilder {
            config: TreeConfig::default(),
            executors: Arc::new(InMemoryExecutorRegistry::new()),
            sink: Arc::new(NoopStatusSink),
            scheduler: None,
            leases: None,
        }
    }

    pub fn create_node(&self, spec: NodeSpec) -> Result<NodeId> {
        self.with_forest(|forest| forest.create_node(spec, CreateMode::New))
    }

    pub fn get(&self, id: &str) -> Option<NodeView> {
        self.forest.lock().get(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeView> {
        self.forest.lock().find_by_name(name)
    }

    pub fn context(&self, id: &str) -> Option<SharedContext> {
        self.forest.lock().context(id)
    }

    pub fn history(&self, id: &str) -> Vec<HistoryEntry> {
        self.forest
            .lock()
            .node(id)
            .map(|n| n.history().cloned().collect())
            .unwrap_or_default()
    }

    pub fn cached_count(&self) -> usize {
        self.forest.lock().len()
    }

    pub fn live_count(&self) -> usize {
        self.forest.lock().live_count()
    }

    pub fn start(&self, id: &str) -> Result<()> {
        self.with_forest(|forest| forest.start(id))
    }

    pub fn pause(&self, id: &str) -> Result<()> {
        self.with_forest(|forest| forest.pause(id))
    }

    pub fn resume(&self, id: &str) -> Result<()> {
        self.with_forest(|forest| forest.resume(id))
    }

    pub fn succeed(&self, id: &str) -> Result<()> {
        self.with_forest(|forest| forest.succeed(id, TriggerType::Manual))
    }

    pub fn complete(&self, id: &str) -> Result<()> {
        self.with_forest(|forest| forest.complete(id))
    }

    pub fn fail(&self, id: &str, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.with_forest(|forest| forest.fail(id, reason, TriggerType::Manual))
    }

    /// Advisory: an in-flight executor call is only signalled, never interrupted.
    pub fn cancel(&self, id: &str, reason: Option<String>) -> Result<()> {
        self.with_forest(|forest| forest.cancel(id, reason))?;
        if let (Some(scheduler), Some((_, task_id))) = (&self.scheduler, self.runs.remove(id)) {
            if let Err(e) = scheduler.cancel(task_id) {
                debug!(node_id = %id, error = %e, "Scheduled run already gone");
            }
        }
        Ok(())
    }

    /// A failed root stays cached while it has retries left; see [`TaskTreeService::discard`].
    pub fn retry(&self, id: &str, options: RetryOptions) -> Result<()> {
        self.with_forest(|forest| forest.retry(id, options))
    }

    /// Evicts the finished tree holding `id`, typically one kept for retry.
    /// Returns the number of entries removed.
    pub fn discard(&self, id: &str) -> Result<usize> {
        let mut forest = self.forest.lock();
        if !forest.contains(id) {
            return Err(EngineError::NodeNotFound(id.to_string()));
        }
        let root_id = forest.root_of(id);
        let status = forest
            .get(&root_id)
            .ok_or_else(|| EngineError::NodeNotFound(root_id.clone()))?
            .status();
        if !status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                id: root_id,
                from: status,
                to: status,
            });
        }
        let ids = forest.tree_snapshot(&root_id).map(|t| t.ids()).unwrap_or_default();
        Ok(forest.evict(&ids))
    }

    pub fn update_progress(&self, id: &str, progress: u8) -> Result<()> {
        self.with_forest(|forest| forest.update_progress(id, progress))
    }

    pub fn set_metadata(&self, id: &str, key: &str, value: Value) -> Result<()> {
        self.with_forest(|forest| forest.set_metadata(id, key, value))
    }

    pub fn compact(&self, parent_id: &str, child_id: &str) -> Result<bool> {
        self.with_forest(|forest| forest.compact(parent_id, child_id))
    }

    /// Node listeners run under the tree lock and must not call back into the service.
    pub fn subscribe(&self, id: &str, listener: NodeListener) -> Result<SubscriptionId> {
        self.forest.lock().subscribe(id, listener)
    }

    pub fn unsubscribe(&self, id: &str, subscription: SubscriptionId) -> Result<bool> {
        self.forest.lock().unsubscribe(id, subscription)
    }

    /// Tree listeners run after the lock is released and may use the service.
    pub fn on_tree_completed(&self, listener: TreeListener) {
        self.tree_listeners.write().push(listener);
    }

    pub(crate) fn with_forest<T>(&self, op: impl FnOnce(&mut TaskForest) -> Result<T>) -> Result<T> {
        let (result, effects, plans) = {
            let mut forest = self.forest.lock();
            let result = op(&mut forest);
            let effects = forest.take_effects();
            let mut plans = Vec::new();
            for effect in &effects {
                match effect {
                    ForestEffect::Dispatch { node_id } => plans.extend(forest.dispatch_plan(node_id)),
                    ForestEffect::Compacted {
                        node_id,
                        former_descendants,
                    } => {
                        let evicted = forest.evict(former_descendants);
                        debug!(node_id = %node_id, evicted, "Evicted compacted subtree");
                    }
                    ForestEffect::TreeCompleted(completion) if forest.is_retryable(&completion.root_id) => {
                        debug!(root_id = %completion.root_id, "Failed tree kept for retry");
                    }
                    ForestEffect::TreeCompleted(completion) => {
                        let evicted = forest.evict(&completion.tree.ids());
                        debug!(root_id = %completion.root_id, evicted, "Evicted completed tree");
                    }
                    ForestEffect::RootStarted { .. } => {}
                }
            }
            (result, effects, plans)
        };

        for plan in plans {
            self.dispatch(plan);
        }
        for effect in effects {
            match effect {
                ForestEffect::RootStarted { root_id } => self.acquire_lease(root_id),
                ForestEffect::TreeCompleted(completion) => {
                    self.release_lease(&completion.root_id);
                    let listeners = self.tree_listeners.read().clone();
                    for listener in listeners {
                        listener(&completion);
                    }
                }
                _ => {}
            }
        }
        result
    }

    fn dispatch(&self, plan: DispatchPlan) {
        let node_id = plan.node.id.clone();
        let me = self.me.clone();

        let Some(scheduler) = &self.scheduler else {
            tokio::spawn(async move {
                let result = plan
                    .executor
                    .on_run(plan.node, plan.context, CancellationToken::new())
                    .await;
                if let Some(service) = me.upgrade() {
                    service.finish_direct_run(&node_id, result);
                }
            });
            return;
        };

        let priority = plan.node.priority;
        let job = Arc::new(NodeRunJob {
            executor: plan.executor,
            node: plan.node.clone(),
            context: plan.context,
        });
        let definition = TaskDefinition::new(format!("node:{}", plan.node.name), job)
            .owner(plan.root_id.clone())
            .priority(priority)
            .admission(SlotRequest::node(plan.root_id.clone(), node_id.clone(), priority))
            .error_key(ErrorKey::new(plan.root_id).node(node_id.clone()));

        match scheduler.schedule(definition) {
            Ok(ticket) => {
                self.runs.insert(node_id.clone(), ticket.id());
                debug!(node_id = %node_id, task_id = %ticket.id(), "Executor run scheduled");
                tokio::spawn(async move {
                    let outcome = ticket.wait().await;
                    if let Some(service) = me.upgrade() {
                        service.finish_scheduled_run(&node_id, outcome);
                    }
                });
            }
            Err(e) => {
                error!(node_id = %node_id, error = %e, "Failed to schedule executor run");
                if let Err(e) = self.with_forest(|f| f.fail(&node_id, e.to_string(), TriggerType::Executor)) {
                    warn!(node_id = %node_id, error = %e, "Could not mark node failed");
                }
            }
        }
    }

    fn finish_direct_run(&self, node_id: &str, result: anyhow::Result<()>) {
        let outcome = match result {
            Ok(()) => self.with_forest(|f| f.succeed(node_id, TriggerType::Executor)),
            Err(e) => self.with_forest(|f| f.fail(node_id, e.to_string(), TriggerType::Executor)),
        };
        if let Err(e) = outcome {
            debug!(node_id = %node_id, error = %e, "Executor result no longer applies");
        }
    }

    fn finish_scheduled_run(&self, node_id: &str, outcome: Result<QueuedTask>) {
        self.runs.remove(node_id);
        let applied = match outcome {
            Ok(record) => match record.status {
                QueuedTaskStatus::Completed => self.with_forest(|f| f.succeed(node_id, TriggerType::Executor)),
                QueuedTaskStatus::Failed => {
                    let reason = record
                        .last_error
                        .unwrap_or_else(|| "executor failed".to_string());
                    self.with_forest(|f| f.fail(node_id, reason, TriggerType::Executor))
                }
                QueuedTaskStatus::Cancelled => {
                    self.with_forest(|f| f.cancel(node_id, Some("scheduled run cancelled".to_string())))
                }
                other => {
                    warn!(node_id = %node_id, status = %other, "Scheduled run finished in a non-terminal state");
                    Ok(())
                }
            },
            Err(e) => self.with_forest(|f| f.fail(node_id, e.to_string(), TriggerType::Executor)),
        };
        if let Err(e) = applied {
            debug!(node_id = %node_id, error = %e, "Executor result no longer applies");
        }
    }

    fn is_active(&self, id: &str) -> bool {
        self.forest
            .lock()
            .node(id)
            .is_some_and(|n| !n.status().is_terminal())
    }

    fn acquire_lease(&self, root_id: NodeId) {
        let Some((renewal, owner)) = self.leases.clone() else { return };
        let me = self.me.clone();
        tokio::spawn(async move {
            let ttl = renewal.config().lease_extension();
            match renewal.store().acquire(&root_id, &owner, ttl).await {
                Ok(true) => {
                    let still_active = me.upgrade().is_some_and(|s| s.is_active(&root_id));
                    if !still_active {
                        let _ = renewal.store().release(&root_id, &owner).await;
                        return;
                    }
                    if let Err(e) = renewal.start(&root_id, &owner) {
                        warn!(root_id = %root_id, error = %e, "Lease renewal not started");
                        return;
                    }
                    // the tree may have completed while renewal was starting
                    if !me.upgrade().is_some_and(|s| s.is_active(&root_id)) {
                        renewal.stop(&root_id);
                        let _ = renewal.store().release(&root_id, &owner).await;
                    }
                }
                Ok(false) => warn!(root_id = %root_id, owner = %owner, "Lease is held by another owner"),
                Err(e) => warn!(root_id = %root_id, error = %e, "Lease acquisition failed"),
            }
        });
    }

    fn release_lease(&self, root_id: &str) {
        let Some((renewal, owner)) = self.leases.clone() else { return };
        renewal.stop(root_id);
        let root_id = root_id.to_string();
        tokio::spawn(async move {
            match renewal.store().release(&root_id, &owner).await {
                Ok(_) => info!(root_id = %root_id, "Lease released"),
                Err(e) => warn!(root_id = %root_id, error = %e, "Lease release failed"),
            }
        });
    }

    pub(crate) fn forest_lock(&self) -> parking_lot::MutexGuard<'_, TaskForest> {
        self.forest.lock()
    }
}

impl std::fmt::Debug for TaskTreeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTreeService")
            .field("cached", &self.cached_count())
            .finish()
    }
}
