use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::concurrency::manager::ConcurrencyManager;
use crate::config::SchedulerConfig;
use crate::error::{EngineError, Result};
use crate::retry::classifier::{ErrorClassifier, ErrorHandlingDecision, ErrorKey};
use crate::retry::policy::apply_jitter;
use crate::scheduler::queue::PriorityQueue;
use crate::scheduler::task::{
    QueuedTask, QueuedTaskStatus, SchedulerStats, TaskDefinition, TaskFilter, TaskTicket,
};

/// Called outside the scheduler lock when a failure crosses its class's escalation threshold.
pub type EscalationHandler = Arc<dyn Fn(&QueuedTask, &ErrorHandlingDecision) + Send + Sync>;

struct Entry {
    record: QueuedTask,
    definition: TaskDefinition,
    waiters: Vec<oneshot::Sender<QueuedTask>>,
    cancel: CancellationToken,
    retry_timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct SchedulerState {
    /// Pending, running and retrying tasks.
    tasks: HashMap<Uuid, Entry>,
    queue: PriorityQueue,
    in_flight: usize,
    finished: VecDeque<QueuedTask>,
    completed: u64,
    failed: u64,
    cancelled: u64,
}

impl SchedulerState {
    /// Moves a task out of the active table and resolves its tickets.
    fn finalize(&mut self, id: Uuid, history_limit: usize) -> Option<QueuedTask> {
        let mut entry = self.tasks.remove(&id)?;
        let now = Utc::now();
        entry.record.updated_at = now;
        entry.record.finished_at = Some(now);
        if let Some(timer) = entry.retry_timer.take() {
            timer.abort();
        }
        match entry.record.status {
            QueuedTaskStatus::Completed => self.completed += 1,
            QueuedTaskStatus::Failed => self.failed += 1,
            QueuedTaskStatus::Cancelled => self.cancelled += 1,
            _ => {}
        }
        for waiter in entry.waiters.drain(..) {
            let _ = waiter.send(entry.record.clone());
        }
        self.finished.push_front(entry.record.clone());
        self.finished.truncate(history_limit);
        Some(entry.record)
    }
}

/// 优先级调度器
///
/// Tasks wait in a FIFO-per-priority queue. A dispatch loop, woken on a fixed
/// tick and whenever work is scheduled or finishes, pulls from the head while
/// fewer than `max_concurrent` tasks are in flight. Each task runs on its own
/// spawned future: optional slot admission, then the job raced against its
/// timeout, then classification of any failure into retry or final failure.
pub struct PriorityScheduler {
    config: SchedulerConfig,
    classifier: Arc<ErrorClassifier>,
    concurrency: Option<Arc<ConcurrencyManager>>,
    state: Mutex<SchedulerState>,
    wake: Arc<Notify>,
    started: AtomicBool,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    escalation: RwLock<Option<EscalationHandler>>,
    me: Weak<PriorityScheduler>,
}

impl PriorityScheduler {
    pub fn new(
        config: SchedulerConfig,
        classifier: Arc<ErrorClassifier>,
        concurrency: Option<Arc<ConcurrencyManager>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            classifier,
            concurrency,
            state: Mutex::new(SchedulerState::default()),
            wake: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            dispatcher: Mutex::new(None),
            escalation: RwLock::new(None),
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    pub fn set_escalation_handler(&self, handler: EscalationHandler) {
        *self.escalation.write() = Some(handler);
    }

    /// Starts the dispatch loop. Later calls are no-ops.
    pub fn start(&self) {
        if self.shutdown.is_cancelled() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let me = self.me.clone();
        let shutdown = self.shutdown.clone();
        let wake = self.wake.clone();
        let tick = self.config.tick_interval();
        let handle = tokio::spawn(async move {
            info!(tick_ms = tick.as_millis() as u64, "Scheduler dispatch loop started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                }
                let Some(scheduler) = me.upgrade() else { break };
                scheduler.dispatch_ready();
            }
            info!("Scheduler dispatch loop stopped");
        });
        *self.dispatcher.lock() = Some(handle);
    }

    /// Queues a task and starts the dispatch loop if needed.
    pub fn schedule(&self, definition: TaskDefinition) -> Result<TaskTicket> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown("scheduler"));
        }
        self.start();

        let now = Utc::now();
        let id = Uuid::new_v4();
        let record = QueuedTask {
            id,
            name: definition.name.clone(),
            owner: definition.owner.clone(),
            status: QueuedTaskStatus::Pending,
            priority: definition.priority,
            retry_count: 0,
            max_retries: definition.max_retries.unwrap_or(self.config.default_max_retries),
            last_error: None,
            error_type: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        };
        let (sender, receiver) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.queue.push(id, definition.priority);
            state.tasks.insert(
                id,
                Entry {
                    record,
                    definition,
                    waiters: vec![sender],
                    cancel: self.shutdown.child_token(),
                    retry_timer: None,
                },
            );
        }
        debug!(task_id = %id, "Task scheduled");
        self.wake.notify_one();
        Ok(TaskTicket { id, receiver })
    }

    /// Pending and retrying tasks are dropped; a running task is marked cancelled and its token signalled.
    /// Returns false when the task already finished.
    pub fn cancel(&self, id: Uuid) -> Result<bool> {
        let history_limit = self.config.finished_history;
        let mut state = self.state.lock();
        let Some(entry) = state.tasks.get_mut(&id) else {
            return if state.finished.iter().any(|t| t.id == id) {
                Ok(false)
            } else {
                Err(EngineError::TaskNotFound(id))
            };
        };

        let previous = entry.record.status;
        entry.record.status = QueuedTaskStatus::Cancelled;
        entry.record.updated_at = Utc::now();
        entry.cancel.cancel();
        match previous {
            QueuedTaskStatus::Pending | QueuedTaskStatus::Retrying => {
                state.queue.remove(id);
                state.finalize(id, history_limit);
            }
            QueuedTaskStatus::Running => {}
            _ => return Ok(false),
        }
        info!(task_id = %id, from = %previous, "Task cancelled");
        Ok(true)
    }

    pub fn get(&self, id: Uuid) -> Option<QueuedTask> {
        let state = self.state.lock();
        state
            .tasks
            .get(&id)
            .map(|e| e.record.clone())
            .or_else(|| state.finished.iter().find(|t| t.id == id).cloned())
    }

    /// Active and recently finished tasks matching `filter`: running, then pending, then the rest;
    /// within each group by priority, then creation time.
    pub fn list(&self, filter: &TaskFilter) -> Vec<QueuedTask> {
        let state = self.state.lock();
        let mut tasks: Vec<QueuedTask> = state
            .tasks
            .values()
            .map(|e| &e.record)
            .chain(state.finished.iter())
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.status
                .list_rank()
                .cmp(&b.status.list_rank())
                .then(a.priority.rank().cmp(&b.priority.rank()))
                .then(a.created_at.cmp(&b.created_at))
        });
        tasks
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        let count = |status| state.tasks.values().filter(|e| e.record.status == status).count();
        SchedulerStats {
            pending: count(QueuedTaskStatus::Pending),
            running: count(QueuedTaskStatus::Running),
            retrying: count(QueuedTaskStatus::Retrying),
            completed: state.completed,
            failed: state.failed,
            cancelled: state.cancelled,
        }
    }

    /// Delay before re-queueing after `retry_count` earlier retries.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let base = self.config.retry_base_delay();
        let factor = 2u32.saturating_pow(retry_count.min(31));
        base.saturating_mul(factor).min(self.config.retry_max_delay())
    }

    /// [`backoff_delay`](Self::backoff_delay), jittered when the classifier is configured to.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let delay = self.backoff_delay(retry_count);
        if self.classifier.jitter() { apply_jitter(delay) } else { delay }
    }

    /// Stops the dispatch loop, cancels queued work and signals running jobs.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
        let history_limit = self.config.finished_history;
        let mut state = self.state.lock();
        let waiting: Vec<Uuid> = state
            .tasks
            .iter()
            .filter(|(_, e)| e.record.status != QueuedTaskStatus::Running)
            .map(|(id, _)| *id)
            .collect();
        for id in &waiting {
            if let Some(entry) = state.tasks.get_mut(id) {
                entry.record.status = QueuedTaskStatus::Cancelled;
            }
            state.finalize(*id, history_limit);
        }
        state.queue.clear();
        info!(cancelled = waiting.len(), running = state.in_flight, "Scheduler shut down");
    }

    fn dispatch_ready(&self) {
        loop {
            let (id, definition, cancel) = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if state.in_flight >= self.config.max_concurrent {
                    return;
                }
                let Some(id) = state.queue.pop() else { return };
                let Some(entry) = state.tasks.get_mut(&id) else { continue };
                let now = Utc::now();
                entry.record.status = QueuedTaskStatus::Running;
                entry.record.started_at.get_or_insert(now);
                entry.record.updated_at = now;
                state.in_flight += 1;
                (id, entry.definition.clone(), entry.cancel.clone())
            };
            let Some(me) = self.me.upgrade() else { return };
            debug!(task_id = %id, name = %definition.name, "Dispatching task");
            tokio::spawn(async move { me.execute(id, definition, cancel).await });
        }
    }

    async fn execute(self: Arc<Self>, id: Uuid, definition: TaskDefinition, cancel: CancellationToken) {
        let slot = match (&definition.admission, &self.concurrency) {
            (Some(request), Some(manager)) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.finish(id, Err(anyhow::anyhow!("cancelled while waiting for admission")));
                        return;
                    }
                    admitted = manager.acquire(request.clone()) => match admitted {
                        Ok(slot) => Some(slot),
                        Err(e) => {
                            self.finish(id, Err(e.into()));
                            return;
                        }
                    }
                }
            }
            _ => None,
        };

        let timeout = definition.timeout.or(self.config.task_timeout());
        let run = definition.job.run(cancel);
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::TaskTimedOut(id, limit).into()),
            },
            None => run.await,
        };

        if let (Some(slot), Some(manager)) = (slot, &self.concurrency) {
            manager.release(slot.id);
        }
        self.finish(id, result);
    }

    fn finish(&self, id: Uuid, result: anyhow::Result<()>) {
        let history_limit = self.config.finished_history;
        let mut escalation = None;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.in_flight = state.in_flight.saturating_sub(1);
            let Some(entry) = state.tasks.get_mut(&id) else {
                drop(guard);
                self.wake.notify_one();
                return;
            };
            // a per-task key dies with its task; a shared key keeps counting until a success
            let shared_key = entry.definition.error_key.is_some();
            let key = entry.definition.error_key.clone().unwrap_or_else(|| {
                ErrorKey::new(entry.record.owner.clone().unwrap_or_else(|| "scheduler".to_string()))
                    .task(id.to_string())
            });
            entry.record.updated_at = Utc::now();

            if entry.record.status == QueuedTaskStatus::Cancelled {
                if !shared_key {
                    self.classifier.reset(&key);
                }
                state.finalize(id, history_limit);
            } else {
                match result {
                    Ok(()) => {
                        entry.record.status = QueuedTaskStatus::Completed;
                        self.classifier.reset(&key);
                        info!(task_id = %id, name = %entry.record.name, "Task completed");
                        state.finalize(id, history_limit);
                    }
                    Err(e) => {
                        let decision = self.classifier.handle_error(&e, &key);
                        entry.record.last_error = Some(format!("{:#}", e));
                        entry.record.error_type = Some(decision.error_type);

                        if decision.should_retry
                            && entry.record.retry_count < entry.record.max_retries
                            && !self.shutdown.is_cancelled()
                        {
                            let delay = self.retry_delay(entry.record.retry_count);
                            entry.record.retry_count += 1;
                            entry.record.status = QueuedTaskStatus::Retrying;
                            warn!(
                                task_id = %id,
                                error_type = %decision.error_type,
                                %key,
                                retry = entry.record.retry_count,
                                max_retries = entry.record.max_retries,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Task failed, retrying"
                            );
                            entry.retry_timer = Some(self.spawn_retry(id, delay));
                        } else {
                            entry.record.status = QueuedTaskStatus::Failed;
                            error!(
                                task_id = %id,
                                error_type = %decision.error_type,
                                retries = entry.record.retry_count,
                                error = %e,
                                "Task failed permanently"
                            );
                            if !shared_key {
                                self.classifier.reset(&key);
                            }
                            state.finalize(id, history_limit);
                        }
                        if decision.escalate {
                            let record = state
                                .tasks
                                .get(&id)
                                .map(|e| e.record.clone())
                                .or_else(|| state.finished.front().cloned());
                            escalation = record.map(|r| (r, decision));
                        }
                    }
                }
            }
        }

        if let Some((record, decision)) = escalation {
            warn!(task_id = %record.id, error_type = %decision.error_type, attempt = decision.attempt, "Task failure escalated");
            let handler = self.escalation.read().clone();
            if let Some(handler) = handler {
                handler(&record, &decision);
            }
        }
        self.wake.notify_one();
    }

    fn spawn_retry(&self, id: Uuid, delay: Duration) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = me.upgrade() {
                scheduler.requeue(id);
            }
        })
    }

    fn requeue(&self, id: Uuid) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(entry) = state.tasks.get_mut(&id) else { return };
            if entry.record.status != QueuedTaskStatus::Retrying {
                return;
            }
            entry.record.status = QueuedTaskStatus::Pending;
            entry.record.updated_at = Utc::now();
            entry.retry_timer = None;
            state.queue.push(id, entry.record.priority);
        }
        debug!(task_id = %id, "Task re-queued after backoff");
        self.wake.notify_one();
    }
}

impl Drop for PriorityScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
