use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::concurrency::resources::{ResourceProbe, ResourceUsage, SysinfoProbe};
use crate::concurrency::slots::{
    Admission, ConcurrencyStats, ExecutionSlot, QueuedAdmission, SlotKind, SlotRequest,
};
use crate::config::ConcurrencyConfig;
use crate::error::{EngineError, Result};
use crate::timer::RecurringTask;

/// Fraction of a resource ceiling at which the monitor starts warning.
const WARN_RATIO: f64 = 0.9;

struct Waiter {
    id: Uuid,
    request: SlotRequest,
    sender: oneshot::Sender<ExecutionSlot>,
}

#[derive(Default)]
struct SlotTable {
    active: HashMap<Uuid, ExecutionSlot>,
    /// Ordered by priority, then arrival.
    queue: VecDeque<Waiter>,
}

impl SlotTable {
    fn admits(&self, request: &SlotRequest, limits: &ConcurrencyConfig) -> bool {
        let active = self.active.values().filter(|s| s.kind == request.kind);
        match request.kind {
            SlotKind::Workflow => {
                let instances: HashSet<&str> = active.map(|s| s.instance_id.as_str()).collect();
                instances.contains(request.instance_id.as_str())
                    || instances.len() < limits.max_concurrent_workflows
            }
            SlotKind::Node => {
                active.filter(|s| s.instance_id == request.instance_id).count() < limits.max_concurrent_nodes
            }
            SlotKind::Task => {
                active
                    .filter(|s| s.instance_id == request.instance_id && s.node_id == request.node_id)
                    .count()
                    < limits.max_concurrent_tasks
            }
        }
    }

    fn enqueue(&mut self, waiter: Waiter) {
        let rank = waiter.request.priority.rank();
        let position = self
            .queue
            .iter()
            .position(|w| w.request.priority.rank() > rank)
            .unwrap_or(self.queue.len());
        self.queue.insert(position, waiter);
    }
}

/// 并发控制管理器：workflow / node / task 三级槽位
pub struct ConcurrencyManager {
    config: ConcurrencyConfig,
    probe: Arc<dyn ResourceProbe>,
    table: Mutex<SlotTable>,
    monitor: Mutex<Option<RecurringTask>>,
    shutdown: CancellationToken,
    me: Weak<ConcurrencyManager>,
}

impl ConcurrencyManager {
    pub fn new(config: ConcurrencyConfig) -> Arc<Self> {
        Self::with_probe(config, Arc::new(SysinfoProbe::new()))
    }

    pub fn with_probe(config: ConcurrencyConfig, probe: Arc<dyn ResourceProbe>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            probe,
            table: Mutex::new(SlotTable::default()),
            monitor: Mutex::new(None),
            shutdown: CancellationToken::new(),
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// Admits immediately when resources and the request's domain allow it, otherwise queues.
    pub fn request_slot(&self, request: SlotRequest) -> Result<Admission> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown("concurrency manager"));
        }
        let usage = self.probe.sample();
        let mut table = self.table.lock();

        let over = self.over_ceiling(&usage);
        if !over && table.admits(&request, &self.config) {
            let slot = ExecutionSlot::grant(request);
            debug!(slot_id = %slot.id, kind = %slot.kind, instance_id = %slot.instance_id, "Slot granted");
            table.active.insert(slot.id, slot.clone());
            return Ok(Admission::Granted(slot));
        }

        if table.queue.len() >= self.config.max_queue_size {
            warn!(queued = table.queue.len(), kind = %request.kind, "Slot queue full, rejecting request");
            return Err(EngineError::SlotQueueFull(table.queue.len()));
        }
        let (sender, receiver) = oneshot::channel();
        let id = Uuid::new_v4();
        debug!(
            request_id = %id,
            kind = %request.kind,
            instance_id = %request.instance_id,
            resource_limited = over,
            "Slot request queued"
        );
        table.enqueue(Waiter { id, request, sender });
        Ok(Admission::Queued(QueuedAdmission {
            id,
            receiver,
            manager: self.me.clone(),
        }))
    }

    /// Waits until a slot is granted.
    pub async fn acquire(&self, request: SlotRequest) -> Result<ExecutionSlot> {
        match self.request_slot(request)? {
            Admission::Granted(slot) => Ok(slot),
            Admission::Queued(waiting) => waiting.wait().await,
        }
    }

    /// Frees a slot and admits queued requests. Returns false for an unknown slot.
    pub fn release(&self, slot_id: Uuid) -> bool {
        let released = self.table.lock().active.remove(&slot_id);
        match released {
            Some(slot) => {
                debug!(slot_id = %slot_id, kind = %slot.kind, instance_id = %slot.instance_id, "Slot released");
                self.drain();
                true
            }
            None => false,
        }
    }

    /// Withdraws a queued request. Returns false when it is no longer queued.
    pub fn cancel_request(&self, request_id: Uuid) -> bool {
        let mut table = self.table.lock();
        let before = table.queue.len();
        table.queue.retain(|w| w.id != request_id);
        before != table.queue.len()
    }

    /// Admits from the head of the queue until a request does not fit. Returns the number admitted.
    pub fn drain(&self) -> usize {
        let usage = self.probe.sample();
        let over = self.over_ceiling(&usage);
        let mut table = self.table.lock();
        let mut granted = 0;

        while let Some(head) = table.queue.front() {
            if head.sender.is_closed() {
                table.queue.pop_front();
                continue;
            }
            if over || !table.admits(&head.request, &self.config) {
                break;
            }
            let Some(waiter) = table.queue.pop_front() else { break };
            let slot = ExecutionSlot::grant(waiter.request);
            let slot_id = slot.id;
            if waiter.sender.send(slot.clone()).is_ok() {
                debug!(slot_id = %slot_id, request_id = %waiter.id, "Queued slot request admitted");
                table.active.insert(slot_id, slot);
                granted += 1;
            }
        }
        granted
    }

    pub fn stats(&self) -> ConcurrencyStats {
        let usage = self.probe.sample();
        let table = self.table.lock();
        let count = |kind: SlotKind| table.active.values().filter(|s| s.kind == kind).count();
        let active_workflows = table
            .active
            .values()
            .filter(|s| s.kind == SlotKind::Workflow)
            .map(|s| s.instance_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        ConcurrencyStats {
            active_workflows,
            active_node_slots: count(SlotKind::Node),
            active_task_slots: count(SlotKind::Task),
            queued: table.queue.len(),
            memory_percent: usage.memory_percent,
            cpu_percent: usage.cpu_percent,
        }
    }

    /// Starts the periodic resource monitor. A second call is a no-op.
    pub fn start_monitor(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let manager = Arc::downgrade(self);
        *monitor = Some(RecurringTask::spawn(
            "concurrency-monitor",
            self.config.monitor_interval(),
            &self.shutdown,
            move || {
                let manager = manager.clone();
                async move {
                    let Some(manager) = manager.upgrade() else {
                        return ControlFlow::Break(());
                    };
                    manager.check_resources();
                    ControlFlow::Continue(())
                }
            },
        ));
        info!(interval_ms = self.config.monitor_interval_ms, "Resource monitor started");
    }

    /// One monitor pass: warn near the ceilings, then give queued requests a chance.
    pub fn check_resources(&self) -> ResourceUsage {
        let usage = self.probe.sample();
        let memory_ceiling = self.config.max_memory_percent;
        let cpu_ceiling = self.config.max_cpu_percent;
        if usage.memory_percent >= memory_ceiling * WARN_RATIO {
            warn!(memory_percent = usage.memory_percent, ceiling = memory_ceiling, "Memory usage near ceiling");
        }
        if usage.cpu_percent >= cpu_ceiling * WARN_RATIO {
            warn!(cpu_percent = usage.cpu_percent, ceiling = cpu_ceiling, "CPU usage near ceiling");
        }
        self.drain();
        usage
    }

    /// Stops the monitor and refuses new requests. Waiting requests fail with `AdmissionWithdrawn`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.cancel();
        }
        let dropped = {
            let mut table = self.table.lock();
            let dropped = table.queue.len();
            table.queue.clear();
            dropped
        };
        info!(dropped, "Concurrency manager shut down");
    }

    fn over_ceiling(&self, usage: &ResourceUsage) -> bool {
        usage.memory_percent > self.config.max_memory_percent || usage.cpu_percent > self.config.max_cpu_percent
    }
}
