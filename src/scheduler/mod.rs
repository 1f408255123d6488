pub mod queue;
#[allow(clippy::module_inception)]
pub mod scheduler;
pub mod task;

pub use queue::PriorityQueue;
pub use scheduler::{EscalationHandler, PriorityScheduler};
pub use task::{job_fn, Job, QueuedTask, QueuedTaskStatus, SchedulerStats, TaskDefinition, TaskFilter, TaskTicket};
