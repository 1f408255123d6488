pub mod manager;
pub mod resources;
pub mod slots;

pub use manager::ConcurrencyManager;
pub use resources::{FixedProbe, ResourceProbe, ResourceUsage, SysinfoProbe};
pub use slots::{Admission, ConcurrencyStats, ExecutionSlot, QueuedAdmission, SlotKind, SlotRequest};
