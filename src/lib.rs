pub mod concurrency;
pub mod config;
pub mod error;
pub mod lease;
pub mod priority;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod timer;
pub mod tree;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use priority::TaskPriority;
