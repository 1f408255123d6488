use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;

/// Point-in-time resource usage, in percent of capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub memory_percent: f64,
    pub cpu_percent: f64,
}

pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Samples host memory and global CPU usage with `sysinfo`.
///
/// CPU usage is the delta since the previous sample, so the first reading is approximate.
pub struct SysinfoProbe {
    sys: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();
        Self { sys: Mutex::new(sys) }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&self) -> ResourceUsage {
        let mut sys = self.sys.lock();
        sys.refresh_memory();
        sys.refresh_cpu();
        let total = sys.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            sys.used_memory() as f64 / total as f64 * 100.0
        };
        ResourceUsage {
            memory_percent,
            cpu_percent: sys.global_cpu_info().cpu_usage() as f64,
        }
    }
}

/// A probe whose readings are set by hand.
#[derive(Default)]
pub struct FixedProbe {
    usage: Mutex<ResourceUsage>,
}

impl FixedProbe {
    pub fn new(memory_percent: f64, cpu_percent: f64) -> Self {
        Self {
            usage: Mutex::new(ResourceUsage {
                memory_percent,
                cpu_percent,
            }),
        }
    }

    pub fn set(&self, memory_percent: f64, cpu_percent: f64) {
        *self.usage.lock() = ResourceUsage {
            memory_percent,
            cpu_percent,
        };
    }
}

impl ResourceProbe for FixedProbe {
    fn sample(&self) -> ResourceUsage {
        *self.usage.lock()
    }
}
