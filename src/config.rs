use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::retry::classifier::ErrorType;

/// 引擎配置 (Engine configuration)
/// Every section falls back to its defaults, so a partial YAML file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub tree: TreeConfig,
    pub scheduler: SchedulerConfig,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,
    pub lease: LeaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TreeConfig {
    /// Transition history entries kept per live node.
    pub max_history_entries: usize,
    /// Replace terminal children with placeholders.
    pub compact_completed_children: bool,
    /// Default retry budget for nodes created without one.
    pub default_max_retries: u32,
    /// Metadata keys that survive placeholder conversion.
    pub retained_metadata_keys: Vec<String>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_history_entries: 50,
            compact_completed_children: true,
            default_max_retries: 3,
            retained_metadata_keys: vec!["retry_attempts".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub tick_interval_ms: u64,
    pub default_max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Per-task wall clock limit handed to the execution caller. `None` disables it.
    pub task_timeout_ms: Option<u64>,
    /// Finished task records kept for inspection.
    pub finished_history: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            tick_interval_ms: 100,
            default_max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            task_timeout_ms: None,
            finished_history: 200,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent_workflows: usize,
    /// Per workflow instance.
    pub max_concurrent_nodes: usize,
    /// Per node of a workflow instance.
    pub max_concurrent_tasks: usize,
    pub max_queue_size: usize,
    pub max_memory_percent: f64,
    pub max_cpu_percent: f64,
    pub monitor_interval_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            max_concurrent_nodes: 20,
            max_concurrent_tasks: 50,
            max_queue_size: 1_000,
            max_memory_percent: 85.0,
            max_cpu_percent: 90.0,
            monitor_interval_ms: 5_000,
        }
    }
}

impl ConcurrencyConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub jitter: bool,
    /// Overrides of the per-class max retry constants.
    pub max_retries: HashMap<ErrorType, u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            jitter: true,
            max_retries: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LeaseConfig {
    pub renewal_interval_ms: u64,
    pub lease_extension_ms: u64,
    pub max_retry_attempts: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            renewal_interval_ms: 30_000,
            lease_extension_ms: 60_000,
            max_retry_attempts: 3,
        }
    }
}

impl LeaseConfig {
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_millis(self.renewal_interval_ms.max(1))
    }

    pub fn lease_extension(&self) -> Duration {
        Duration::from_millis(self.lease_extension_ms)
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(yaml).context("Failed to deserialize engine configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {}", path.display()))?;
        Self::from_yaml_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Reads `TREEFLOW_*` variables from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(std::env::vars())
    }

    /// Applies `TREEFLOW_*` overrides. Unknown keys are ignored.
    pub fn apply_overrides<I, K, V>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            let Some(name) = key.strip_prefix("TREEFLOW_") else {
                continue;
            };
            match name {
                "MAX_CONCURRENT_WORKFLOWS" => self.concurrency.max_concurrent_workflows = parse(key, value)?,
                "MAX_CONCURRENT_NODES" => self.concurrency.max_concurrent_nodes = parse(key, value)?,
                "MAX_CONCURRENT_TASKS" => self.concurrency.max_concurrent_tasks = parse(key, value)?,
                "MAX_QUEUE_SIZE" => self.concurrency.max_queue_size = parse(key, value)?,
                "MAX_MEMORY_PERCENT" => self.concurrency.max_memory_percent = parse(key, value)?,
                "MAX_CPU_PERCENT" => self.concurrency.max_cpu_percent = parse(key, value)?,
                "RENEWAL_INTERVAL_MS" => self.lease.renewal_interval_ms = parse(key, value)?,
                "LEASE_EXTENSION_MS" => self.lease.lease_extension_ms = parse(key, value)?,
                "LEASE_MAX_RETRY_ATTEMPTS" => self.lease.max_retry_attempts = parse(key, value)?,
                "SCHEDULER_TICK_MS" => self.scheduler.tick_interval_ms = parse(key, value)?,
                "SCHEDULER_MAX_CONCURRENT" => self.scheduler.max_concurrent = parse(key, value)?,
                "SCHEDULER_MAX_RETRIES" => self.scheduler.default_max_retries = parse(key, value)?,
                "RETRY_JITTER" => self.retry.jitter = parse(key, value)?,
                other => {
                    if let Some(class) = other.strip_prefix("RETRY_MAX_") {
                        if let Some(error_type) = ErrorType::parse(class) {
                            self.retry.max_retries.insert(error_type, parse(key, value)?);
                        }
                    }
                }
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.concurrency.max_concurrent_workflows == 0, "concurrency.max_concurrent_workflows must be > 0"),
            (self.concurrency.max_concurrent_nodes == 0, "concurrency.max_concurrent_nodes must be > 0"),
            (self.concurrency.max_concurrent_tasks == 0, "concurrency.max_concurrent_tasks must be > 0"),
            (self.scheduler.max_concurrent == 0, "scheduler.max_concurrent must be > 0"),
            (self.tree.max_history_entries == 0, "tree.max_history_entries must be > 0"),
            (
                !(0.0..=100.0).contains(&self.concurrency.max_memory_percent),
                "concurrency.max_memory_percent must be within 0..=100",
            ),
            (
                !(0.0..=100.0).contains(&self.concurrency.max_cpu_percent),
                "concurrency.max_cpu_percent must be within 0..=100",
            ),
        ];
        for (failed, message) in checks {
            if failed {
                return Err(crate::error::EngineError::Config(message.to_string()).into());
            }
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", value, key, e))
}
