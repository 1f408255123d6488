use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LeaseConfig;
use crate::error::{EngineError, Result};
use crate::lease::store::LeaseStore;
use crate::timer::RecurringTask;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaseRenewalRecord {
    pub instance_id: String,
    pub owner_id: String,
    /// Consecutive failed renewals.
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub last_renewal_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Published when renewal gives up on an instance; the lease is left to expire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaseFailure {
    pub instance_id: String,
    pub owner_id: String,
    pub attempts: u32,
    pub error: String,
}

/// 租约自动续期服务
pub struct LeaseRenewalService {
    store: Arc<dyn LeaseStore>,
    config: LeaseConfig,
    records: Arc<DashMap<String, LeaseRenewalRecord>>,
    loops: Mutex<HashMap<String, RecurringTask>>,
    shutdown: CancellationToken,
    failures: broadcast::Sender<LeaseFailure>,
}

impl LeaseRenewalService {
    pub fn new(store: Arc<dyn LeaseStore>, config: LeaseConfig) -> Arc<Self> {
        let (failures, _) = broadcast::channel(64);
        Arc::new(Self {
            store,
            config,
            records: Arc::new(DashMap::new()),
            loops: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            failures,
        })
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<LeaseFailure> {
        self.failures.subscribe()
    }

    /// Begins renewing the lease for `instance_id`. A renewal already running for it is replaced.
    pub fn start(&self, instance_id: &str, owner_id: &str) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown("lease renewal"));
        }
        self.records.insert(
            instance_id.to_string(),
            LeaseRenewalRecord {
                instance_id: instance_id.to_string(),
                owner_id: owner_id.to_string(),
                retry_count: 0,
                started_at: Utc::now(),
                last_renewal_at: None,
                active: true,
            },
        );

        let store = self.store.clone();
        let records = self.records.clone();
        let failures = self.failures.clone();
        let shutdown = self.shutdown.clone();
        let extension = self.config.lease_extension();
        let max_attempts = self.config.max_retry_attempts.max(1);
        let instance = instance_id.to_string();
        let owner = owner_id.to_string();

        let task = RecurringTask::spawn(
            format!("lease-renewal:{}", instance_id),
            self.config.renewal_interval(),
            &self.shutdown,
            move || {
                let store = store.clone();
                let records = records.clone();
                let failures = failures.clone();
                let shutdown = shutdown.clone();
                let instance = instance.clone();
                let owner = owner.clone();
                async move {
                    if shutdown.is_cancelled() {
                        return ControlFlow::Break(());
                    }
                    let outcome = store.renew(&instance, &owner, extension).await;
                    let Some(mut record) = records.get_mut(&instance) else {
                        return ControlFlow::Break(());
                    };
                    if !record.active || record.owner_id != owner {
                        return ControlFlow::Break(());
                    }
                    if outcome.success {
                        record.retry_count = 0;
                        record.last_renewal_at = Some(Utc::now());
                        debug!(instance_id = %instance, owner_id = %owner, "Lease renewed");
                        return ControlFlow::Continue(());
                    }

                    record.retry_count += 1;
                    let attempts = record.retry_count;
                    let reason = outcome.error.unwrap_or_else(|| "renewal rejected".to_string());
                    if attempts < max_attempts {
                        warn!(instance_id = %instance, attempts, max_attempts, error = %reason, "Lease renewal failed");
                        return ControlFlow::Continue(());
                    }

                    record.active = false;
                    drop(record);
                    error!(instance_id = %instance, attempts, error = %reason, "Lease renewal abandoned, lease will expire");
                    let _ = failures.send(LeaseFailure {
                        instance_id: instance,
                        owner_id: owner,
                        attempts,
                        error: reason,
                    });
                    ControlFlow::Break(())
                }
            },
        );

        if let Some(previous) = self.loops.lock().insert(instance_id.to_string(), task) {
            previous.cancel();
        }
        info!(instance_id = %instance_id, owner_id = %owner_id, interval_ms = self.config.renewal_interval_ms, "Lease renewal started");
        Ok(())
    }

    /// Stops renewing `instance_id`. Returns false if nothing was running.
    pub fn stop(&self, instance_id: &str) -> bool {
        let task = self.loops.lock().remove(instance_id);
        let record = self.records.remove(instance_id);
        if let Some(task) = &task {
            task.cancel();
        }
        let stopped = task.is_some() || record.is_some();
        if stopped {
            debug!(instance_id = %instance_id, "Lease renewal stopped");
        }
        stopped
    }

    /// Stops every renewal and refuses new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let stopped: Vec<RecurringTask> = self.loops.lock().drain().map(|(_, task)| task).collect();
        for task in &stopped {
            task.cancel();
        }
        for mut record in self.records.iter_mut() {
            record.active = false;
        }
        info!(stopped = stopped.len(), "Lease renewal service shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn get_record(&self, instance_id: &str) -> Option<LeaseRenewalRecord> {
        self.records.get(instance_id).map(|r| r.value().clone())
    }

    pub fn active_count(&self) -> usize {
        self.records.iter().filter(|r| r.active).count()
    }
}
