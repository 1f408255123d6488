use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaseRenewalOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl LeaseRenewalOutcome {
    pub fn renewed() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Distributed execution lease, keyed by workflow instance and held by one owner.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Takes the lease if nobody holds it. Returns false when another owner does.
    async fn acquire(&self, instance_id: &str, owner_id: &str, ttl: Duration) -> Result<bool>;

    /// Extends the lease when `owner_id` still holds it. Never fails with an error; failures are in the outcome.
    async fn renew(&self, instance_id: &str, owner_id: &str, extension: Duration) -> LeaseRenewalOutcome;

    /// Drops the lease only if `owner_id` holds it.
    async fn release(&self, instance_id: &str, owner_id: &str) -> Result<bool>;
}

struct HeldLease {
    owner_id: String,
    expires_at: Instant,
}

/// Single-process lease table on the tokio clock.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, HeldLease>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder, if the lease has not expired.
    pub fn holder(&self, instance_id: &str) -> Option<String> {
        let leases = self.leases.lock();
        leases
            .get(instance_id)
            .filter(|l| l.expires_at > Instant::now())
            .map(|l| l.owner_id.clone())
    }

    pub fn expires_in(&self, instance_id: &str) -> Option<Duration> {
        let leases = self.leases.lock();
        leases
            .get(instance_id)
            .map(|l| l.expires_at.saturating_duration_since(Instant::now()))
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn acquire(&self, instance_id: &str, owner_id: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if let Some(held) = leases.get(instance_id) {
            if held.expires_at > now && held.owner_id != owner_id {
                return Ok(false);
            }
        }
        leases.insert(
            instance_id.to_string(),
            HeldLease {
                owner_id: owner_id.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn renew(&self, instance_id: &str, owner_id: &str, extension: Duration) -> LeaseRenewalOutcome {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        match leases.get_mut(instance_id) {
            Some(held) if held.owner_id == owner_id && held.expires_at > now => {
                held.expires_at = now + extension;
                LeaseRenewalOutcome::renewed()
            }
            Some(held) if held.owner_id != owner_id => {
                LeaseRenewalOutcome::failed(format!("lease for {} is held by {}", instance_id, held.owner_id))
            }
            Some(_) => LeaseRenewalOutcome::failed(format!("lease for {} has expired", instance_id)),
            None => LeaseRenewalOutcome::failed(format!("no lease held for {}", instance_id)),
        }
    }

    async fn release(&self, instance_id: &str, owner_id: &str) -> Result<bool> {
        let mut leases = self.leases.lock();
        if leases.get(instance_id).is_some_and(|l| l.owner_id == owner_id) {
            leases.remove(instance_id);
            return Ok(true);
        }
        Ok(false)
    }
}
