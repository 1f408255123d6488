use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use treeflow::config::LeaseConfig;
use treeflow::error::EngineError;
use treeflow::lease::{InMemoryLeaseStore, LeaseRenewalOutcome, LeaseRenewalService, LeaseStore};

/// Counts renewals and fails the first `failures` of them.
#[derive(Default)]
struct CountingStore {
    renewals: AtomicU32,
    failures: u32,
}

impl CountingStore {
    fn failing(failures: u32) -> Self {
        Self {
            renewals: AtomicU32::new(0),
            failures,
        }
    }

    fn renewals(&self) -> u32 {
        self.renewals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaseStore for CountingStore {
    async fn acquire(&self, _instance_id: &str, _owner_id: &str, _ttl: Duration) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn renew(&self, instance_id: &str, _owner_id: &str, _extension: Duration) -> LeaseRenewalOutcome {
        let call = self.renewals.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            LeaseRenewalOutcome::failed(format!("store unavailable for {}", instance_id))
        } else {
            LeaseRenewalOutcome::renewed()
        }
    }

    async fn release(&self, _instance_id: &str, _owner_id: &str) -> anyhow::Result<bool> {
        Ok(true)
    }
}

fn config(interval_ms: u64, max_retry_attempts: u32) -> LeaseConfig {
    LeaseConfig {
        renewal_interval_ms: interval_ms,
        lease_extension_ms: interval_ms * 3,
        max_retry_attempts,
    }
}

#[tokio::test(start_paused = true)]
async fn test_in_memory_store_enforces_ownership_and_expiry() {
    let store = InMemoryLeaseStore::new();
    let ttl = Duration::from_secs(1);

    assert!(store.acquire("wf-1", "node-a", ttl).await.unwrap());
    assert!(!store.acquire("wf-1", "node-b", ttl).await.unwrap());
    assert!(store.acquire("wf-1", "node-a", ttl).await.unwrap());

    let stolen = store.renew("wf-1", "node-b", ttl).await;
    assert!(!stolen.success);
    assert!(stolen.error.unwrap().contains("node-a"));
    assert!(store.renew("wf-1", "node-a", Duration::from_secs(2)).await.success);
    assert_eq!(store.expires_in("wf-1"), Some(Duration::from_secs(2)));

    assert!(!store.release("wf-1", "node-b").await.unwrap());
    assert!(store.release("wf-1", "node-a").await.unwrap());
    assert!(store.holder("wf-1").is_none());

    assert!(store.acquire("wf-2", "node-a", Duration::from_millis(100)).await.unwrap());
    sleep(Duration::from_millis(200)).await;
    assert!(store.holder("wf-2").is_none());
    assert!(!store.renew("wf-2", "node-a", ttl).await.success);
    assert!(store.acquire("wf-2", "node-b", ttl).await.unwrap());
    assert_eq!(store.holder("wf-2").as_deref(), Some("node-b"));
}

#[tokio::test(start_paused = true)]
async fn test_renewal_keeps_lease_alive() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let renewal = LeaseRenewalService::new(store.clone(), config(1_000, 3));

    assert!(store.acquire("wf-1", "node-a", Duration::from_millis(1_500)).await.unwrap());
    renewal.start("wf-1", "node-a").unwrap();

    sleep(Duration::from_secs(5)).await;
    assert_eq!(store.holder("wf-1").as_deref(), Some("node-a"));
    let record = renewal.get_record("wf-1").unwrap();
    assert!(record.active);
    assert_eq!(record.retry_count, 0);
    assert!(record.last_renewal_at.is_some());
    assert_eq!(renewal.active_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_renewal_gives_up_after_max_attempts() {
    let store = Arc::new(CountingStore::failing(u32::MAX));
    let renewal = LeaseRenewalService::new(store.clone(), config(100, 3));
    let mut failures = renewal.subscribe_failures();

    renewal.start("wf-1", "node-a").unwrap();
    let failure = timeout(Duration::from_secs(5), failures.recv())
        .await
        .expect("failure published")
        .unwrap();

    assert_eq!(failure.instance_id, "wf-1");
    assert_eq!(failure.owner_id, "node-a");
    assert_eq!(failure.attempts, 3);
    assert!(failure.error.contains("store unavailable"));

    let record = renewal.get_record("wf-1").unwrap();
    assert!(!record.active);
    assert_eq!(renewal.active_count(), 0);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(store.renewals(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_failure_count() {
    let store = Arc::new(CountingStore::failing(2));
    let renewal = LeaseRenewalService::new(store.clone(), config(100, 3));

    renewal.start("wf-1", "node-a").unwrap();
    sleep(Duration::from_millis(250)).await;
    assert_eq!(renewal.get_record("wf-1").unwrap().retry_count, 2);

    sleep(Duration::from_millis(100)).await;
    let record = renewal.get_record("wf-1").unwrap();
    assert_eq!(record.retry_count, 0);
    assert!(record.active);
}

#[tokio::test(start_paused = true)]
async fn test_restart_replaces_previous_loop() {
    let store = Arc::new(CountingStore::default());
    let renewal = LeaseRenewalService::new(store.clone(), config(100, 3));

    renewal.start("wf-1", "node-a").unwrap();
    renewal.start("wf-1", "node-a").unwrap();
    sleep(Duration::from_millis(150)).await;
    assert_eq!(store.renewals(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let store = Arc::new(CountingStore::default());
    let renewal = LeaseRenewalService::new(store.clone(), config(100, 3));

    renewal.start("wf-1", "node-a").unwrap();
    assert!(renewal.stop("wf-1"));
    assert!(!renewal.stop("wf-1"));
    assert!(renewal.get_record("wf-1").is_none());

    sleep(Duration::from_millis(500)).await;
    assert_eq!(store.renewals(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_everything() {
    let store = Arc::new(CountingStore::default());
    let renewal = LeaseRenewalService::new(store.clone(), config(100, 3));
    renewal.start("wf-1", "node-a").unwrap();
    renewal.start("wf-2", "node-a").unwrap();

    renewal.shutdown();
    assert!(renewal.is_shut_down());
    assert_eq!(renewal.active_count(), 0);
    assert!(matches!(
        renewal.start("wf-3", "node-a"),
        Err(EngineError::ShuttingDown(_))
    ));

    sleep(Duration::from_millis(500)).await;
    assert_eq!(store.renewals(), 0);
}
