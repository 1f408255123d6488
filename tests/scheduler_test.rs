use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use treeflow::TaskPriority;
use treeflow::concurrency::{ConcurrencyManager, FixedProbe, SlotRequest};
use treeflow::config::{ConcurrencyConfig, RetryConfig, SchedulerConfig};
use treeflow::error::EngineError;
use treeflow::retry::{ErrorClassifier, ErrorHandlingDecision, ErrorKey, ErrorType};
use treeflow::scheduler::{Job, PriorityScheduler, QueuedTask, QueuedTaskStatus, TaskDefinition, TaskFilter, job_fn};
use uuid::Uuid;

fn scheduler_with(max_concurrent: usize) -> Arc<PriorityScheduler> {
    let config = SchedulerConfig {
        max_concurrent,
        tick_interval_ms: 10,
        ..SchedulerConfig::default()
    };
    PriorityScheduler::new(config, Arc::new(ErrorClassifier::default()), None)
}

fn gated_job(gate: &Arc<Notify>) -> Arc<dyn Job> {
    let gate = gate.clone();
    job_fn(move |_| {
        let gate = gate.clone();
        async move {
            gate.notified().await;
            anyhow::Ok(())
        }
    })
}

fn recording_job(log: &Arc<Mutex<Vec<String>>>, name: &str) -> Arc<dyn Job> {
    let log = log.clone();
    let name = name.to_string();
    job_fn(move |_| {
        let log = log.clone();
        let name = name.clone();
        async move {
            log.lock().push(name);
            anyhow::Ok(())
        }
    })
}

/// Fails with `message` on the first `failures` calls, then succeeds.
fn flaky_job(calls: &Arc<AtomicU32>, failures: u32, message: &'static str) -> Arc<dyn Job> {
    let calls = calls.clone();
    job_fn(move |_| {
        let calls = calls.clone();
        async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= failures {
                anyhow::bail!("{}", message);
            }
            Ok(())
        }
    })
}

async fn wait_until_running(scheduler: &PriorityScheduler, count: usize) {
    while scheduler.stats().running < count {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_dispatches_by_priority_then_arrival() {
    let scheduler = scheduler_with(1);
    let gate = Arc::new(Notify::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let blocker = scheduler
        .schedule(TaskDefinition::new("blocker", gated_job(&gate)))
        .unwrap();
    wait_until_running(&scheduler, 1).await;

    let mut tickets = Vec::new();
    for (name, priority) in [
        ("low", TaskPriority::Low),
        ("normal-1", TaskPriority::Normal),
        ("urgent", TaskPriority::Urgent),
        ("normal-2", TaskPriority::Normal),
        ("high", TaskPriority::High),
    ] {
        let definition = TaskDefinition::new(name, recording_job(&log, name)).priority(priority);
        tickets.push(scheduler.schedule(definition).unwrap());
    }
    assert_eq!(scheduler.stats().pending, 5);

    gate.notify_one();
    assert_eq!(blocker.wait().await.unwrap().status, QueuedTaskStatus::Completed);
    for ticket in tickets {
        assert_eq!(ticket.wait().await.unwrap().status, QueuedTaskStatus::Completed);
    }
    assert_eq!(*log.lock(), vec!["urgent", "high", "normal-1", "normal-2", "low"]);
}

#[tokio::test(start_paused = true)]
async fn test_same_priority_keeps_arrival_order() {
    let scheduler = scheduler_with(1);
    let gate = Arc::new(Notify::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let blocker = scheduler
        .schedule(TaskDefinition::new("blocker", gated_job(&gate)))
        .unwrap();
    wait_until_running(&scheduler, 1).await;

    let mut tickets = Vec::new();
    for (name, priority) in [
        ("low", TaskPriority::Low),
        ("urgent#1", TaskPriority::Urgent),
        ("normal", TaskPriority::Normal),
        ("urgent#2", TaskPriority::Urgent),
    ] {
        let definition = TaskDefinition::new(name, recording_job(&log, name)).priority(priority);
        tickets.push(scheduler.schedule(definition).unwrap());
    }

    gate.notify_one();
    blocker.wait().await.unwrap();
    for ticket in tickets {
        ticket.wait().await.unwrap();
    }
    assert_eq!(*log.lock(), vec!["urgent#1", "urgent#2", "normal", "low"]);
}

#[tokio::test(start_paused = true)]
async fn test_never_exceeds_max_concurrent() {
    let scheduler = scheduler_with(2);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tickets = Vec::new();
    for i in 0..6 {
        let (current, peak) = (current.clone(), peak.clone());
        let job = job_fn(move |_| {
            let (current, peak) = (current.clone(), peak.clone());
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });
        tickets.push(scheduler.schedule(TaskDefinition::new(format!("job-{i}"), job)).unwrap());
    }
    for ticket in tickets {
        ticket.wait().await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(scheduler.stats().completed, 6);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failure_retries_until_budget_then_fails() {
    let scheduler = scheduler_with(2);
    let calls = Arc::new(AtomicU32::new(0));

    let definition = TaskDefinition::new("fetch", flaky_job(&calls, u32::MAX, "connection refused by upstream"))
        .owner("wf-1")
        .max_retries(2);
    let record = scheduler.schedule(definition).unwrap().wait().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(record.status, QueuedTaskStatus::Failed);
    assert_eq!(record.retry_count, 2);
    assert_eq!(record.error_type, Some(ErrorType::Network));
    assert!(record.last_error.unwrap().contains("connection refused"));
    assert!(record.finished_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_recovers() {
    let scheduler = scheduler_with(1);
    let calls = Arc::new(AtomicU32::new(0));

    let definition = TaskDefinition::new("sync", flaky_job(&calls, 2, "request timed out"));
    let record = scheduler.schedule(definition).unwrap().wait().await.unwrap();

    assert_eq!(record.status, QueuedTaskStatus::Completed);
    assert_eq!(record.retry_count, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_failure_fails_immediately() {
    let scheduler = scheduler_with(1);
    let calls = Arc::new(AtomicU32::new(0));

    let definition = TaskDefinition::new("parse", flaky_job(&calls, u32::MAX, "invalid payload: missing id"));
    let record = scheduler.schedule(definition).unwrap().wait().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(record.status, QueuedTaskStatus::Failed);
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.error_type, Some(ErrorType::Validation));
    assert_eq!(scheduler.stats().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_pending_and_running_tasks() {
    let scheduler = scheduler_with(1);

    let running = scheduler
        .schedule(TaskDefinition::new(
            "watcher",
            job_fn(|cancel| async move {
                cancel.cancelled().await;
                anyhow::Ok(())
            }),
        ))
        .unwrap();
    let running_id = running.id();
    wait_until_running(&scheduler, 1).await;

    let pending = scheduler
        .schedule(TaskDefinition::new("later", job_fn(|_| async { anyhow::Ok(()) })))
        .unwrap();
    let pending_id = pending.id();

    assert!(scheduler.cancel(pending_id).unwrap());
    assert_eq!(pending.wait().await.unwrap().status, QueuedTaskStatus::Cancelled);
    assert!(!scheduler.cancel(pending_id).unwrap());

    assert!(scheduler.cancel(running_id).unwrap());
    assert_eq!(running.wait().await.unwrap().status, QueuedTaskStatus::Cancelled);

    let stats = scheduler.stats();
    assert_eq!(stats.cancelled, 2);
    assert_eq!(stats.running, 0);

    assert!(matches!(scheduler.cancel(Uuid::new_v4()), Err(EngineError::TaskNotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_classified_as_timeout() {
    let scheduler = scheduler_with(1);
    let definition = TaskDefinition::new(
        "slow",
        job_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            anyhow::Ok(())
        }),
    )
    .timeout(Duration::from_millis(100))
    .max_retries(0);

    let record = scheduler.schedule(definition).unwrap().wait().await.unwrap();
    assert_eq!(record.status, QueuedTaskStatus::Failed);
    assert_eq!(record.error_type, Some(ErrorType::Timeout));
    assert!(record.last_error.unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_list_orders_running_then_pending_by_priority() {
    let scheduler = scheduler_with(1);
    let gate = Arc::new(Notify::new());

    let blocker = scheduler
        .schedule(TaskDefinition::new("blocker", gated_job(&gate)).owner("wf-a"))
        .unwrap();
    wait_until_running(&scheduler, 1).await;
    let idle = || job_fn(|_| async { anyhow::Ok(()) });
    scheduler
        .schedule(TaskDefinition::new("low", idle()).priority(TaskPriority::Low).owner("wf-b"))
        .unwrap();
    scheduler
        .schedule(TaskDefinition::new("high", idle()).priority(TaskPriority::High).owner("wf-a"))
        .unwrap();

    let names: Vec<String> = scheduler
        .list(&TaskFilter::default())
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["blocker", "high", "low"]);

    let pending = scheduler.list(&TaskFilter::default().status(QueuedTaskStatus::Pending));
    assert_eq!(pending.len(), 2);
    let low = scheduler.list(&TaskFilter::default().priority(TaskPriority::Low));
    assert_eq!(low.len(), 1);
    let wf_a = scheduler.list(&TaskFilter::default().owner("wf-a"));
    assert_eq!(wf_a.len(), 2);

    gate.notify_one();
    let record = blocker.wait().await.unwrap();
    assert_eq!(scheduler.get(record.id).unwrap().status, QueuedTaskStatus::Completed);
}

#[tokio::test]
async fn test_backoff_doubles_up_to_cap() {
    let scheduler = PriorityScheduler::new(
        SchedulerConfig {
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            ..SchedulerConfig::default()
        },
        Arc::new(ErrorClassifier::default()),
        None,
    );
    assert_eq!(scheduler.backoff_delay(0), Duration::from_secs(1));
    assert_eq!(scheduler.backoff_delay(1), Duration::from_secs(2));
    assert_eq!(scheduler.backoff_delay(2), Duration::from_secs(4));
    assert_eq!(scheduler.backoff_delay(10), Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_escalation_handler_called_at_threshold() {
    let scheduler = scheduler_with(1);
    let escalations = Arc::new(Mutex::new(Vec::new()));
    let seen = escalations.clone();
    scheduler.set_escalation_handler(Arc::new(move |task: &QueuedTask, decision: &ErrorHandlingDecision| {
        seen.lock().push((task.name.clone(), decision.error_type, decision.attempt));
    }));

    let calls = Arc::new(AtomicU32::new(0));
    let definition = TaskDefinition::new("disk", flaky_job(&calls, u32::MAX, "internal error: disk full")).max_retries(5);
    let record = scheduler.schedule(definition).unwrap().wait().await.unwrap();

    // system errors retry twice and escalate from the second failure
    assert_eq!(record.status, QueuedTaskStatus::Failed);
    assert_eq!(record.retry_count, 2);
    assert_eq!(
        *escalations.lock(),
        vec![
            ("disk".to_string(), ErrorType::System, 2),
            ("disk".to_string(), ErrorType::System, 3),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_shared_error_key_counts_failures_across_schedulings() {
    let scheduler = scheduler_with(1);
    let escalations = Arc::new(Mutex::new(Vec::new()));
    let seen = escalations.clone();
    scheduler.set_escalation_handler(Arc::new(move |task: &QueuedTask, decision: &ErrorHandlingDecision| {
        seen.lock().push((task.name.clone(), decision.error_type, decision.attempt));
    }));

    let key = ErrorKey::new("wf-1").node("fetch");
    let calls = Arc::new(AtomicU32::new(0));
    let fetch = || {
        TaskDefinition::new("node:fetch", flaky_job(&calls, u32::MAX, "connection refused"))
            .owner("wf-1")
            .error_key(key.clone())
    };

    let first = scheduler.schedule(fetch()).unwrap().wait().await.unwrap();
    assert_eq!(first.status, QueuedTaskStatus::Failed);
    assert_eq!(first.retry_count, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(escalations.lock().is_empty());
    assert_eq!(scheduler.classifier().failure_count(&key), 4);

    // the counter survives the first task; the fifth network failure escalates
    let second = scheduler.schedule(fetch()).unwrap().wait().await.unwrap();
    assert_eq!(second.status, QueuedTaskStatus::Failed);
    assert_eq!(second.retry_count, 0);
    assert_eq!(
        *escalations.lock(),
        vec![("node:fetch".to_string(), ErrorType::Network, 5)]
    );

    let ok = TaskDefinition::new("node:fetch", job_fn(|_| async { anyhow::Ok(()) })).error_key(key.clone());
    scheduler.schedule(ok).unwrap().wait().await.unwrap();
    assert_eq!(scheduler.classifier().failure_count(&key), 0);
}

#[tokio::test]
async fn test_retry_delay_is_jittered_when_enabled() {
    let config = SchedulerConfig {
        retry_base_delay_ms: 1_000,
        ..SchedulerConfig::default()
    };
    let jittered = PriorityScheduler::new(config.clone(), Arc::new(ErrorClassifier::default()), None);
    for _ in 0..100 {
        let delay = jittered.retry_delay(1);
        assert!(delay >= Duration::from_millis(1_800), "{delay:?}");
        assert!(delay <= Duration::from_millis(2_200), "{delay:?}");
    }

    let exact = PriorityScheduler::new(
        config,
        Arc::new(ErrorClassifier::new(&RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        })),
        None,
    );
    assert_eq!(exact.retry_delay(1), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_admission_waits_for_resources() {
    let probe = Arc::new(FixedProbe::new(99.0, 10.0));
    let manager = ConcurrencyManager::with_probe(ConcurrencyConfig::default(), probe.clone());
    let scheduler = PriorityScheduler::new(
        SchedulerConfig {
            tick_interval_ms: 10,
            ..SchedulerConfig::default()
        },
        Arc::new(ErrorClassifier::default()),
        Some(manager.clone()),
    );

    let definition = TaskDefinition::new("gated", job_fn(|_| async { anyhow::Ok(()) }))
        .admission(SlotRequest::node("wf-1", "n-1", TaskPriority::Normal));
    let ticket = scheduler.schedule(definition).unwrap();
    let id = ticket.id();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.stats().queued, 1);
    assert_eq!(scheduler.get(id).unwrap().status, QueuedTaskStatus::Running);

    probe.set(40.0, 10.0);
    manager.check_resources();
    assert_eq!(ticket.wait().await.unwrap().status, QueuedTaskStatus::Completed);
    assert_eq!(manager.stats().active_node_slots, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_queued_work_and_rejects_new() {
    let scheduler = scheduler_with(1);
    let gate = Arc::new(Notify::new());
    let _blocker = scheduler
        .schedule(TaskDefinition::new("blocker", gated_job(&gate)))
        .unwrap();
    wait_until_running(&scheduler, 1).await;
    let queued = scheduler
        .schedule(TaskDefinition::new("queued", job_fn(|_| async { anyhow::Ok(()) })))
        .unwrap();

    scheduler.shutdown();
    assert_eq!(queued.wait().await.unwrap().status, QueuedTaskStatus::Cancelled);

    let rejected = scheduler.schedule(TaskDefinition::new("late", job_fn(|_| async { anyhow::Ok(()) })));
    assert!(matches!(rejected, Err(EngineError::ShuttingDown(_))));
    gate.notify_one();
}
