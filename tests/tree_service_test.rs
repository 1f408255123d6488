use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use treeflow::TaskPriority;
use treeflow::concurrency::{ConcurrencyManager, FixedProbe};
use treeflow::config::{ConcurrencyConfig, LeaseConfig, SchedulerConfig};
use treeflow::error::EngineError;
use treeflow::lease::{InMemoryLeaseStore, LeaseRenewalService, LeaseStore};
use treeflow::retry::{ErrorClassifier, ErrorKey};
use treeflow::scheduler::PriorityScheduler;
use treeflow::storage::{InMemoryTaskStore, PersistedTask};
use treeflow::tree::forest::RetryOptions;
use treeflow::tree::{
    Executor, InMemoryExecutorRegistry, NodeSpec, NodeStatus, NodeView, SharedContext, TaskNodeSnapshot,
    TaskTreeService, TreeCompletion,
};

/// Succeeds, fails or waits for cancellation depending on the node's `outcome` metadata.
#[derive(Debug)]
struct ScriptedExecutor;

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn on_run(&self, node: TaskNodeSnapshot, ctx: SharedContext, cancel: CancellationToken) -> anyhow::Result<()> {
        match node.metadata.get("outcome").and_then(Value::as_str) {
            Some("fail") => anyhow::bail!("validation failed: bad input for {}", node.id),
            Some("wait") => {
                cancel.cancelled().await;
                Ok(())
            }
            _ => {
                ctx.set(&format!("ran:{}", node.id), json!(true));
                Ok(())
            }
        }
    }
}

fn scripted_registry() -> Arc<InMemoryExecutorRegistry> {
    let executors = Arc::new(InMemoryExecutorRegistry::new());
    executors.register(Arc::new(ScriptedExecutor));
    executors
}

fn completions(service: &TaskTreeService) -> mpsc::UnboundedReceiver<TreeCompletion> {
    let (tx, rx) = mpsc::unbounded_channel();
    service.on_tree_completed(Arc::new(move |completion: &TreeCompletion| {
        let _ = tx.send(completion.clone());
    }));
    rx
}

async fn next_completion(rx: &mut mpsc::UnboundedReceiver<TreeCompletion>) -> TreeCompletion {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("tree should complete")
        .expect("listener channel open")
}

fn scheduler() -> Arc<PriorityScheduler> {
    let config = SchedulerConfig {
        tick_interval_ms: 10,
        retry_base_delay_ms: 10,
        ..SchedulerConfig::default()
    };
    PriorityScheduler::new(config, Arc::new(ErrorClassifier::default()), None)
}

fn work(id: &str, parent: &str, outcome: &str) -> NodeSpec {
    NodeSpec::new(id)
        .id(id)
        .parent(parent)
        .executor("scripted")
        .meta("outcome", outcome)
}

fn row(id: &str, parent: Option<&str>, status: NodeStatus) -> PersistedTask {
    PersistedTask {
        id: id.to_string(),
        parent_id: parent.map(String::from),
        name: format!("task {}", id),
        status,
        progress: 0,
        executor_name: None,
        priority: TaskPriority::Normal,
        metadata: Default::default(),
        max_retries: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_manual_tree_completes_once_and_is_evicted() {
    let service = TaskTreeService::builder().build();
    let mut done = completions(&service);

    let root = service.create_node(NodeSpec::new("root")).unwrap();
    let a = service.create_node(NodeSpec::new("a").parent(&root)).unwrap();
    let b = service.create_node(NodeSpec::new("b").parent(&root)).unwrap();
    assert_eq!(service.cached_count(), 3);

    service.start(&root).unwrap();
    service.succeed(&a).unwrap();
    assert!(service.get(&a).unwrap().is_placeholder());
    assert_eq!(service.get(&root).unwrap().progress(), 50);

    service.fail(&b, "boom").unwrap();

    let completion = next_completion(&mut done).await;
    assert_eq!(completion.root_id, root);
    assert_eq!(completion.status, NodeStatus::Completed);
    assert_eq!(completion.total_tasks, 3);
    assert_eq!(completion.tree.children.len(), 2);
    assert!(done.try_recv().is_err());

    assert_eq!(service.cached_count(), 0);
    assert!(service.get(&root).is_none());
}

#[tokio::test]
async fn test_failed_root_is_kept_for_retry_until_budget_is_spent() {
    let service = TaskTreeService::builder().build();
    let mut done = completions(&service);
    service
        .create_node(NodeSpec::new("job").id("job").max_retries(2))
        .unwrap();
    service.start("job").unwrap();

    for attempt in 1..=2 {
        service.fail("job", format!("failure {attempt}")).unwrap();
        assert_eq!(next_completion(&mut done).await.status, NodeStatus::Failed);
        assert_eq!(service.cached_count(), 1);

        service.retry("job", RetryOptions::default()).unwrap();
        assert_eq!(service.get("job").unwrap().status(), NodeStatus::Running);
    }

    service.fail("job", "failure 3").unwrap();
    assert_eq!(next_completion(&mut done).await.status, NodeStatus::Failed);
    assert!(service.get("job").is_none());
    assert!(matches!(
        service.retry("job", RetryOptions::default()),
        Err(EngineError::NodeNotFound(_))
    ));
}

#[tokio::test]
async fn test_failed_child_retries_while_siblings_run() {
    let service = TaskTreeService::builder().build();
    let mut done = completions(&service);
    service.create_node(NodeSpec::new("root").id("root")).unwrap();
    service.create_node(NodeSpec::new("a").id("a").parent("root")).unwrap();
    service.create_node(NodeSpec::new("b").id("b").parent("root")).unwrap();
    service.start("root").unwrap();

    service.fail("a", "flaky").unwrap();
    assert!(!service.get("a").unwrap().is_placeholder());
    service.retry("a", RetryOptions::default()).unwrap();
    assert_eq!(service.get("a").unwrap().status(), NodeStatus::Running);

    service.succeed("a").unwrap();
    assert!(service.get("a").unwrap().is_placeholder());
    service.succeed("b").unwrap();

    let completion = next_completion(&mut done).await;
    assert_eq!(completion.status, NodeStatus::Success);
    assert_eq!(service.cached_count(), 0);
}

#[tokio::test]
async fn test_settled_tree_compacts_failed_children() {
    let service = TaskTreeService::builder().build();
    let mut done = completions(&service);
    service.create_node(NodeSpec::new("root").id("root")).unwrap();
    service.create_node(NodeSpec::new("a").id("a").parent("root")).unwrap();
    service.create_node(NodeSpec::new("b").id("b").parent("root")).unwrap();
    service.start("root").unwrap();

    service.fail("a", "x").unwrap();
    service.fail("b", "y").unwrap();
    let completion = next_completion(&mut done).await;
    assert_eq!(completion.status, NodeStatus::Failed);
    assert_eq!(completion.total_tasks, 3);

    // the children settled with their parent; the root itself can still retry
    assert!(service.get("a").unwrap().is_placeholder());
    assert!(matches!(
        service.retry("a", RetryOptions::default()),
        Err(EngineError::NodeCompacted { .. })
    ));
    assert_eq!(service.cached_count(), 3);

    assert_eq!(service.discard("root").unwrap(), 3);
    assert_eq!(service.cached_count(), 0);
}

#[tokio::test]
async fn test_executor_runs_directly_without_scheduler() {
    let service = TaskTreeService::builder().executors(scripted_registry()).build();
    let mut done = completions(&service);

    service.create_node(NodeSpec::new("root").id("root")).unwrap();
    service.create_node(work("ok", "root", "succeed")).unwrap();
    service.create_node(work("bad", "root", "fail")).unwrap();
    let ctx = service.context("root").unwrap();

    service.start("root").unwrap();
    let completion = next_completion(&mut done).await;
    assert_eq!(completion.status, NodeStatus::Completed);
    assert_eq!(completion.total_tasks, 3);
    // the shared context is cleared once the tree completes
    assert!(ctx.is_empty());
}

#[tokio::test]
async fn test_executor_runs_through_scheduler_and_slots() {
    let scheduler = scheduler();
    let manager = ConcurrencyManager::with_probe(
        ConcurrencyConfig {
            max_concurrent_nodes: 1,
            ..ConcurrencyConfig::default()
        },
        Arc::new(FixedProbe::new(10.0, 10.0)),
    );
    let scheduler_with_slots = PriorityScheduler::new(
        scheduler.config().clone(),
        Arc::new(ErrorClassifier::default()),
        Some(manager.clone()),
    );
    let service = TaskTreeService::builder()
        .executors(scripted_registry())
        .scheduler(scheduler_with_slots.clone())
        .build();
    let mut done = completions(&service);

    service.create_node(NodeSpec::new("root").id("root")).unwrap();
    service.create_node(work("first", "root", "succeed")).unwrap();
    service.create_node(work("second", "root", "succeed")).unwrap();
    service.create_node(work("third", "root", "fail")).unwrap();

    service.start("root").unwrap();
    let completion = next_completion(&mut done).await;
    assert_eq!(completion.status, NodeStatus::Completed);
    assert_eq!(completion.total_tasks, 4);

    let stats = scheduler_with_slots.stats();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(manager.stats().active_node_slots, 0);
    // node failures are counted per tree and node, across dispatches
    let third = ErrorKey::new("root").node("third");
    assert_eq!(scheduler_with_slots.classifier().failure_count(&third), 1);

    let all_ok = TaskTreeService::builder()
        .executors(scripted_registry())
        .scheduler(scheduler)
        .build();
    let mut done = completions(&all_ok);
    all_ok.create_node(NodeSpec::new("root").id("root")).unwrap();
    all_ok.create_node(work("x", "root", "succeed")).unwrap();
    all_ok.create_node(work("y", "root", "succeed")).unwrap();
    all_ok.start("root").unwrap();
    assert_eq!(next_completion(&mut done).await.status, NodeStatus::Success);
}

#[tokio::test]
async fn test_cancel_signals_running_executor() {
    let scheduler = scheduler();
    let service = TaskTreeService::builder()
        .executors(scripted_registry())
        .scheduler(scheduler.clone())
        .build();
    let mut done = completions(&service);

    service.create_node(NodeSpec::new("root").id("root")).unwrap();
    service.create_node(work("long", "root", "wait")).unwrap();
    service.start("root").unwrap();

    timeout(Duration::from_secs(5), async {
        while scheduler.stats().running == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("executor run dispatched");

    service.cancel("long", Some("operator request".into())).unwrap();
    let completion = next_completion(&mut done).await;
    assert_eq!(completion.status, NodeStatus::Completed);

    timeout(Duration::from_secs(5), async {
        while scheduler.stats().cancelled == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("scheduled run cancelled");
    assert_eq!(scheduler.stats().running, 0);
}

#[tokio::test]
async fn test_recovery_rebuilds_live_nodes_and_isolates_failures() {
    let mut c2 = row("c2", Some("r1"), NodeStatus::Running);
    c2.progress = 40;
    c2.max_retries = Some(1);
    c2.metadata.insert("retry_attempts".into(), json!([{ "attempt": 1 }]));
    let mut c3 = row("c3", Some("r1"), NodeStatus::Pending);
    c3.executor_name = Some("missing".into());

    let store = InMemoryTaskStore::with_rows([
        row("r1", None, NodeStatus::Running),
        row("c1", Some("r1"), NodeStatus::Success),
        row("g1", Some("c1"), NodeStatus::Success),
        c2,
        c3,
        row("g3", Some("c3"), NodeStatus::Pending),
        row("o1", Some("ghost"), NodeStatus::Pending),
        row("r2", None, NodeStatus::Success),
    ]);

    let service = TaskTreeService::builder().build();
    let report = service.recover(&store).await.unwrap();

    assert_eq!(report.recovered, 2);
    assert_eq!(report.placeholders, 2);
    assert_eq!(report.skipped, 0);
    let failed: BTreeSet<&str> = report.errors.iter().map(|e| e.task_id.as_str()).collect();
    assert_eq!(failed, BTreeSet::from(["c3", "g3", "o1"]));
    assert!(report.errors.iter().any(|e| e.task_id == "c3" && e.error.contains("missing")));

    assert!(service.get("g1").is_none());
    match service.get("c1").unwrap() {
        NodeView::Placeholder(p) => assert_eq!(p.descendant_count, 1),
        other => panic!("expected placeholder, got {other:?}"),
    }
    assert!(service.get("r2").unwrap().is_placeholder());

    let Some(NodeView::Live(c2)) = service.find_by_name("task c2") else {
        panic!("c2 should be live");
    };
    assert_eq!(c2.status, NodeStatus::Running);
    assert_eq!(c2.retry_count, 1);

    // root progress is re-derived from what was actually recovered
    assert_eq!(service.get("r1").unwrap().status(), NodeStatus::Running);
    assert_eq!(service.get("r1").unwrap().progress(), 70);
    assert!(service.context("c2").unwrap().same_as(&service.context("r1").unwrap()));

    let again = service.recover(&store).await.unwrap();
    assert_eq!(again.recovered, 0);
    assert_eq!(again.skipped, 4);
    assert_eq!(again.errors.len(), 3);
}

#[tokio::test]
async fn test_recovery_reconciles_parent_with_finished_children() {
    let store = InMemoryTaskStore::with_rows([
        row("r3", None, NodeStatus::Running),
        row("d1", Some("r3"), NodeStatus::Success),
        row("d2", Some("r3"), NodeStatus::Failed),
    ]);
    let service = TaskTreeService::builder().build();
    let mut done = completions(&service);

    let report = service.recover(&store).await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.placeholders, 2);
    assert!(report.errors.is_empty());

    let completion = next_completion(&mut done).await;
    assert_eq!(completion.root_id, "r3");
    assert_eq!(completion.status, NodeStatus::Completed);
    assert_eq!(completion.total_tasks, 3);
    assert_eq!(service.cached_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_root_lease_held_while_tree_runs() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let renewal = LeaseRenewalService::new(
        store.clone(),
        LeaseConfig {
            renewal_interval_ms: 1_000,
            lease_extension_ms: 5_000,
            max_retry_attempts: 3,
        },
    );
    let service = TaskTreeService::builder()
        .lease_renewal(renewal.clone(), "worker-1")
        .build();

    service.create_node(NodeSpec::new("root").id("root")).unwrap();
    service.create_node(NodeSpec::new("a").id("a").parent("root")).unwrap();
    service.start("root").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(store.holder("root").as_deref(), Some("worker-1"));
    assert!(renewal.get_record("root").is_some_and(|r| r.active));

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let record = renewal.get_record("root").unwrap();
    assert!(record.last_renewal_at.is_some());
    assert_eq!(record.retry_count, 0);

    service.succeed("a").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(store.holder("root").is_none());
    assert!(renewal.get_record("root").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_root_lease_held_elsewhere_is_not_renewed() {
    let store = Arc::new(InMemoryLeaseStore::new());
    store
        .acquire("root", "worker-2", Duration::from_secs(60))
        .await
        .unwrap();
    let renewal = LeaseRenewalService::new(store.clone(), LeaseConfig::default());
    let service = TaskTreeService::builder()
        .lease_renewal(renewal.clone(), "worker-1")
        .build();

    service.create_node(NodeSpec::new("root").id("root")).unwrap();
    service.start("root").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(store.holder("root").as_deref(), Some("worker-2"));
    assert!(renewal.get_record("root").is_none());
    assert_eq!(renewal.active_count(), 0);
}
