use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::storage::{PersistedTask, TaskStore};
use crate::tree::forest::{TaskForest, TreeEntry};
use crate::tree::node::{CreateMode, NodeSpec, TaskNodePlaceholder};
use crate::tree::service::TaskTreeService;

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryError {
    pub task_id: String,
    pub error: String,
}

/// 恢复结果汇总
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Rows rebuilt as live nodes.
    pub recovered: usize,
    /// Terminal rows installed as placeholders.
    pub placeholders: usize,
    /// Rows already in the cache.
    pub skipped: usize,
    pub errors: Vec<RecoveryError>,
    pub duration: Duration,
}

enum RowOutcome {
    Recovered,
    Placeholder,
    Skipped { descend: bool },
}

/// Parent-to-children index over persisted rows, in store order.
struct RowIndex<'a> {
    children: HashMap<&'a str, Vec<&'a PersistedTask>>,
}

impl<'a> RowIndex<'a> {
    fn new(rows: &'a [PersistedTask]) -> Self {
        let mut children: HashMap<&str, Vec<&PersistedTask>> = HashMap::new();
        for row in rows {
            if let Some(parent) = &row.parent_id {
                children.entry(parent.as_str()).or_default().push(row);
            }
        }
        Self { children }
    }

    fn children_of(&self, id: &str) -> &[&'a PersistedTask] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn descendants_of(&self, id: &str) -> Vec<&'a PersistedTask> {
        let mut found = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for child in self.children_of(current) {
                found.push(*child);
                queue.push_back(&child.id);
            }
        }
        found
    }
}

impl TaskTreeService {
    /// Rebuilds the in-memory trees from persisted rows, breadth-first from each root.
    ///
    /// Terminal rows become placeholders and their subtrees are not materialized.
    /// A row that fails is recorded in the report together with everything below it,
    /// and recovery carries on with its siblings. Only a store read failure aborts.
    pub async fn recover(&self, store: &dyn TaskStore) -> Result<RecoveryReport> {
        let started = Instant::now();
        let rows = store.find_all().await?;
        let known: HashSet<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        let index = RowIndex::new(&rows);
        let mut report = RecoveryReport::default();
        let mut rebuilt = Vec::new();

        let mut queue: VecDeque<&PersistedTask> = VecDeque::new();
        for row in &rows {
            match &row.parent_id {
                None => queue.push_back(row),
                Some(parent) if !known.contains(parent.as_str()) => {
                    report.errors.push(RecoveryError {
                        task_id: row.id.clone(),
                        error: format!("parent {} is not persisted", parent),
                    });
                }
                Some(_) => {}
            }
        }

        while let Some(row) = queue.pop_front() {
            let outcome = {
                let mut forest = self.forest_lock();
                recover_row(&mut forest, row, &index)
            };
            match outcome {
                Ok(RowOutcome::Recovered) => {
                    report.recovered += 1;
                    rebuilt.push(row.id.clone());
                    queue.extend(index.children_of(&row.id));
                }
                Ok(RowOutcome::Placeholder) => report.placeholders += 1,
                Ok(RowOutcome::Skipped { descend }) => {
                    report.skipped += 1;
                    if descend {
                        queue.extend(index.children_of(&row.id));
                    }
                }
                Err(e) => {
                    warn!(task_id = %row.id, error = %e, "Failed to recover task node");
                    report.errors.push(RecoveryError {
                        task_id: row.id.clone(),
                        error: e.to_string(),
                    });
                    for orphan in index.descendants_of(&row.id) {
                        report.errors.push(RecoveryError {
                            task_id: orphan.id.clone(),
                            error: format!("ancestor {} was not recovered", row.id),
                        });
                    }
                }
            }
        }

        // Parents whose persisted aggregate disagrees with their recovered children.
        for id in rebuilt.iter().rev() {
            if let Err(e) = self.with_forest(|forest| {
                forest.reconcile(id);
                Ok(())
            }) {
                warn!(task_id = %id, error = %e, "Reconcile failed");
            }
        }

        report.duration = started.elapsed();
        info!(
            recovered = report.recovered,
            placeholders = report.placeholders,
            skipped = report.skipped,
            errors = report.errors.len(),
            duration_ms = report.duration.as_millis() as u64,
            "Task tree recovery finished"
        );
        Ok(report)
    }
}

fn recover_row(forest: &mut TaskForest, row: &PersistedTask, index: &RowIndex<'_>) -> crate::error::Result<RowOutcome> {
    if let Some(entry) = forest.entry(&row.id) {
        return Ok(RowOutcome::Skipped {
            descend: matches!(entry, TreeEntry::Live(_)),
        });
    }

    if row.status.is_terminal() {
        let placeholder = TaskNodePlaceholder {
            id: row.id.clone(),
            name: row.name.clone(),
            status: row.status,
            progress: row.progress.min(100),
            completed_at: row.updated_at,
            descendant_count: index.descendants_of(&row.id).len(),
            last_transition: None,
        };
        match &row.parent_id {
            Some(parent) => forest.attach_placeholder(parent, placeholder)?,
            None => forest.insert_placeholder(placeholder)?,
        }
        return Ok(RowOutcome::Placeholder);
    }

    let mut spec = NodeSpec::new(row.name.clone()).id(row.id.clone()).priority(row.priority);
    spec.parent_id = row.parent_id.clone();
    spec.executor = row.executor_name.clone();
    spec.metadata = row.metadata.clone();
    spec.max_retries = row.max_retries;

    forest.create_node(
        spec,
        CreateMode::Recover {
            status: row.status,
            progress: row.progress,
            created_at: row.created_at,
            updated_at: row.updated_at,
        },
    )?;
    Ok(RowOutcome::Recovered)
}
