//! Worktree task registry.
//!
//! An explicit SQLite index from task ID to branch and worktree location.
//! Tasks are registered by whatever produced the build (the CLI `register`
//! command in practice); the engine only reads them back and updates their
//! status after a merge decision.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::db::Database;
use crate::errors::DatabaseError;
use crate::models::{TaskStatus, WorktreeTask};

/// Lookup and status bookkeeping for worktree tasks.
#[derive(Clone)]
pub struct WorktreeRegistry {
    db: Arc<Database>,
}

impl WorktreeRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Find a task by ID.
    pub fn locate(&self, task_id: &str) -> Result<WorktreeTask, DatabaseError> {
        self.db
            .get_task(task_id)?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "worktree_task".into(),
                id: task_id.to_string(),
            })
    }

    /// Add a task, or refresh an existing one after a rebuild.
    ///
    /// Re-registering resets the status to pending but keeps a previously
    /// recorded merge commit, so a task that was already integrated is still
    /// recognised as such.
    pub fn register(&self, mut task: WorktreeTask) -> Result<(), DatabaseError> {
        if let Some(existing) = self.db.get_task(&task.task_id)? {
            if task.merge_commit.is_none() {
                task.merge_commit = existing.merge_commit;
            }
            debug!(task_id = %task.task_id, previous = %existing.status, "re-registering task");
        }
        task.depends_on.retain(|dep| dep != &task.task_id);
        self.db.upsert_task(&task)?;
        info!(
            task_id = %task.task_id,
            branch = %task.branch_name,
            phase = task.phase,
            "task registered"
        );
        Ok(())
    }

    /// All tasks, or only those with `status`.
    pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<WorktreeTask>, DatabaseError> {
        self.db.list_tasks(status)
    }

    /// Mark a task merged, recording its merge commit when one was made.
    pub fn mark_merged(&self, task_id: &str, commit: Option<&str>) -> Result<(), DatabaseError> {
        self.db.set_task_status(task_id, TaskStatus::Merged, commit)
    }

    pub fn mark_blocked(&self, task_id: &str) -> Result<(), DatabaseError> {
        self.db.set_task_status(task_id, TaskStatus::Blocked, None)
    }
}

/// Tasks put in merge order, plus those that can never be ordered.
#[derive(Debug, Default)]
pub struct MergeOrder {
    pub ordered: Vec<WorktreeTask>,
    /// Tasks caught in a dependency cycle.
    pub cyclic: Vec<WorktreeTask>,
}

type OrderKey = (i64, DateTime<Utc>, String);

fn order_key(task: &WorktreeTask) -> OrderKey {
    (task.phase, task.completed_at, task.task_id.clone())
}

/// Order tasks so every task comes after the tasks it depends on; ties go
/// to the lower phase, then the earlier completion time.
///
/// Dependencies on tasks outside `tasks` do not constrain the order; the
/// orchestrator checks them separately.
pub fn merge_order(tasks: Vec<WorktreeTask>) -> MergeOrder {
    let ids: BTreeSet<String> = tasks.iter().map(|t| t.task_id.clone()).collect();
    let mut indegree: HashMap<String, usize> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for task in &tasks {
        let deps: BTreeSet<&String> = task.depends_on.iter().filter(|d| ids.contains(*d)).collect();
        indegree.insert(task.task_id.clone(), deps.len());
        for dep in deps {
            dependents
                .entry(dep.clone())
                .or_default()
                .push(task.task_id.clone());
        }
    }

    let mut by_id: HashMap<String, WorktreeTask> =
        tasks.into_iter().map(|t| (t.task_id.clone(), t)).collect();
    let mut ready: BTreeSet<OrderKey> = by_id
        .values()
        .filter(|t| indegree.get(&t.task_id) == Some(&0))
        .map(order_key)
        .collect();

    let mut order = MergeOrder::default();
    while let Some(key) = ready.pop_first() {
        let id = key.2;
        for dependent in dependents.remove(&id).unwrap_or_default() {
            if let Some(count) = indegree.get_mut(&dependent) {
                *count -= 1;
                if *count == 0 {
                    if let Some(task) = by_id.get(&dependent) {
                        ready.insert(order_key(task));
                    }
                }
            }
        }
        if let Some(task) = by_id.remove(&id) {
            order.ordered.push(task);
        }
    }

    let mut cyclic: Vec<WorktreeTask> = by_id.into_values().collect();
    cyclic.sort_by_key(order_key);
    order.cyclic = cyclic;
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task(id: &str, phase: i64, minutes_ago: i64, deps: &[&str]) -> WorktreeTask {
        let mut t = WorktreeTask::new(id, format!("task/{id}"), format!("/work/{id}"), "base");
        t.phase = phase;
        t.completed_at = Utc::now() - Duration::minutes(minutes_ago);
        t.depends_on = deps.iter().map(|d| d.to_string()).collect();
        t
    }

    fn registry() -> WorktreeRegistry {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        WorktreeRegistry::new(Arc::new(db))
    }

    fn ids(tasks: &[WorktreeTask]) -> Vec<&str> {
        tasks.iter().map(|t| t.task_id.as_str()).collect()
    }

    #[test]
    fn test_locate_missing_task() {
        let registry = registry();
        let err = registry.locate("nope").unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { ref entity, .. } if entity == "worktree_task"));
    }

    #[test]
    fn test_register_and_mark() {
        let registry = registry();
        registry.register(task("a", 0, 5, &["a"])).unwrap();
        let located = registry.locate("a").unwrap();
        assert!(located.depends_on.is_empty());
        assert_eq!(located.status, TaskStatus::Pending);

        registry.mark_merged("a", Some("c0ffee")).unwrap();
        assert_eq!(registry.list(Some(TaskStatus::Merged)).unwrap().len(), 1);

        // A rebuild resets the status but remembers the merge commit.
        registry.register(task("a", 0, 1, &[])).unwrap();
        let located = registry.locate("a").unwrap();
        assert_eq!(located.status, TaskStatus::Pending);
        assert_eq!(located.merge_commit.as_deref(), Some("c0ffee"));

        registry.mark_blocked("a").unwrap();
        assert_eq!(registry.locate("a").unwrap().status, TaskStatus::Blocked);
    }

    #[test]
    fn test_order_by_phase_then_completion() {
        let order = merge_order(vec![
            task("late", 0, 1, &[]),
            task("early", 0, 10, &[]),
            task("phase1", 1, 30, &[]),
        ]);
        assert_eq!(ids(&order.ordered), vec!["early", "late", "phase1"]);
        assert!(order.cyclic.is_empty());
    }

    #[test]
    fn test_dependencies_override_phase() {
        let order = merge_order(vec![
            task("ui", 0, 10, &["api"]),
            task("api", 2, 1, &["schema"]),
            task("schema", 3, 1, &[]),
            task("docs", 1, 5, &["elsewhere"]),
        ]);
        assert_eq!(ids(&order.ordered), vec!["docs", "schema", "api", "ui"]);
    }

    #[test]
    fn test_cycles_are_reported() {
        let order = merge_order(vec![
            task("a", 0, 1, &["b"]),
            task("b", 0, 2, &["a"]),
            task("c", 0, 3, &[]),
        ]);
        assert_eq!(ids(&order.ordered), vec!["c"]);
        assert_eq!(ids(&order.cyclic), vec!["b", "a"]);
    }
}
