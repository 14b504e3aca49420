//! Merge orchestration.
//!
//! The [`MergeOrchestrator`] runs one session at a time through
//! `collecting -> merging -> completed`:
//!
//! 1. Collect the tasks to merge and put them in dependency order.
//! 2. For each task, take the merge lock and check whether the task is
//!    already integrated.
//! 3. Diff task and target against their merge base; files changed on one
//!    side only take that side, files changed on both go through the
//!    analyzer, detector, auto merger and resolver.
//! 4. Commit a two-parent merge onto the target, or block the task.
//! 5. Write the session report.
//!
//! Tasks are independent: a blocked task never undoes an earlier merge.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analyzer::SemanticAnalyzer;
use crate::config::EngineConfig;
use crate::conflict::{
    AiResolver, AutoMerger, ConflictDetector, ConflictRecord, FileVersions, ResolutionStatus,
};
use crate::db::Database;
use crate::errors::{GitError, MergeError};
use crate::git::{CommitRequest, FileWrite, VersionedRepo};
use crate::models::{AuditEntry, SessionState, TaskOutcome, TaskStatus, WorktreeTask};
use crate::registry::{merge_order, WorktreeRegistry};
use crate::report::{ConflictReport, MergeReport, TaskReport};
use crate::retry::RetryPolicy;
use crate::timeline::TimelineTracker;

/// Marker embedded in merge commit messages written by the orchestrator.
pub const MERGE_MARKER: &str = "[taskmerge]";

// ---------------------------------------------------------------------------
// Merge lock
// ---------------------------------------------------------------------------

/// Process-local lock serializing commits to the target branch.
#[derive(Clone)]
pub struct MergeLock {
    inner: Arc<tokio::sync::Mutex<()>>,
    wait: Duration,
}

impl MergeLock {
    pub fn new(wait: Duration) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(())),
            wait,
        }
    }

    /// Wait up to the configured bound for the lock.
    pub async fn acquire(&self) -> Option<OwnedMutexGuard<()>> {
        tokio::time::timeout(self.wait, Arc::clone(&self.inner).lock_owned())
            .await
            .ok()
    }

    /// Same lock, different wait bound.
    pub fn with_wait(&self, wait: Duration) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            wait,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Result of analyzing one file changed on both sides.
struct FileOutcome {
    path: String,
    versions: FileVersions,
    record: Option<ConflictRecord>,
}

/// Sequences per-task merges onto the target branch.
pub struct MergeOrchestrator {
    config: EngineConfig,
    db: Arc<Database>,
    repo: Arc<dyn VersionedRepo>,
    registry: WorktreeRegistry,
    timeline: Arc<TimelineTracker>,
    analyzer: SemanticAnalyzer,
    auto_merger: AutoMerger,
    resolver: AiResolver,
    lock: MergeLock,
    repo_policy: RetryPolicy,
    /// Cooperative cancellation, checked between tasks.
    cancel: Arc<AtomicBool>,
    /// Atomic flag preventing concurrent sessions.
    running: Arc<AtomicBool>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl MergeOrchestrator {
    /// Build an orchestrator and all its components from `config`.
    pub fn new(config: EngineConfig, db: Arc<Database>, repo: Arc<dyn VersionedRepo>) -> Self {
        info!(
            repo = %config.engine.repo_path.display(),
            target = %config.engine.target_branch,
            "initializing merge orchestrator"
        );
        let timeline = Arc::new(TimelineTracker::new(
            config.engine.timeline_path(),
            Arc::clone(&repo),
            &config.timeline,
        ));
        Self {
            registry: WorktreeRegistry::new(Arc::clone(&db)),
            analyzer: SemanticAnalyzer::new(&config.analyzer),
            auto_merger: AutoMerger::new(&config.merge),
            resolver: AiResolver::from_config(&config.resolver),
            lock: MergeLock::new(config.merge.lock_timeout()),
            repo_policy: config.repository.retry.policy(),
            cancel: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            started_at: Mutex::new(None),
            timeline,
            config,
            db,
            repo,
        }
    }

    /// Replace the resolver built from the configuration.
    pub fn with_resolver(mut self, resolver: AiResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Share a merge lock with other orchestrators on the same target.
    pub fn with_lock(mut self, lock: MergeLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn registry(&self) -> &WorktreeRegistry {
        &self.registry
    }

    pub fn timeline(&self) -> &TimelineTracker {
        &self.timeline
    }

    pub fn lock(&self) -> &MergeLock {
        &self.lock
    }

    /// Flag that stops the session before the next task when set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Run one merge session.
    ///
    /// With `task_ids` the listed tasks are merged whatever their status;
    /// otherwise every pending task is. Per-task failures are reported in the
    /// returned [`MergeReport`]; only bookkeeping failures return `Err`.
    pub async fn run(&self, task_ids: Option<&[String]>) -> Result<MergeReport, MergeError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let started_at = *self
                .started_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            return Err(MergeError::AlreadyRunning {
                started_at: started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            });
        }
        let _guard = SessionGuard(self.running.clone());
        let started_at = Utc::now();
        *self
            .started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(started_at);

        let session_id = Uuid::new_v4().to_string();
        let result = self.run_session(&session_id, started_at, task_ids).await;
        self.cancel.store(false, Ordering::SeqCst);

        let audit = match &result {
            Ok(report) => AuditEntry::success(
                "merge_session",
                &format!(
                    "merged: {}, already merged: {}, blocked: {}, busy: {}, cancelled: {}",
                    report.count_outcome("merged"),
                    report.count_outcome("already_merged"),
                    report.count_outcome("blocked"),
                    report.count_outcome("target_busy"),
                    report.count_outcome("cancelled"),
                ),
            ),
            Err(e) => AuditEntry::failure("merge_session", &format!("session failed: {e}")),
        };
        let _ = self.db.insert_audit_entry(&audit.for_session(&session_id));
        result
    }

    async fn run_session(
        &self,
        session_id: &str,
        started_at: DateTime<Utc>,
        task_ids: Option<&[String]>,
    ) -> Result<MergeReport, MergeError> {
        let target = self.config.engine.target_branch.clone();
        let mut report = MergeReport::new(session_id, &target, started_at);

        // -- collecting -----------------------------------------------------
        let tasks = match task_ids {
            Some(ids) => ids
                .iter()
                .map(|id| match self.registry.locate(id) {
                    Ok(task) => Ok(task),
                    Err(crate::errors::DatabaseError::NotFound { .. }) => {
                        Err(MergeError::TaskNotFound(id.clone()))
                    }
                    Err(e) => Err(e.into()),
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => self.registry.list(Some(TaskStatus::Pending))?,
        };
        self.db.insert_session(session_id, &target)?;
        let order = merge_order(tasks);
        let session_tasks: Vec<String> = order
            .ordered
            .iter()
            .chain(order.cyclic.iter())
            .map(|t| t.task_id.clone())
            .collect();
        self.db.set_session_tasks(session_id, &session_tasks)?;
        info!(
            session_id,
            target = %target,
            tasks = session_tasks.len(),
            "merge session collected tasks"
        );

        // -- merging --------------------------------------------------------
        self.transition(&mut report, SessionState::Merging)?;
        let mut failed: HashSet<String> = HashSet::new();
        let mut position = 0;
        for task in &order.ordered {
            let (outcome, records) = if self.cancel.load(Ordering::SeqCst) {
                (TaskOutcome::Cancelled, Vec::new())
            } else if let Some(reason) = self.unmet_dependency(task, &failed, &session_tasks)? {
                (TaskOutcome::Blocked { reason }, Vec::new())
            } else {
                self.merge_task(session_id, task).await
            };
            if !outcome.is_success() {
                failed.insert(task.task_id.clone());
            }
            self.settle_task(session_id, task, position, &outcome, &mut report)?;
            report
                .conflicts
                .extend(records.iter().map(ConflictReport::from));
            position += 1;
        }
        for task in &order.cyclic {
            let outcome = TaskOutcome::Blocked {
                reason: "dependency cycle".into(),
            };
            self.settle_task(session_id, task, position, &outcome, &mut report)?;
            position += 1;
        }

        // -- completed ------------------------------------------------------
        self.transition(&mut report, SessionState::Completed)?;
        report.completed_at = Some(Utc::now());
        let path = report.write(&self.config.engine.reports_dir())?;
        self.db
            .set_session_report(session_id, &path.to_string_lossy())?;
        info!(
            session_id,
            merged = report.count_outcome("merged"),
            blocked = report.count_outcome("blocked"),
            "merge session completed"
        );
        Ok(report)
    }

    fn transition(&self, report: &mut MergeReport, to: SessionState) -> Result<(), MergeError> {
        let from = report.state;
        if !from.can_transition_to(to)
            || !self.db.transition_session(&report.session_id, from, to)?
        {
            return Err(MergeError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        report.state = to;
        Ok(())
    }

    /// Why `task` cannot merge yet, if one of its dependencies is missing.
    fn unmet_dependency(
        &self,
        task: &WorktreeTask,
        failed: &HashSet<String>,
        session_tasks: &[String],
    ) -> Result<Option<String>, MergeError> {
        for dep in &task.depends_on {
            if failed.contains(dep) {
                return Ok(Some(format!("dependency {dep} was not merged")));
            }
            if session_tasks.contains(dep) {
                continue;
            }
            match self.db.get_task(dep)? {
                Some(t) if t.status == TaskStatus::Merged => {}
                Some(_) => return Ok(Some(format!("dependency {dep} is not merged"))),
                None => return Ok(Some(format!("dependency {dep} is not registered"))),
            }
        }
        Ok(None)
    }

    /// Persist a task's outcome and update its registry status.
    fn settle_task(
        &self,
        session_id: &str,
        task: &WorktreeTask,
        position: usize,
        outcome: &TaskOutcome,
        report: &mut MergeReport,
    ) -> Result<(), MergeError> {
        self.db
            .record_task_outcome(session_id, &task.task_id, position, outcome)?;
        match outcome {
            TaskOutcome::Merged { commit } => {
                self.registry.mark_merged(&task.task_id, Some(commit))?
            }
            TaskOutcome::AlreadyMerged { commit } => self
                .registry
                .mark_merged(&task.task_id, commit.as_deref())?,
            TaskOutcome::Blocked { .. } => self.registry.mark_blocked(&task.task_id)?,
            TaskOutcome::TargetBusy | TaskOutcome::Cancelled => {}
        }

        let details = match outcome {
            TaskOutcome::Merged { commit } => format!("merged as {commit}"),
            TaskOutcome::AlreadyMerged { .. } => "already merged".to_string(),
            TaskOutcome::Blocked { reason } => format!("blocked: {reason}"),
            TaskOutcome::TargetBusy => "target branch busy".to_string(),
            TaskOutcome::Cancelled => "cancelled".to_string(),
        };
        let audit = if outcome.is_success() {
            AuditEntry::success("task_merge", &details)
        } else {
            AuditEntry::failure("task_merge", &details)
        };
        let _ = self
            .db
            .insert_audit_entry(&audit.for_session(session_id).for_task(&task.task_id));
        info!(task_id = %task.task_id, outcome = outcome.label(), "task settled");

        report.tasks.push(TaskReport::new(&task.task_id, outcome));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Per-task merge
    // -----------------------------------------------------------------------

    /// Merge one task under the merge lock. Never fails: errors block the
    /// task with the error as reason.
    async fn merge_task(
        &self,
        session_id: &str,
        task: &WorktreeTask,
    ) -> (TaskOutcome, Vec<ConflictRecord>) {
        let Some(_lock) = self.lock.acquire().await else {
            warn!(task_id = %task.task_id, "merge lock wait expired");
            return (TaskOutcome::TargetBusy, Vec::new());
        };

        let mut attempt = 1;
        loop {
            match self.try_merge_task(session_id, task).await {
                Ok(result) => return result,
                Err(MergeError::GitError(e @ GitError::RefMoved { .. }))
                    if attempt < self.repo_policy.max_attempts =>
                {
                    warn!(task_id = %task.task_id, attempt, error = %e, "target moved, redoing merge");
                    if let Err(e) = self.db.discard_task_conflicts(session_id, &task.task_id) {
                        return Self::failed(task, e.into());
                    }
                    attempt += 1;
                }
                Err(e) => {
                    // The report carries no conflicts for a failed attempt.
                    if let Err(e) = self.db.discard_task_conflicts(session_id, &task.task_id) {
                        warn!(task_id = %task.task_id, error = %e, "could not discard conflicts");
                    }
                    return Self::failed(task, e);
                }
            }
        }
    }

    fn failed(task: &WorktreeTask, error: MergeError) -> (TaskOutcome, Vec<ConflictRecord>) {
        warn!(task_id = %task.task_id, error = %error, "task merge failed");
        (
            TaskOutcome::Blocked {
                reason: error.to_string(),
            },
            Vec::new(),
        )
    }

    async fn try_merge_task(
        &self,
        session_id: &str,
        task: &WorktreeTask,
    ) -> Result<(TaskOutcome, Vec<ConflictRecord>), MergeError> {
        let target = self.config.engine.target_branch.clone();
        let tip = {
            let target = target.clone();
            self.repo_call("resolve target", move |repo| repo.resolve_ref(&target))
                .await?
        };
        let head = {
            let branch = task.branch_name.clone();
            self.repo_call("resolve task branch", move |repo| repo.resolve_ref(&branch))
                .await?
        };

        if let Some(commit) = self.already_merged(task, &tip, &head).await? {
            info!(task_id = %task.task_id, "task already merged");
            return Ok((TaskOutcome::AlreadyMerged { commit }, Vec::new()));
        }

        let base = {
            let (tip, head) = (tip.clone(), head.clone());
            self.repo_call("merge base", move |repo| repo.merge_base(&tip, &head))
                .await?
        }
        .unwrap_or_else(|| task.base_commit.clone());
        debug!(task_id = %task.task_id, tip = %tip, head = %head, base = %base, "merging task");

        let ours = self.touched_paths(&base, &tip).await?;
        let theirs = self.touched_paths(&base, &head).await?;

        let mut writes = Vec::new();
        let mut records = Vec::new();
        let mut both = Vec::new();
        for path in &theirs {
            if !ours.contains(path) {
                writes.push(FileWrite::entry_at(path.as_str(), head.as_str()));
                continue;
            }
            let base_bytes = self.show(&base, path).await?;
            let ours_bytes = self.show(&tip, path).await?;
            let theirs_bytes = self.show(&head, path).await?;
            if ours_bytes == theirs_bytes || base_bytes == theirs_bytes {
                continue;
            }
            if base_bytes == ours_bytes {
                writes.push(FileWrite::entry_at(path.as_str(), head.as_str()));
                continue;
            }

            let texts = match (&ours_bytes, &theirs_bytes) {
                (Some(o), Some(t)) => {
                    let b = base_bytes.as_deref().map(decode_text).unwrap_or(Some(String::new()));
                    match (b, decode_text(o), decode_text(t)) {
                        (Some(b), Some(o), Some(t)) => Ok((b, o, t)),
                        _ => Err("binary file changed on both sides"),
                    }
                }
                _ => Err("deleted on one side and modified on the other"),
            };
            match texts {
                Ok((b, o, t)) => both.push((path.clone(), b, o, t)),
                Err(reason) => {
                    let mut record =
                        ConflictDetector::opaque(session_id, &task.task_id, path, reason);
                    self.db.insert_conflict(&record)?;
                    record.give_up(reason)?;
                    self.db.settle_conflict(&record)?;
                    records.push(record);
                }
            }
        }

        for outcome in self.analyze_files(session_id, task, &target, both).await? {
            let FileOutcome {
                path,
                versions,
                record,
            } = outcome;
            let Some(mut record) = record else {
                match self.auto_merger.merge_disjoint(&versions) {
                    Some(merged) => writes.push(text_write(&path, merged)),
                    None => {
                        let reason = "non-interacting edits could not be combined";
                        let mut record =
                            ConflictDetector::opaque(session_id, &task.task_id, &path, reason);
                        self.db.insert_conflict(&record)?;
                        record.give_up(reason)?;
                        self.db.settle_conflict(&record)?;
                        records.push(record);
                    }
                }
                continue;
            };

            self.db.insert_conflict(&record)?;
            let merged = match self.auto_merger.resolve(&mut record, &versions)? {
                Some(merged) => Some(merged),
                None => self.resolver.resolve(&mut record, &versions).await?,
            };
            self.db.settle_conflict(&record)?;
            if let Some(merged) = merged {
                writes.push(text_write(&path, merged));
            }
            records.push(record);
        }

        let unresolved: Vec<&str> = records
            .iter()
            .filter(|r| r.resolution_status() == ResolutionStatus::Unresolved)
            .map(|r| r.file_path())
            .collect();
        if !unresolved.is_empty() {
            let reason = format!(
                "{} unresolved conflict(s): {}",
                unresolved.len(),
                unresolved.join(", ")
            );
            info!(task_id = %task.task_id, reason = %reason, "task blocked");
            return Ok((TaskOutcome::Blocked { reason }, records));
        }

        let request = CommitRequest {
            branch: target.clone(),
            expected_tip: Some(tip.clone()),
            parents: vec![tip, head],
            files: writes,
            message: format!(
                "Merge task {} ({}) into {}\n\n{} task {}",
                task.task_id, task.branch_name, target, MERGE_MARKER, task.task_id
            ),
            author_name: self.config.merge.commit_author_name.clone(),
            author_email: self.config.merge.commit_author_email.clone(),
        };
        let commit = self.commit(request).await?;

        let timeline = Arc::clone(&self.timeline);
        let recorded = commit.clone();
        let _ = tokio::task::spawn_blocking(move || timeline.record_commit(&recorded)).await;

        info!(task_id = %task.task_id, commit = %commit, "task merged");
        Ok((TaskOutcome::Merged { commit }, records))
    }

    /// The evidence that `task` is already in the target, if any.
    async fn already_merged(
        &self,
        task: &WorktreeTask,
        tip: &str,
        head: &str,
    ) -> Result<Option<Option<String>>, MergeError> {
        if let Some(recorded) = &task.merge_commit {
            let (recorded, tip) = (recorded.clone(), tip.to_string());
            let reachable = self
                .repo_call("check recorded merge", move |repo| {
                    match repo.is_ancestor(&recorded, &tip) {
                        Err(GitError::RefNotFound(_)) => Ok(false),
                        other => other,
                    }
                })
                .await?;
            if reachable {
                return Ok(Some(task.merge_commit.clone()));
            }
        }
        let (head, tip) = (head.to_string(), tip.to_string());
        let contained = self
            .repo_call("check task head", move |repo| repo.is_ancestor(&head, &tip))
            .await?;
        Ok(contained.then_some(None))
    }

    /// Paths a side changed since `base`, with both ends of renames.
    async fn touched_paths(&self, base: &str, rev: &str) -> Result<BTreeSet<String>, MergeError> {
        let (base, rev) = (base.to_string(), rev.to_string());
        let changes = self
            .repo_call("changed paths", move |repo| repo.changed_paths(&base, &rev))
            .await?;
        Ok(changes
            .into_iter()
            .flat_map(|c| std::iter::once(c.path).chain(c.old_path))
            .collect())
    }

    async fn show(&self, rev: &str, path: &str) -> Result<Option<Vec<u8>>, MergeError> {
        let (rev, path) = (rev.to_string(), path.to_string());
        Ok(self
            .repo_call("show file", move |repo| repo.show_file(&rev, &path))
            .await?)
    }

    /// Analyze and classify every file changed on both sides in parallel.
    async fn analyze_files(
        &self,
        session_id: &str,
        task: &WorktreeTask,
        target: &str,
        files: Vec<(String, String, String, String)>,
    ) -> Result<Vec<FileOutcome>, MergeError> {
        let mut set = JoinSet::new();
        for (path, base, ours, theirs) in files {
            let analyzer = self.analyzer.clone();
            let session_id = session_id.to_string();
            let task_id = task.task_id.clone();
            let task_branch = task.branch_name.clone();
            let target = target.to_string();
            set.spawn_blocking(move || {
                let versions = FileVersions::analyze(&analyzer, &path, base, ours, theirs);
                let record = ConflictDetector::detect(
                    &session_id,
                    &task_id,
                    &target,
                    &task_branch,
                    &versions,
                );
                FileOutcome {
                    path,
                    versions,
                    record,
                }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            let outcome = joined.map_err(|e| {
                MergeError::GitError(GitError::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("analysis task failed: {e}"),
                )))
            })?;
            outcomes.push(outcome);
        }
        outcomes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(outcomes)
    }

    /// Write the merge commit. Not retried here: a moved target means the
    /// whole task has to be merged again.
    async fn commit(&self, request: CommitRequest) -> Result<String, MergeError> {
        let policy = RetryPolicy::once(self.repo_policy.timeout);
        let request = Arc::new(request);
        Ok(self
            .repo_call_with(policy, "commit merge", move |repo| {
                repo.commit_files(&request)
            })
            .await?)
    }

    /// Run a blocking repository call with the repository retry policy.
    async fn repo_call<T, F>(&self, operation: &'static str, f: F) -> Result<T, GitError>
    where
        T: Send + 'static,
        F: Fn(&dyn VersionedRepo) -> Result<T, GitError> + Send + Sync + 'static,
    {
        self.repo_call_with(self.repo_policy, operation, f).await
    }

    async fn repo_call_with<T, F>(
        &self,
        policy: RetryPolicy,
        operation: &'static str,
        f: F,
    ) -> Result<T, GitError>
    where
        T: Send + 'static,
        F: Fn(&dyn VersionedRepo) -> Result<T, GitError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let repo = Arc::clone(&self.repo);
        policy
            .run(
                operation,
                move |_| {
                    let f = Arc::clone(&f);
                    let repo = Arc::clone(&repo);
                    async move {
                        tokio::task::spawn_blocking(move || f(repo.as_ref()))
                            .await
                            .map_err(|e| {
                                GitError::IoError(std::io::Error::new(
                                    std::io::ErrorKind::Other,
                                    e.to_string(),
                                ))
                            })?
                    }
                },
                || GitError::Timeout(operation.to_string()),
                GitError::is_transient,
            )
            .await
    }
}

/// Text content, or `None` for binary data.
fn decode_text(bytes: &[u8]) -> Option<String> {
    if bytes.contains(&0) {
        return None;
    }
    String::from_utf8(bytes.to_vec()).ok()
}

fn text_write(path: &str, content: String) -> FileWrite {
    FileWrite::content(path, content)
}

/// Drop guard that resets the `running` flag to `false`.
struct SessionGuard(Arc<AtomicBool>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_text() {
        assert_eq!(decode_text(b"fn main() {}\n").as_deref(), Some("fn main() {}\n"));
        assert!(decode_text(b"PNG\0\x01").is_none());
        assert!(decode_text(&[0xff, 0xfe, 0x41]).is_none());
    }

    #[tokio::test]
    async fn test_merge_lock_bounded_wait() {
        let lock = MergeLock::new(Duration::from_millis(20));
        let held = lock.acquire().await.unwrap();
        assert!(lock.acquire().await.is_none());
        assert!(lock.with_wait(Duration::from_millis(5)).acquire().await.is_none());
        drop(held);
        assert!(lock.acquire().await.is_some());
    }

    #[test]
    fn test_session_guard_resets_flag() {
        let flag = Arc::new(AtomicBool::new(true));
        {
            let _guard = SessionGuard(flag.clone());
        }
        assert!(!flag.load(Ordering::SeqCst));
    }
}
