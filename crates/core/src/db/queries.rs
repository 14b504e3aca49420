//! Typed query helpers for every table in the TaskMerge database.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use tracing::debug;

use super::Database;
use crate::conflict::{
    BranchRegion, ConflictKind, ConflictRecord, ResolutionStatus, ResolutionStrategy,
};
use crate::errors::DatabaseError;
use crate::models::{AuditEntry, SessionState, TaskOutcome, TaskStatus, WorktreeTask};

// ---------------------------------------------------------------------------
// Domain structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `merge_sessions` table.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: String,
    pub target_branch: String,
    pub state: SessionState,
    pub task_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub report_path: Option<String>,
}

/// A row from the `session_tasks` table.
#[derive(Debug, Clone)]
pub struct SessionTaskEntry {
    pub session_id: String,
    pub task_id: String,
    pub position: i64,
    pub outcome: String,
    pub commit_sha: Option<String>,
    pub reason: Option<String>,
    pub decided_at: String,
}

/// A row from the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Raw rows, decoded outside the rusqlite callback
// ---------------------------------------------------------------------------

const TASK_COLUMNS: &str = "task_id, branch_name, worktree_path, base_commit, status, phase,
     depends_on, completed_at, merge_commit";

struct TaskRow {
    task_id: String,
    branch_name: String,
    worktree_path: String,
    base_commit: String,
    status: String,
    phase: i64,
    depends_on: String,
    completed_at: String,
    merge_commit: Option<String>,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(0)?,
            branch_name: row.get(1)?,
            worktree_path: row.get(2)?,
            base_commit: row.get(3)?,
            status: row.get(4)?,
            phase: row.get(5)?,
            depends_on: row.get(6)?,
            completed_at: row.get(7)?,
            merge_commit: row.get(8)?,
        })
    }

    fn decode(self) -> Result<WorktreeTask, DatabaseError> {
        let status = TaskStatus::from_str_val(&self.status).ok_or_else(|| DatabaseError::Corrupt {
            entity: "worktree_task".into(),
            detail: format!("{}: unknown status '{}'", self.task_id, self.status),
        })?;
        let depends_on: Vec<String> =
            serde_json::from_str(&self.depends_on).map_err(|e| DatabaseError::Corrupt {
                entity: "worktree_task".into(),
                detail: format!("{}: depends_on: {e}", self.task_id),
            })?;
        Ok(WorktreeTask {
            task_id: self.task_id,
            branch_name: self.branch_name,
            worktree_path: PathBuf::from(self.worktree_path),
            base_commit: self.base_commit,
            status,
            phase: self.phase,
            depends_on,
            completed_at: parse_datetime(&self.completed_at),
            merge_commit: self.merge_commit,
        })
    }
}

const CONFLICT_COLUMNS: &str = "id, session_id, task_id, file_path, kind, regions, confidence,
     resolution_status, resolution_strategy, result_hash, detail, created_at, resolved_at";

struct ConflictRow {
    id: String,
    session_id: String,
    task_id: String,
    file_path: String,
    kind: String,
    regions: String,
    confidence: f64,
    resolution_status: String,
    resolution_strategy: Option<String>,
    result_hash: Option<String>,
    detail: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
}

impl ConflictRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            task_id: row.get(2)?,
            file_path: row.get(3)?,
            kind: row.get(4)?,
            regions: row.get(5)?,
            confidence: row.get(6)?,
            resolution_status: row.get(7)?,
            resolution_strategy: row.get(8)?,
            result_hash: row.get(9)?,
            detail: row.get(10)?,
            created_at: row.get(11)?,
            resolved_at: row.get(12)?,
        })
    }

    fn decode(self) -> Result<ConflictRecord, DatabaseError> {
        let corrupt = |detail: String| DatabaseError::Corrupt {
            entity: "conflict".into(),
            detail: format!("{}: {detail}", self.id),
        };
        let kind = ConflictKind::from_str_val(&self.kind)
            .ok_or_else(|| corrupt(format!("unknown kind '{}'", self.kind)))?;
        let resolution_status = ResolutionStatus::from_str_val(&self.resolution_status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", self.resolution_status)))?;
        let resolution_strategy = match &self.resolution_strategy {
            Some(s) => Some(
                ResolutionStrategy::from_str_val(s)
                    .ok_or_else(|| corrupt(format!("unknown strategy '{s}'")))?,
            ),
            None => None,
        };
        let regions: Vec<BranchRegion> = serde_json::from_str(&self.regions)
            .map_err(|e| corrupt(format!("regions: {e}")))?;
        Ok(ConflictRecord {
            id: self.id,
            session_id: self.session_id,
            task_id: self.task_id,
            file_path: self.file_path,
            kind,
            regions,
            confidence: self.confidence,
            resolution_status,
            resolution_strategy,
            result_hash: self.result_hash,
            detail: self.detail,
            created_at: parse_datetime(&self.created_at),
            resolved_at: self.resolved_at.as_deref().map(parse_datetime),
        })
    }
}

fn to_json<T: serde::Serialize>(entity: &str, value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Corrupt {
        entity: entity.to_string(),
        detail: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- worktree_tasks -----------------------------------------------------

    /// Insert a task or replace every field of an existing one.
    pub fn upsert_task(&self, task: &WorktreeTask) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let depends_on = to_json("worktree_task", &task.depends_on)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO worktree_tasks (task_id, branch_name, worktree_path, base_commit, status,
             phase, depends_on, completed_at, merge_commit, registered_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(task_id) DO UPDATE SET
                branch_name = excluded.branch_name,
                worktree_path = excluded.worktree_path,
                base_commit = excluded.base_commit,
                status = excluded.status,
                phase = excluded.phase,
                depends_on = excluded.depends_on,
                completed_at = excluded.completed_at,
                merge_commit = excluded.merge_commit,
                updated_at = excluded.updated_at",
            params![
                task.task_id,
                task.branch_name,
                task.worktree_path.to_string_lossy(),
                task.base_commit,
                task.status.to_string(),
                task.phase,
                depends_on,
                task.completed_at.to_rfc3339(),
                task.merge_commit,
                now
            ],
        )?;
        debug!(task_id = %task.task_id, branch = %task.branch_name, "upserted task");
        Ok(())
    }

    /// Look up a task by ID.
    pub fn get_task(&self, task_id: &str) -> Result<Option<WorktreeTask>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM worktree_tasks WHERE task_id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![task_id], TaskRow::read)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row.decode()?)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// List tasks, optionally filtered by status, ordered by phase then
    /// completion time.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<WorktreeTask>, DatabaseError> {
        let conn = self.conn();
        let rows = match status {
            Some(s) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM worktree_tasks WHERE status = ?1
                     ORDER BY phase, completed_at, task_id"
                ))?;
                let rows = stmt
                    .query_map(params![s.to_string()], TaskRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM worktree_tasks ORDER BY phase, completed_at, task_id"
                ))?;
                let rows = stmt
                    .query_map([], TaskRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        rows.into_iter().map(TaskRow::decode).collect()
    }

    /// Update a task's status and recorded merge commit.
    pub fn set_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        merge_commit: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE worktree_tasks SET status = ?1, merge_commit = COALESCE(?2, merge_commit),
             updated_at = ?3 WHERE task_id = ?4",
            params![status.to_string(), merge_commit, now, task_id],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "worktree_task".into(),
                id: task_id.to_string(),
            });
        }
        debug!(task_id, status = %status, "updated task status");
        Ok(())
    }

    // -- merge_sessions -----------------------------------------------------

    /// Start a new session in the `collecting` state.
    pub fn insert_session(&self, id: &str, target_branch: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO merge_sessions (id, target_branch, state, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, target_branch, SessionState::Collecting.to_string(), now],
        )?;
        debug!(id, target_branch, "inserted merge session");
        Ok(())
    }

    /// Move a session from `from` to `to`. Returns `false` when the session
    /// was not in `from`.
    pub fn transition_session(
        &self,
        id: &str,
        from: SessionState,
        to: SessionState,
    ) -> Result<bool, DatabaseError> {
        let completed_at = (to == SessionState::Completed).then(|| Utc::now().to_rfc3339());
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE merge_sessions SET state = ?1, completed_at = COALESCE(?2, completed_at)
             WHERE id = ?3 AND state = ?4",
            params![to.to_string(), completed_at, id, from.to_string()],
        )?;
        debug!(id, from = %from, to = %to, changed, "session transition");
        Ok(changed > 0)
    }

    /// Record the ordered task list collected for a session.
    pub fn set_session_tasks(&self, id: &str, task_ids: &[String]) -> Result<(), DatabaseError> {
        let task_ids = to_json("merge_session", &task_ids)?;
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE merge_sessions SET task_ids = ?1 WHERE id = ?2",
            params![task_ids, id],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "merge_session".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Remember where the session's report was written.
    pub fn set_session_report(&self, id: &str, report_path: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE merge_sessions SET report_path = ?1 WHERE id = ?2",
            params![report_path, id],
        )?;
        Ok(())
    }

    /// Look up a session by ID.
    pub fn get_session(&self, id: &str) -> Result<Option<SessionEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, target_branch, state, task_ids, started_at, completed_at, report_path
             FROM merge_sessions WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;
        let Some(row) = rows.next() else {
            return Ok(None);
        };
        let (id, target_branch, state, task_ids, started_at, completed_at, report_path) = row?;
        let state = SessionState::from_str_val(&state).ok_or_else(|| DatabaseError::Corrupt {
            entity: "merge_session".into(),
            detail: format!("{id}: unknown state '{state}'"),
        })?;
        let task_ids = serde_json::from_str(&task_ids).map_err(|e| DatabaseError::Corrupt {
            entity: "merge_session".into(),
            detail: format!("{id}: task_ids: {e}"),
        })?;
        Ok(Some(SessionEntry {
            id,
            target_branch,
            state,
            task_ids,
            started_at: parse_datetime(&started_at),
            completed_at: completed_at.as_deref().map(parse_datetime),
            report_path,
        }))
    }

    /// Record what happened to one task in a session.
    pub fn record_task_outcome(
        &self,
        session_id: &str,
        task_id: &str,
        position: usize,
        outcome: &TaskOutcome,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO session_tasks
             (session_id, task_id, position, outcome, commit_sha, reason, decided_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                task_id,
                position as i64,
                outcome.label(),
                outcome.commit(),
                outcome.reason(),
                now
            ],
        )?;
        debug!(session_id, task_id, outcome = outcome.label(), "recorded task outcome");
        Ok(())
    }

    /// Outcomes recorded for a session, in merge order.
    pub fn list_session_outcomes(
        &self,
        session_id: &str,
    ) -> Result<Vec<SessionTaskEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT session_id, task_id, position, outcome, commit_sha, reason, decided_at
             FROM session_tasks WHERE session_id = ?1 ORDER BY position",
        )?;
        let entries = stmt
            .query_map(params![session_id], |row| {
                Ok(SessionTaskEntry {
                    session_id: row.get(0)?,
                    task_id: row.get(1)?,
                    position: row.get(2)?,
                    outcome: row.get(3)?,
                    commit_sha: row.get(4)?,
                    reason: row.get(5)?,
                    decided_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -- conflicts ----------------------------------------------------------

    /// Insert a new conflict record.
    pub fn insert_conflict(&self, record: &ConflictRecord) -> Result<(), DatabaseError> {
        let regions = to_json("conflict", &record.regions)?;
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO conflicts ({CONFLICT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                record.id,
                record.session_id,
                record.task_id,
                record.file_path(),
                record.kind().as_str(),
                regions,
                record.confidence,
                record.resolution_status().as_str(),
                record.resolution_strategy.map(|s| s.as_str()),
                record.result_hash,
                record.detail,
                record.created_at.to_rfc3339(),
                record.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        debug!(id = %record.id, file_path = %record.file_path(), kind = %record.kind(), "inserted conflict");
        Ok(())
    }

    /// Persist the settled resolution of a conflict.
    ///
    /// Only a pending row is updated. Returns `false` when the stored row was
    /// already settled.
    pub fn settle_conflict(&self, record: &ConflictRecord) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE conflicts SET resolution_status = ?1, resolution_strategy = ?2,
             result_hash = ?3, detail = ?4, resolved_at = ?5
             WHERE id = ?6 AND resolution_status = 'pending'",
            params![
                record.resolution_status().as_str(),
                record.resolution_strategy.map(|s| s.as_str()),
                record.result_hash,
                record.detail,
                record.resolved_at.map(|t| t.to_rfc3339()),
                record.id,
            ],
        )?;
        if changed == 0 {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM conflicts WHERE id = ?1",
                params![record.id],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(DatabaseError::NotFound {
                    entity: "conflict".into(),
                    id: record.id.clone(),
                });
            }
            return Ok(false);
        }
        debug!(id = %record.id, status = %record.resolution_status(), "settled conflict");
        Ok(true)
    }

    /// Get a conflict by ID.
    pub fn get_conflict(&self, id: &str) -> Result<Option<ConflictRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id], ConflictRow::read)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row.decode()?)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Conflicts recorded in a session, in detection order.
    pub fn list_session_conflicts(
        &self,
        session_id: &str,
    ) -> Result<Vec<ConflictRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE session_id = ?1
             ORDER BY created_at, rowid"
        ))?;
        let rows = stmt
            .query_map(params![session_id], ConflictRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ConflictRow::decode).collect()
    }

    /// Count conflicts by resolution status.
    pub fn count_conflicts_by_status(
        &self,
        status: ResolutionStatus,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conflicts WHERE resolution_status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Drop the conflicts a task recorded in a session. Used when a merge
    /// attempt is abandoned and redone against a newer target.
    pub fn discard_task_conflicts(
        &self,
        session_id: &str,
        task_id: &str,
    ) -> Result<usize, DatabaseError> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM conflicts WHERE session_id = ?1 AND task_id = ?2",
            params![session_id, task_id],
        )?;
        if removed > 0 {
            debug!(session_id, task_id, removed, "discarded conflicts of abandoned attempt");
        }
        Ok(removed)
    }

    // -- audit_log ----------------------------------------------------------

    /// Insert an audit entry from a model struct.
    pub fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, session_id, task_id, details, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.action,
                entry.session_id,
                entry.task_id,
                entry.details,
                entry.success,
                entry.timestamp.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action = %entry.action, "inserted audit_log entry");
        Ok(id)
    }

    /// List recent audit-log entries.
    pub fn list_audit_log(&self, limit: u32) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, session_id, task_id, details, success, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    session_id: row.get(2)?,
                    task_id: row.get(3)?,
                    details: row.get(4)?,
                    success: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Count all audit-log entries.
    pub fn count_audit_log(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// Parse a datetime string, returning Utc::now() as a fallback if parsing fails.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
