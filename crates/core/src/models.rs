//! Domain model types shared by the registry, timeline, orchestrator and
//! database layer.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Worktree tasks
// ---------------------------------------------------------------------------

/// Merge status of a task branch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Merged,
    Blocked,
}

impl TaskStatus {
    /// Parse a status string into a `TaskStatus`.
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "merged" => Some(Self::Merged),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Merged => write!(f, "merged"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// A completed build living on its own branch and worktree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorktreeTask {
    pub task_id: String,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    /// Commit the task branch diverged from.
    pub base_commit: String,
    pub status: TaskStatus,
    /// Lower phases merge first.
    pub phase: i64,
    /// Tasks that must be merged before this one.
    pub depends_on: Vec<String>,
    /// When the build finished.
    pub completed_at: DateTime<Utc>,
    /// Merge commit recorded when the task was integrated.
    pub merge_commit: Option<String>,
}

impl WorktreeTask {
    /// A pending task with no dependencies in phase 0.
    pub fn new(
        task_id: impl Into<String>,
        branch_name: impl Into<String>,
        worktree_path: impl Into<PathBuf>,
        base_commit: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            branch_name: branch_name.into(),
            worktree_path: worktree_path.into(),
            base_commit: base_commit.into(),
            status: TaskStatus::Pending,
            phase: 0,
            depends_on: Vec::new(),
            completed_at: Utc::now(),
            merge_commit: None,
        }
    }
}

// ---------------------------------------------------------------------------
// File timeline
// ---------------------------------------------------------------------------

/// How a commit touched a file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimelineChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl std::fmt::Display for TimelineChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Modified => write!(f, "modified"),
            Self::Deleted => write!(f, "deleted"),
            Self::Renamed => write!(f, "renamed"),
        }
    }
}

/// One line of the append-only timeline log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileTimelineEntry {
    pub commit_sha: String,
    pub timestamp: DateTime<Utc>,
    pub file_path: String,
    pub change_kind: TimelineChangeKind,
    pub parent_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Merge sessions
// ---------------------------------------------------------------------------

/// Orchestration session lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Collecting,
    Merging,
    Completed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Collecting, Self::Merging) | (Self::Merging, Self::Completed)
        )
    }

    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "collecting" => Some(Self::Collecting),
            "merging" => Some(Self::Merging),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Collecting => write!(f, "collecting"),
            Self::Merging => write!(f, "merging"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// What happened to one task within a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TaskOutcome {
    /// A merge commit advanced the target branch.
    Merged { commit: String },
    /// The task was already reflected in the target; nothing was written.
    AlreadyMerged { commit: Option<String> },
    /// Conflicts remained or the task failed; the target is untouched.
    Blocked { reason: String },
    /// The merge lock could not be acquired in time.
    TargetBusy,
    /// Cancellation was requested before this task started.
    Cancelled,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Merged { .. } | Self::AlreadyMerged { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Merged { .. } => "merged",
            Self::AlreadyMerged { .. } => "already_merged",
            Self::Blocked { .. } => "blocked",
            Self::TargetBusy => "target_busy",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn commit(&self) -> Option<&str> {
        match self {
            Self::Merged { commit } => Some(commit),
            Self::AlreadyMerged { commit } => commit.as_deref(),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Blocked { reason } => Some(reason),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Audit Entry
// ---------------------------------------------------------------------------

/// An audit-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub details: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create a success audit entry.
    pub fn success(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            session_id: None,
            task_id: None,
            details: details.to_string(),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Create a failure audit entry.
    pub fn failure(action: &str, details: &str) -> Self {
        Self {
            success: false,
            ..Self::success(action, details)
        }
    }

    pub fn for_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn for_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_transitions() {
        assert!(SessionState::Collecting.can_transition_to(SessionState::Merging));
        assert!(SessionState::Merging.can_transition_to(SessionState::Completed));
        assert!(!SessionState::Completed.can_transition_to(SessionState::Merging));
        assert!(!SessionState::Collecting.can_transition_to(SessionState::Completed));
    }

    #[test]
    fn test_task_status_round_trip_strings() {
        for status in [TaskStatus::Pending, TaskStatus::Merged, TaskStatus::Blocked] {
            assert_eq!(TaskStatus::from_str_val(&status.to_string()), Some(status));
        }
        assert_eq!(TaskStatus::from_str_val("archived"), None);
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let outcome = TaskOutcome::Blocked {
            reason: "2 unresolved conflicts".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "blocked");
        assert_eq!(json["reason"], "2 unresolved conflicts");
        assert!(!outcome.is_success());
        assert!(TaskOutcome::AlreadyMerged { commit: None }.is_success());
    }

    #[test]
    fn test_timeline_entry_omits_missing_old_path() {
        let entry = FileTimelineEntry {
            commit_sha: "abc".into(),
            timestamp: Utc::now(),
            file_path: "src/lib.rs".into(),
            change_kind: TimelineChangeKind::Modified,
            parent_sha: None,
            old_path: None,
        };
        let line = serde_json::to_string(&entry).unwrap();
        assert!(!line.contains("old_path"));
        assert!(line.contains("\"change_kind\":\"modified\""));
    }
}
