//! Per-session merge report.
//!
//! Written as pretty-printed JSON to `<data_dir>/reports/<session_id>.json`
//! when a session completes.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::conflict::{ConflictKind, ConflictRecord, ResolutionStatus, ResolutionStrategy};
use crate::errors::MergeError;
use crate::models::{SessionState, TaskOutcome};

/// Outcome of one task in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub outcome: String,
    pub commit: Option<String>,
    pub reason: Option<String>,
}

impl TaskReport {
    pub fn new(task_id: &str, outcome: &TaskOutcome) -> Self {
        Self {
            task_id: task_id.to_string(),
            outcome: outcome.label().to_string(),
            commit: outcome.commit().map(str::to_string),
            reason: outcome.reason().map(str::to_string),
        }
    }
}

/// One conflict in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub file: String,
    pub task_id: String,
    pub kind: ConflictKind,
    pub confidence: f64,
    pub resolution_status: ResolutionStatus,
    pub strategy: Option<ResolutionStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&ConflictRecord> for ConflictReport {
    fn from(record: &ConflictRecord) -> Self {
        Self {
            file: record.file_path().to_string(),
            task_id: record.task_id.clone(),
            kind: record.kind(),
            confidence: record.confidence,
            resolution_status: record.resolution_status(),
            strategy: record.resolution_strategy,
            detail: record.detail.clone(),
        }
    }
}

/// Everything that happened in one orchestration session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub session_id: String,
    pub target_branch: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskReport>,
    pub conflicts: Vec<ConflictReport>,
}

impl MergeReport {
    pub fn new(session_id: &str, target_branch: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            target_branch: target_branch.to_string(),
            state: SessionState::Collecting,
            started_at,
            completed_at: None,
            tasks: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    /// The report entry for `task_id`, if the task was part of the session.
    pub fn task(&self, task_id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// Number of tasks with the given outcome label.
    pub fn count_outcome(&self, label: &str) -> usize {
        self.tasks.iter().filter(|t| t.outcome == label).count()
    }

    pub fn unresolved_conflicts(&self) -> usize {
        self.conflicts
            .iter()
            .filter(|c| c.resolution_status == ResolutionStatus::Unresolved)
            .count()
    }

    /// Path of the report for `session_id` under `reports_dir`.
    pub fn path_in(reports_dir: &Path, session_id: &str) -> PathBuf {
        reports_dir.join(format!("{session_id}.json"))
    }

    /// Write the report into `reports_dir`, returning the file path.
    pub fn write(&self, reports_dir: &Path) -> Result<PathBuf, MergeError> {
        fs::create_dir_all(reports_dir).map_err(|e| {
            MergeError::Report(format!("creating {}: {e}", reports_dir.display()))
        })?;
        let path = Self::path_in(reports_dir, &self.session_id);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MergeError::Report(e.to_string()))?;
        fs::write(&path, json)
            .map_err(|e| MergeError::Report(format!("writing {}: {e}", path.display())))?;
        info!(path = %path.display(), session_id = %self.session_id, "merge report written");
        Ok(path)
    }

    /// Read a previously written report.
    pub fn load(path: &Path) -> Result<Self, MergeError> {
        let json = fs::read_to_string(path)
            .map_err(|e| MergeError::Report(format!("reading {}: {e}", path.display())))?;
        serde_json::from_str(&json)
            .map_err(|e| MergeError::Report(format!("parsing {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_shape() {
        let mut report = MergeReport::new("s-1", "main", Utc::now());
        report.state = SessionState::Completed;
        report.tasks.push(TaskReport::new(
            "a",
            &TaskOutcome::Merged {
                commit: "abc".into(),
            },
        ));
        report.tasks.push(TaskReport::new(
            "b",
            &TaskOutcome::Blocked {
                reason: "1 unresolved conflict".into(),
            },
        ));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "completed");
        assert_eq!(json["tasks"][0]["outcome"], "merged");
        assert_eq!(json["tasks"][0]["commit"], "abc");
        assert_eq!(json["tasks"][1]["reason"], "1 unresolved conflict");
        assert!(json["conflicts"].as_array().unwrap().is_empty());
        assert_eq!(report.count_outcome("blocked"), 1);
        assert_eq!(report.task("a").unwrap().commit.as_deref(), Some("abc"));
    }

    #[test]
    fn test_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let reports = dir.path().join("reports");
        let mut record = ConflictRecord::new(
            "s-2",
            "a",
            "assets/logo.png",
            ConflictKind::Structural,
            0.2,
            Vec::new(),
        );
        record.give_up("binary file changed on both sides").unwrap();

        let mut report = MergeReport::new("s-2", "main", Utc::now());
        report.conflicts.push(ConflictReport::from(&record));
        let path = report.write(&reports).unwrap();
        assert_eq!(path, reports.join("s-2.json"));

        let loaded = MergeReport::load(&path).unwrap();
        assert_eq!(loaded, report);
        assert_eq!(loaded.unresolved_conflicts(), 1);
        assert!(MergeReport::load(&reports.join("missing.json")).is_err());
    }
}
