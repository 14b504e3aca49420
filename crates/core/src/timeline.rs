//! Append-only per-file commit history of the integration branch.
//!
//! Each commit on the integration branch appends one JSON line per changed
//! file to `<data_dir>/timeline.log`. The log is fed synchronously from the
//! post-commit hook, so [`TimelineTracker::record_commit`] never returns an
//! error and stops writing once its time budget is spent.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::config::TimelineConfig;
use crate::errors::TimelineError;
use crate::git::VersionedRepo;
use crate::models::FileTimelineEntry;

/// Writes and queries the timeline log.
pub struct TimelineTracker {
    path: PathBuf,
    repo: Arc<dyn VersionedRepo>,
    budget: Duration,
    write_lock: Mutex<()>,
}

impl TimelineTracker {
    pub fn new(path: impl Into<PathBuf>, repo: Arc<dyn VersionedRepo>, config: &TimelineConfig) -> Self {
        Self {
            path: path.into(),
            repo,
            budget: Duration::from_millis(config.budget_ms),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry per file changed by `commit_sha`.
    ///
    /// Returns the number of entries written. Errors are logged and
    /// swallowed.
    pub fn record_commit(&self, commit_sha: &str) -> usize {
        let started = Instant::now();
        match self.try_record(commit_sha, started) {
            Ok(written) => {
                debug!(commit = %commit_sha, written, "timeline updated");
                written
            }
            Err(e) => {
                warn!(commit = %commit_sha, error = %e, "failed to record commit in timeline");
                0
            }
        }
    }

    fn try_record(&self, commit_sha: &str, started: Instant) -> Result<usize, TimelineError> {
        let info = self.repo.commit_info(commit_sha)?;
        let changes = self.repo.files_in_commit(&info.sha)?;
        let timestamp = Utc
            .timestamp_opt(info.time, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let parent_sha = info.parents.first().cloned();

        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let mut written = 0;
        for change in changes {
            if started.elapsed() > self.budget {
                warn!(
                    commit = %info.sha,
                    written,
                    budget_ms = self.budget.as_millis() as u64,
                    "timeline budget exceeded, remaining files not recorded"
                );
                break;
            }
            let entry = FileTimelineEntry {
                commit_sha: info.sha.clone(),
                timestamp,
                file_path: change.path,
                change_kind: change.kind,
                parent_sha: parent_sha.clone(),
                old_path: change.old_path,
            };
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
            written += 1;
        }
        file.flush()?;
        Ok(written)
    }

    /// Every readable entry in log order, with duplicates collapsed.
    ///
    /// Corrupt lines are skipped with a warning. A missing log is empty.
    pub fn entries(&self) -> Result<Vec<FileTimelineEntry>, TimelineError> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: FileTimelineEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        line = number + 1,
                        error = %e,
                        "skipping corrupt timeline line"
                    );
                    continue;
                }
            };
            if seen.insert((entry.commit_sha.clone(), entry.file_path.clone())) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Entries for `file_path` strictly after `reference_commit`, in commit
    /// order.
    ///
    /// When the reference commit is not in the log, entries whose commit is
    /// not reachable from the reference are returned instead.
    pub fn query_since(
        &self,
        file_path: &str,
        reference_commit: &str,
    ) -> Result<Vec<FileTimelineEntry>, TimelineError> {
        let entries = self.entries()?;
        let reference = self
            .repo
            .resolve_ref(reference_commit)
            .unwrap_or_else(|_| reference_commit.to_string());
        let touches = |e: &FileTimelineEntry| {
            e.file_path == file_path || e.old_path.as_deref() == Some(file_path)
        };

        if let Some(position) = entries.iter().rposition(|e| e.commit_sha == reference) {
            return Ok(entries
                .into_iter()
                .skip(position + 1)
                .filter(|e| touches(e))
                .collect());
        }

        info!(
            reference = %reference,
            "reference commit not in timeline, falling back to ancestry"
        );
        let mut after = Vec::new();
        for entry in entries.into_iter().filter(|e| touches(e)) {
            if !self.repo.is_ancestor(&entry.commit_sha, &reference)? {
                after.push(entry);
            }
        }
        Ok(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::errors::GitError;
    use crate::git::{CommitInfo, CommitRequest, PathChange};
    use crate::models::TimelineChangeKind;

    /// A linear history where commit `cN` changes the listed paths.
    struct LinearRepo {
        commits: Vec<(String, Vec<String>)>,
        slow: Duration,
    }

    impl LinearRepo {
        fn new(commits: &[(&str, &[&str])]) -> Self {
            Self {
                commits: commits
                    .iter()
                    .map(|(sha, paths)| (sha.to_string(), paths.iter().map(|p| p.to_string()).collect()))
                    .collect(),
                slow: Duration::ZERO,
            }
        }

        fn position(&self, sha: &str) -> Result<usize, GitError> {
            self.commits
                .iter()
                .position(|(s, _)| s == sha)
                .ok_or_else(|| GitError::RefNotFound(sha.to_string()))
        }
    }

    impl VersionedRepo for LinearRepo {
        fn resolve_ref(&self, name: &str) -> Result<String, GitError> {
            self.position(name).map(|_| name.to_string())
        }
        fn merge_base(&self, _a: &str, _b: &str) -> Result<Option<String>, GitError> {
            Ok(None)
        }
        fn changed_paths(&self, _from: &str, _to: &str) -> Result<Vec<PathChange>, GitError> {
            Ok(Vec::new())
        }
        fn files_in_commit(&self, sha: &str) -> Result<Vec<PathChange>, GitError> {
            std::thread::sleep(self.slow);
            let idx = self.position(sha)?;
            Ok(self.commits[idx]
                .1
                .iter()
                .map(|p| PathChange {
                    path: p.clone(),
                    old_path: None,
                    kind: TimelineChangeKind::Modified,
                })
                .collect())
        }
        fn show_file(&self, _rev: &str, _path: &str) -> Result<Option<Vec<u8>>, GitError> {
            Ok(None)
        }
        fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
            Ok(self.position(ancestor)? <= self.position(descendant)?)
        }
        fn commit_info(&self, sha: &str) -> Result<CommitInfo, GitError> {
            let idx = self.position(sha)?;
            Ok(CommitInfo {
                sha: sha.to_string(),
                parents: idx.checked_sub(1).map(|p| self.commits[p].0.clone()).into_iter().collect(),
                summary: String::new(),
                time: 1_700_000_000 + idx as i64,
            })
        }
        fn commit_files(&self, _request: &CommitRequest) -> Result<String, GitError> {
            Err(GitError::RefNotFound("read-only".into()))
        }
    }

    fn tracker(dir: &Path, repo: LinearRepo, budget_ms: u64) -> TimelineTracker {
        TimelineTracker::new(
            dir.join("timeline.log"),
            Arc::new(repo),
            &TimelineConfig { budget_ms },
        )
    }

    fn shas(entries: &[FileTimelineEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.commit_sha.as_str()).collect()
    }

    #[test]
    fn test_query_since_returns_later_commits_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LinearRepo::new(&[
            ("c1", &["src/lib.rs"]),
            ("c2", &["src/lib.rs", "README.md"]),
            ("c3", &["README.md"]),
            ("c4", &["src/lib.rs"]),
        ]);
        let tracker = tracker(dir.path(), repo, 1_000);
        for sha in ["c1", "c2", "c3", "c4"] {
            tracker.record_commit(sha);
        }

        let since = tracker.query_since("src/lib.rs", "c1").unwrap();
        assert_eq!(shas(&since), vec!["c2", "c4"]);
        assert_eq!(since[0].parent_sha.as_deref(), Some("c1"));
        assert!(tracker.query_since("src/lib.rs", "c4").unwrap().is_empty());
    }

    #[test]
    fn test_duplicates_and_corrupt_lines_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LinearRepo::new(&[("c1", &["a.rs"]), ("c2", &["a.rs"])]);
        let tracker = tracker(dir.path(), repo, 1_000);
        tracker.record_commit("c1");
        tracker.record_commit("c1");
        let mut file = OpenOptions::new().append(true).open(tracker.path()).unwrap();
        file.write_all(b"{not json\n").unwrap();
        tracker.record_commit("c2");

        let entries = tracker.entries().unwrap();
        assert_eq!(shas(&entries), vec!["c1", "c2"]);
    }

    #[test]
    fn test_unknown_reference_uses_ancestry() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LinearRepo::new(&[("c0", &[]), ("c1", &["a.rs"]), ("c2", &["a.rs"])]);
        let tracker = tracker(dir.path(), repo, 1_000);
        tracker.record_commit("c1");
        tracker.record_commit("c2");

        // c0 predates tracking.
        let since = tracker.query_since("a.rs", "c0").unwrap();
        assert_eq!(shas(&since), vec!["c1", "c2"]);
    }

    #[test]
    fn test_record_commit_never_fails() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), LinearRepo::new(&[]), 1_000);
        assert_eq!(tracker.record_commit("missing"), 0);
        assert!(tracker.entries().unwrap().is_empty());
    }

    #[test]
    fn test_budget_stops_writing() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = LinearRepo::new(&[("c1", &["a.rs", "b.rs"])]);
        repo.slow = Duration::from_millis(20);
        let tracker = tracker(dir.path(), repo, 5);
        assert_eq!(tracker.record_commit("c1"), 0);
        assert!(tracker.entries().unwrap().is_empty());
    }
}
