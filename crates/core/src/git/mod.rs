//! Versioned-repository operations.
//!
//! The engine treats the repository as a black box behind
//! [`VersionedRepo`]: it asks for refs, diffs, file contents and ancestry,
//! and hands back a finished set of file writes to commit. The production
//! implementation is [`GitClient`], backed by `git2`.

pub mod client;

use serde::{Deserialize, Serialize};

use crate::errors::GitError;
use crate::models::TimelineChangeKind;

pub use client::GitClient;

/// A path changed between two commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathChange {
    pub path: String,
    /// Previous path for renames.
    pub old_path: Option<String>,
    pub kind: TimelineChangeKind,
}

/// Metadata about a single commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub parents: Vec<String>,
    pub summary: String,
    /// Commit time, seconds since the epoch.
    pub time: i64,
}

/// Where the new entry for a path comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteSource {
    /// New blob content. The path keeps its mode from the first parent, or
    /// becomes a regular file.
    Content(Vec<u8>),
    /// The path's entry at another commit, mode and object unchanged. This
    /// carries executables, symlinks and submodules across verbatim; a path
    /// absent there is removed.
    EntryAt(String),
    Delete,
}

/// One path to change in a new commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWrite {
    pub path: String,
    pub source: WriteSource,
}

impl FileWrite {
    pub fn content(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            source: WriteSource::Content(content.into()),
        }
    }

    pub fn entry_at(path: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: WriteSource::EntryAt(rev.into()),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: WriteSource::Delete,
        }
    }
}

/// Everything needed to write a merge commit onto a branch.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub branch: String,
    /// The branch must still point here when the ref is updated; `None`
    /// creates the branch.
    pub expected_tip: Option<String>,
    /// Parents in order; the first parent supplies the starting tree. Empty
    /// for a root commit.
    pub parents: Vec<String>,
    pub files: Vec<FileWrite>,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
}

/// The repository capabilities the merge engine depends on.
pub trait VersionedRepo: Send + Sync {
    /// Resolve a branch name, ref or SHA to a commit SHA.
    fn resolve_ref(&self, name: &str) -> Result<String, GitError>;

    /// Best common ancestor of two commits.
    fn merge_base(&self, a: &str, b: &str) -> Result<Option<String>, GitError>;

    /// Paths that differ between two commits.
    fn changed_paths(&self, from: &str, to: &str) -> Result<Vec<PathChange>, GitError>;

    /// Paths a commit changed relative to its first parent.
    fn files_in_commit(&self, sha: &str) -> Result<Vec<PathChange>, GitError>;

    /// Raw file content at a commit, or `None` when the path is absent or
    /// is not a blob (a directory or a submodule).
    fn show_file(&self, rev: &str, path: &str) -> Result<Option<Vec<u8>>, GitError>;

    /// Whether `ancestor` is reachable from (or equal to) `descendant`.
    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError>;

    /// Parents, summary and time of a commit.
    fn commit_info(&self, sha: &str) -> Result<CommitInfo, GitError>;

    /// Write a commit and advance `request.branch` to it.
    fn commit_files(&self, request: &CommitRequest) -> Result<String, GitError>;
}
