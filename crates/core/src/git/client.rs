//! Local Git repository operations via `git2`.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use git2::build::CheckoutBuilder;
use git2::{
    Commit, Delta, DiffFindOptions, ErrorCode, Index, IndexEntry, IndexTime, ObjectType, Oid,
    Repository, Signature,
};
use tracing::{debug, info, instrument, warn};

use super::{CommitInfo, CommitRequest, PathChange, VersionedRepo, WriteSource};
use crate::errors::GitError;
use crate::models::TimelineChangeKind;

/// Regular, non-executable file mode.
const DEFAULT_FILE_MODE: u32 = 0o100644;
const GITLINK_MODE: u32 = 0o160000;

/// High-level Git client wrapping a `git2::Repository`.
///
/// `git2::Repository` is `Send` but not `Sync`; the mutex makes the client
/// shareable behind an `Arc` across the orchestrator's tasks.
pub struct GitClient {
    repo: Mutex<Repository>,
    repo_path: PathBuf,
}

impl GitClient {
    /// Open an existing Git repository at `repo_path`.
    pub fn new<P: AsRef<Path>>(repo_path: P) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        info!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo: Mutex::new(repo),
            repo_path: path.to_path_buf(),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// The commit at HEAD when HEAD is the checked-out branch `branch`;
    /// `None` on any other branch or a detached HEAD.
    pub fn head_commit_on(&self, branch: &str) -> Result<Option<String>, GitError> {
        let repo = self.repo();
        if !head_targets(&repo, &format!("refs/heads/{branch}")) {
            return Ok(None);
        }
        let id = find_commit(&repo, "HEAD")?.id();
        Ok(Some(id.to_string()))
    }

    fn repo(&self) -> MutexGuard<'_, Repository> {
        self.repo.lock().unwrap_or_else(|poisoned| {
            warn!("git repository mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl VersionedRepo for GitClient {
    fn resolve_ref(&self, name: &str) -> Result<String, GitError> {
        let repo = self.repo();
        let id = find_commit(&repo, name)?.id();
        Ok(id.to_string())
    }

    fn merge_base(&self, a: &str, b: &str) -> Result<Option<String>, GitError> {
        let repo = self.repo();
        let a = find_commit(&repo, a)?.id();
        let b = find_commit(&repo, b)?.id();
        match repo.merge_base(a, b) {
            Ok(oid) => Ok(Some(oid.to_string())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    fn changed_paths(&self, from: &str, to: &str) -> Result<Vec<PathChange>, GitError> {
        let repo = self.repo();
        let old_tree = find_commit(&repo, from)?.tree()?;
        let new_tree = find_commit(&repo, to)?.tree()?;
        let changes = diff_trees(&repo, Some(&old_tree), &new_tree)?;
        debug!(count = changes.len(), "collected changed paths");
        Ok(changes)
    }

    fn files_in_commit(&self, sha: &str) -> Result<Vec<PathChange>, GitError> {
        let repo = self.repo();
        let commit = find_commit(&repo, sha)?;
        let tree = commit.tree()?;
        let parent_tree = if commit.parent_count() > 0 {
            Some(commit.parent(0)?.tree()?)
        } else {
            None
        };
        diff_trees(&repo, parent_tree.as_ref(), &tree)
    }

    fn show_file(&self, rev: &str, path: &str) -> Result<Option<Vec<u8>>, GitError> {
        let repo = self.repo();
        let tree = find_commit(&repo, rev)?.tree()?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if entry.kind() != Some(ObjectType::Blob) {
            return Ok(None);
        }
        let blob = repo.find_blob(entry.id())?;
        Ok(Some(blob.content().to_vec()))
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let repo = self.repo();
        let ancestor = find_commit(&repo, ancestor)?.id();
        let descendant = find_commit(&repo, descendant)?.id();
        if ancestor == descendant {
            return Ok(true);
        }
        Ok(repo.graph_descendant_of(descendant, ancestor)?)
    }

    fn commit_info(&self, sha: &str) -> Result<CommitInfo, GitError> {
        let repo = self.repo();
        let commit = find_commit(&repo, sha)?;
        Ok(CommitInfo {
            sha: commit.id().to_string(),
            parents: commit.parent_ids().map(|p| p.to_string()).collect(),
            summary: commit.summary().unwrap_or("").to_string(),
            time: commit.time().seconds(),
        })
    }

    #[instrument(skip(self, request), fields(branch = %request.branch, files = request.files.len()))]
    fn commit_files(&self, request: &CommitRequest) -> Result<String, GitError> {
        let repo = self.repo();
        let ref_name = format!("refs/heads/{}", request.branch);

        // Fail before touching the object store or a checked-out worktree.
        let expected_oid = match &request.expected_tip {
            Some(expected) => {
                let oid = find_commit(&repo, expected)?.id();
                if repo.refname_to_id(&ref_name).ok() != Some(oid) {
                    return Err(ref_moved(request, expected));
                }
                Some(oid)
            }
            None => None,
        };

        let parents = request
            .parents
            .iter()
            .map(|p| find_commit(&repo, p))
            .collect::<Result<Vec<_>, _>>()?;

        // Start from the first parent's tree and overlay the writes.
        let mut index = Index::new()?;
        if let Some(first) = parents.first() {
            index.read_tree(&first.tree()?)?;
        }
        for write in &request.files {
            let path = Path::new(&write.path);
            match &write.source {
                WriteSource::Content(bytes) => {
                    let mode = index
                        .get_path(path, 0)
                        .map(|e| e.mode)
                        .filter(|&mode| mode != GITLINK_MODE)
                        .unwrap_or(DEFAULT_FILE_MODE);
                    let blob = repo.blob(bytes)?;
                    index.add(&index_entry(&write.path, mode, blob, bytes.len()))?;
                }
                WriteSource::EntryAt(rev) => {
                    let tree = find_commit(&repo, rev)?.tree()?;
                    match tree.get_path(path) {
                        Ok(entry) if entry.kind() != Some(ObjectType::Tree) => {
                            let mode = entry.filemode() as u32;
                            index.add(&index_entry(&write.path, mode, entry.id(), 0))?;
                        }
                        Ok(_) => remove_path(&mut index, path)?,
                        Err(e) if e.code() == ErrorCode::NotFound => {
                            remove_path(&mut index, path)?
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                WriteSource::Delete => remove_path(&mut index, path)?,
            }
        }
        let tree_oid = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_oid)?;

        let signature = Signature::now(&request.author_name, &request.author_email)?;
        let parent_refs: Vec<&Commit> = parents.iter().collect();
        let oid = repo.commit(
            None,
            &signature,
            &signature,
            &request.message,
            &tree,
            &parent_refs,
        )?;

        let log_message = format!("taskmerge: {}", first_line(&request.message));

        // Keep a checked-out target in step; refuses to clobber local edits.
        if !repo.is_bare() && head_targets(&repo, &ref_name) {
            let object = repo.find_object(oid, None)?;
            repo.checkout_tree(&object, Some(CheckoutBuilder::new().safe()))?;
        }

        match (&request.expected_tip, expected_oid) {
            (Some(expected), Some(expected_oid)) => {
                repo.reference_matching(&ref_name, oid, true, expected_oid, &log_message)
                    .map_err(|e| {
                        if e.code() == ErrorCode::Modified {
                            warn!(branch = %request.branch, "branch moved during commit");
                            ref_moved(request, expected)
                        } else {
                            GitError::Git2Error(e)
                        }
                    })?;
            }
            _ => {
                repo.reference(&ref_name, oid, false, &log_message)?;
            }
        }

        info!(sha = %oid, branch = %request.branch, "created commit");
        Ok(oid.to_string())
    }
}

/// Resolve any revision spec to a commit, mapping lookup failures to
/// [`GitError::RefNotFound`].
fn find_commit<'r>(repo: &'r Repository, rev: &str) -> Result<Commit<'r>, GitError> {
    let object = repo.revparse_single(rev).map_err(|e| match e.code() {
        ErrorCode::NotFound | ErrorCode::InvalidSpec | ErrorCode::Ambiguous => {
            GitError::RefNotFound(rev.to_string())
        }
        _ => GitError::Git2Error(e),
    })?;
    object
        .peel_to_commit()
        .map_err(|_| GitError::RefNotFound(rev.to_string()))
}

fn ref_moved(request: &CommitRequest, expected: &str) -> GitError {
    GitError::RefMoved {
        branch: request.branch.clone(),
        expected: expected.to_string(),
    }
}

fn index_entry(path: &str, mode: u32, id: Oid, size: usize) -> IndexEntry {
    IndexEntry {
        ctime: IndexTime::new(0, 0),
        mtime: IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode,
        uid: 0,
        gid: 0,
        file_size: size as u32,
        id,
        flags: 0,
        flags_extended: 0,
        path: path.as_bytes().to_vec(),
    }
}

fn remove_path(index: &mut Index, path: &Path) -> Result<(), GitError> {
    if index.get_path(path, 0).is_some() {
        index.remove_path(path)?;
    }
    Ok(())
}

fn diff_trees(
    repo: &Repository,
    old: Option<&git2::Tree<'_>>,
    new: &git2::Tree<'_>,
) -> Result<Vec<PathChange>, GitError> {
    let mut diff = repo.diff_tree_to_tree(old, Some(new), None)?;
    let mut find = DiffFindOptions::new();
    find.renames(true);
    diff.find_similar(Some(&mut find))?;

    let mut changes = Vec::new();
    for delta in diff.deltas() {
        let new_path = delta.new_file().path().map(path_string);
        let old_path = delta.old_file().path().map(path_string);
        let (kind, path, old) = match delta.status() {
            Delta::Added | Delta::Copied => (TimelineChangeKind::Added, new_path, None),
            Delta::Deleted => (TimelineChangeKind::Deleted, old_path, None),
            Delta::Renamed => (TimelineChangeKind::Renamed, new_path, old_path),
            Delta::Modified | Delta::Typechange => (TimelineChangeKind::Modified, new_path, None),
            _ => continue,
        };
        if let Some(path) = path {
            changes.push(PathChange {
                path,
                old_path: old,
                kind,
            });
        }
    }
    Ok(changes)
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn head_targets(repo: &Repository, ref_name: &str) -> bool {
    repo.find_reference("HEAD")
        .ok()
        .and_then(|head| head.symbolic_target().map(|t| t == ref_name))
        .unwrap_or(false)
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or("")
}
