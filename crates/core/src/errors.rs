//! Error types for the TaskMerge core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Timeline(#[from] TimelineError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from versioned-repository operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, tag, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// The target branch moved while a merge commit was being written.
    #[error("branch '{branch}' moved during update (expected {expected})")]
    RefMoved { branch: String, expected: String },

    /// An operation did not complete within its time allowance.
    #[error("git operation '{0}' timed out")]
    Timeout(String),

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GitError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Lock contention, timeouts and I/O hiccups are transient; missing
    /// branches and invalid references are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RefMoved { .. } | Self::IoError(_) => true,
            Self::Git2Error(e) => matches!(
                e.code(),
                git2::ErrorCode::Locked | git2::ErrorCode::Modified
            ),
            Self::RepositoryNotFound(_) | Self::RefNotFound(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Merge orchestration errors
// ---------------------------------------------------------------------------

/// Errors from the merge orchestrator.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Another orchestration session is already running in this process.
    #[error("merge session already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// The requested task is not in the registry.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// A session state transition was invalid.
    #[error("invalid session state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Writing the merge report failed.
    #[error("failed to write merge report: {0}")]
    Report(String),

    /// Underlying repository error.
    #[error("merge git error: {0}")]
    GitError(#[from] GitError),

    /// Conflict bookkeeping failed.
    #[error("merge conflict error: {0}")]
    Conflict(#[from] ConflictError),

    /// Database error while recording session state.
    #[error("merge database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from conflict bookkeeping.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The requested conflict ID was not found.
    #[error("conflict not found: {0}")]
    NotFound(String),

    /// Attempted to change the status of a conflict that is no longer pending.
    #[error("conflict {0} is already settled")]
    AlreadySettled(String),

    /// Three-way merge failed.
    #[error("three-way merge failed: {0}")]
    MergeFailed(String),

    /// Database error when persisting conflict data.
    #[error("conflict database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Resolution agent errors
// ---------------------------------------------------------------------------

/// Failure modes of the external resolution agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent did not answer within the per-attempt timeout.
    #[error("resolution agent timed out after {0} ms")]
    Timeout(u64),

    /// The agent reported an error or exited unsuccessfully.
    #[error("resolution agent failed: {0}")]
    Failed(String),

    /// The agent answered with something that is not a candidate file.
    #[error("resolution agent returned malformed output: {0}")]
    Malformed(String),

    /// Spawning or talking to the agent process failed.
    #[error("resolution agent I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AgentError {
    /// Malformed output is deterministic; everything else may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Malformed(_))
    }
}

// ---------------------------------------------------------------------------
// Timeline errors
// ---------------------------------------------------------------------------

/// Errors from the file timeline log.
#[derive(Debug, Error)]
pub enum TimelineError {
    /// Reading or appending the log failed.
    #[error("timeline I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// An entry could not be serialized.
    #[error("timeline serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The repository could not describe the commit.
    #[error("timeline git error: {0}")]
    GitError(#[from] GitError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored column could not be decoded.
    #[error("corrupt {entity} row: {detail}")]
    Corrupt { entity: String, detail: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = GitError::RepositoryNotFound("/tmp/repo".into());
        assert_eq!(err.to_string(), "git repository not found at '/tmp/repo'");

        let err = MergeError::TaskNotFound("t-9".into());
        assert_eq!(err.to_string(), "task not found: t-9");

        let err = AgentError::Timeout(1500);
        assert!(err.to_string().contains("1500"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(GitError::Timeout("merge_base".into()).is_transient());
        assert!(GitError::RefMoved {
            branch: "main".into(),
            expected: "abc".into()
        }
        .is_transient());
        assert!(!GitError::RefNotFound("feature/x".into()).is_transient());
        assert!(!GitError::RepositoryNotFound("/nope".into()).is_transient());

        let locked = git2::Error::new(
            git2::ErrorCode::Locked,
            git2::ErrorClass::Index,
            "index.lock exists",
        );
        assert!(GitError::Git2Error(locked).is_transient());
    }

    #[test]
    fn test_agent_retryable() {
        assert!(AgentError::Timeout(10).is_retryable());
        assert!(AgentError::Failed("boom".into()).is_retryable());
        assert!(!AgentError::Malformed("empty".into()).is_retryable());
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let db_err = DatabaseError::NotFound {
            entity: "task".into(),
            id: "t-1".into(),
        };
        let core_err: CoreError = db_err.into();
        assert!(matches!(core_err, CoreError::Database(_)));

        let core_err: CoreError = GitError::RefNotFound("x".into()).into();
        assert!(matches!(core_err, CoreError::Git(_)));
    }
}
