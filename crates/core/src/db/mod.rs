//! SQLite persistence for TaskMerge.
//!
//! One database per data directory holds the task registry, merge sessions
//! with their per-task outcomes, conflict records and the audit log. The
//! post-commit hook, the CLI and a running session may all open the same
//! file, so file databases run in WAL mode with a busy timeout.

pub mod queries;
pub mod schema;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::errors::DatabaseError;

/// Handle to the engine database.
///
/// The connection sits behind a `Mutex` so the handle can be shared through
/// an `Arc` by the registry, the orchestrator and blocking tasks.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database file at `path`, creating missing parent
    /// directories. The schema is not touched until [`initialize`](Self::initialize).
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        info!(path = %path.display(), "database opened");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open and migrate the database under the configured data directory.
    pub fn open(config: &EngineConfig) -> Result<Self, DatabaseError> {
        let db = Self::new(config.engine.db_path())?;
        db.initialize()?;
        Ok(db)
    }

    /// A private in-memory database.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// File backing this database; `None` when in memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Bring the schema up to date.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        let version = schema::run_migrations(&self.conn())?;
        debug!(version, "database schema ready");
        Ok(())
    }

    /// Lock the connection. A poisoned lock is recovered.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskOutcome, WorktreeTask};

    #[test]
    fn test_open_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::for_repo(dir.path().join("repo"), dir.path().join("data"));

        let db = Database::open(&config).unwrap();
        let db_path = config.engine.db_path();
        assert_eq!(db.path(), Some(db_path.as_path()));
        assert!(db_path.exists());

        let mode: String = db
            .conn()
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_reopen_keeps_registered_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("taskmerge.db");
        {
            let db = Database::new(&path).unwrap();
            db.initialize().unwrap();
            db.upsert_task(&WorktreeTask::new("t-1", "task/t-1", "/work/t-1", "abc"))
                .unwrap();
        }

        let db = Database::new(&path).unwrap();
        db.initialize().unwrap();
        let task = db.get_task("t-1").unwrap().unwrap();
        assert_eq!(task.branch_name, "task/t-1");
    }

    #[test]
    fn test_outcome_requires_known_session() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        assert!(db.path().is_none());

        let err = db
            .record_task_outcome("no-such-session", "t-1", 0, &TaskOutcome::Cancelled)
            .unwrap_err();
        assert!(matches!(err, DatabaseError::SqliteError(_)));
    }
}
