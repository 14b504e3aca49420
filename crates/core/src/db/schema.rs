//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `schema_version`
//! user-version pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS worktree_tasks (
            task_id        TEXT PRIMARY KEY,
            branch_name    TEXT    NOT NULL,
            worktree_path  TEXT    NOT NULL,
            base_commit    TEXT    NOT NULL,
            status         TEXT    NOT NULL DEFAULT 'pending'
                           CHECK (status IN ('pending', 'merged', 'blocked')),
            phase          INTEGER NOT NULL DEFAULT 0,
            depends_on     TEXT    NOT NULL DEFAULT '[]',
            completed_at   TEXT    NOT NULL,
            merge_commit   TEXT,
            registered_at  TEXT    NOT NULL,
            updated_at     TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_worktree_tasks_status ON worktree_tasks (status);

        CREATE TABLE IF NOT EXISTS merge_sessions (
            id             TEXT PRIMARY KEY,
            target_branch  TEXT NOT NULL,
            state          TEXT NOT NULL
                           CHECK (state IN ('collecting', 'merging', 'completed')),
            task_ids       TEXT NOT NULL DEFAULT '[]',
            started_at     TEXT NOT NULL,
            completed_at   TEXT,
            report_path    TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_merge_sessions_started_at ON merge_sessions (started_at);

        CREATE TABLE IF NOT EXISTS session_tasks (
            session_id  TEXT    NOT NULL REFERENCES merge_sessions (id),
            task_id     TEXT    NOT NULL,
            position    INTEGER NOT NULL,
            outcome     TEXT    NOT NULL,
            commit_sha  TEXT,
            reason      TEXT,
            decided_at  TEXT    NOT NULL,
            PRIMARY KEY (session_id, task_id)
        );

        CREATE TABLE IF NOT EXISTS conflicts (
            id                   TEXT PRIMARY KEY,
            session_id           TEXT NOT NULL,
            task_id              TEXT NOT NULL,
            file_path            TEXT NOT NULL,
            kind                 TEXT NOT NULL,
            regions              TEXT NOT NULL DEFAULT '[]',
            confidence           REAL NOT NULL,
            resolution_status    TEXT NOT NULL DEFAULT 'pending',
            resolution_strategy  TEXT,
            result_hash          TEXT,
            detail               TEXT,
            created_at           TEXT NOT NULL,
            resolved_at          TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_conflicts_session ON conflicts (session_id);
        CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflicts (resolution_status);

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT    NOT NULL,
            session_id  TEXT,
            task_id     TEXT,
            details     TEXT,
            success     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log (created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log (action);
        "#,
    ),
    (
        2,
        "settled conflicts are immutable",
        r#"
        CREATE TRIGGER IF NOT EXISTS conflicts_immutable_identity
        BEFORE UPDATE OF file_path, kind ON conflicts
        BEGIN
            SELECT RAISE(ABORT, 'conflict file_path and kind are immutable');
        END;
        "#,
    ),
];

/// Apply all pending migrations, returning the resulting schema version.
pub fn run_migrations(conn: &Connection) -> Result<u32, DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    let mut schema_version = current_version;
    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            schema_version = version;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(schema_version)
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        for table in [
            "worktree_tasks",
            "merge_sessions",
            "session_tasks",
            "conflicts",
            "audit_log",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_conflict_identity_cannot_change() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO conflicts (id, session_id, task_id, file_path, kind, confidence, created_at)
             VALUES ('c1', 's1', 't1', 'src/lib.rs', 'semantic', 0.7, '2025-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let err = conn.execute("UPDATE conflicts SET kind = 'structural' WHERE id = 'c1'", []);
        assert!(err.is_err());
        conn.execute(
            "UPDATE conflicts SET resolution_status = 'unresolved' WHERE id = 'c1'",
            [],
        )
        .unwrap();
    }
}
