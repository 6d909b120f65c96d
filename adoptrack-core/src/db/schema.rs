//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: append-only log plus keyed aggregates
    r#"
    -- ============================================
    -- LOG (append-only; buckets are rebuilt from these)
    -- ============================================

    CREATE TABLE IF NOT EXISTS snapshots (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        pairing_token    TEXT NOT NULL,
        session_id       TEXT NOT NULL,
        file_path        TEXT NOT NULL,
        phase            TEXT NOT NULL CHECK (phase IN ('before', 'after')),
        content          TEXT NOT NULL,
        content_hash     TEXT NOT NULL,      -- hex sha256 of content
        status           TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'abandoned')),
        recorded_at      DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_snapshots_key ON snapshots(session_id, file_path, status);
    CREATE INDEX IF NOT EXISTS idx_snapshots_status ON snapshots(status);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshots_token_phase ON snapshots(pairing_token, phase);
    -- One open pairing slot per (session, file)
    CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshots_one_pending
        ON snapshots(session_id, file_path) WHERE status = 'pending';

    CREATE TABLE IF NOT EXISTS edit_events (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        pairing_token      TEXT NOT NULL UNIQUE,
        session_id         TEXT NOT NULL,
        file_path          TEXT NOT NULL,
        project_id         TEXT NOT NULL,
        before_snapshot_id INTEGER NOT NULL UNIQUE REFERENCES snapshots(id),
        after_snapshot_id  INTEGER NOT NULL UNIQUE REFERENCES snapshots(id),
        session_info       TEXT,
        paired_at          DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_edit_events_file ON edit_events(file_path);
    CREATE INDEX IF NOT EXISTS idx_edit_events_session ON edit_events(session_id);

    CREATE TABLE IF NOT EXISTS adoption_metrics (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id           INTEGER NOT NULL UNIQUE REFERENCES edit_events(id),
        session_id         TEXT NOT NULL,
        file_path          TEXT NOT NULL,
        project_id         TEXT NOT NULL,
        generated_lines    INTEGER NOT NULL,
        adopted_lines      INTEGER NOT NULL,
        removed_lines      INTEGER NOT NULL,
        total_before_lines INTEGER NOT NULL,
        total_after_lines  INTEGER NOT NULL,
        estimated          INTEGER NOT NULL DEFAULT 0,
        computed_at        DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_metrics_file ON adoption_metrics(file_path, id);

    CREATE TABLE IF NOT EXISTS diff_lines (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        metric_id        INTEGER NOT NULL REFERENCES adoption_metrics(id),
        line_number      INTEGER NOT NULL,   -- 1-based, in the after snapshot
        kind             TEXT NOT NULL CHECK (kind IN ('added', 'modified')),
        content          TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_diff_lines_metric ON diff_lines(metric_id, line_number);

    CREATE TABLE IF NOT EXISTS adoption_corrections (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        metric_id         INTEGER NOT NULL UNIQUE REFERENCES adoption_metrics(id),
        observed_event_id INTEGER NOT NULL REFERENCES edit_events(id),
        retained_lines    INTEGER NOT NULL,
        adopted_delta     INTEGER NOT NULL,
        applied_at        DATETIME NOT NULL
    );

    -- ============================================
    -- DERIVED (regenerable from the log)
    -- ============================================

    CREATE TABLE IF NOT EXISTS aggregate_buckets (
        dimension             TEXT NOT NULL CHECK (dimension IN ('file', 'session', 'project')),
        key                   TEXT NOT NULL,
        generated_total       INTEGER NOT NULL DEFAULT 0,
        adopted_total         INTEGER NOT NULL DEFAULT 0,
        event_count           INTEGER NOT NULL DEFAULT 0,
        estimated_event_count INTEGER NOT NULL DEFAULT 0,
        last_updated          DATETIME,

        PRIMARY KEY (dimension, key)
    );
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = [
            "snapshots",
            "edit_events",
            "adoption_metrics",
            "diff_lines",
            "adoption_corrections",
            "aggregate_buckets",
        ];

        for table in tables {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_single_pending_slot_per_key() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let insert = "INSERT INTO snapshots (pairing_token, session_id, file_path, phase, content, content_hash, status, recorded_at)
                      VALUES (?1, 's1', '/f', 'before', '', '', 'pending', '2026-01-01T00:00:00Z')";
        conn.execute(insert, ["t1"]).unwrap();
        assert!(conn.execute(insert, ["t2"]).is_err());
    }
}
