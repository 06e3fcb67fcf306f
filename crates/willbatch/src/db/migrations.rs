//! Database migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies
//! pending ones in order. `ADD COLUMN` migrations are skipped when the
//! column already exists so the runner stays idempotent.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    kind: MigrationKind,
}

enum MigrationKind {
    /// Execute the SQL directly.
    Standard,
    /// ALTER TABLE ADD COLUMN, skipped if column already exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

const CREATE_JOBS: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    seq                  INTEGER PRIMARY KEY,
    id                   TEXT NOT NULL UNIQUE,
    job_type             TEXT NOT NULL,
    firm_id              TEXT NOT NULL,
    user_id              TEXT NOT NULL,
    file_name            TEXT NOT NULL,
    total_records        INTEGER NOT NULL,
    processed_records    INTEGER NOT NULL DEFAULT 0,
    successful_records   INTEGER NOT NULL DEFAULT 0,
    failed_records       INTEGER NOT NULL DEFAULT 0,
    batch_size           INTEGER NOT NULL,
    current_batch        INTEGER NOT NULL DEFAULT 0,
    total_batches        INTEGER NOT NULL,
    status               TEXT NOT NULL DEFAULT 'queued',
    started_at           TEXT NOT NULL,
    completed_at         TEXT,
    estimated_completion TEXT,
    duration_ms          INTEGER,
    failure              TEXT,
    retry_of             TEXT,
    updated_at           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
";

const CREATE_JOB_RECORDS: &str = "
CREATE TABLE IF NOT EXISTS job_records (
    job_id   TEXT NOT NULL REFERENCES jobs(id),
    position INTEGER NOT NULL,
    data     TEXT NOT NULL,
    PRIMARY KEY (job_id, position)
);
";

const CREATE_JOB_ERRORS: &str = "
CREATE TABLE IF NOT EXISTS job_errors (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id     TEXT NOT NULL REFERENCES jobs(id),
    row_number INTEGER NOT NULL,
    reason     TEXT NOT NULL,
    data       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_errors_job ON job_errors(job_id);
";

const CREATE_JOB_ACTIVITY: &str = "
CREATE TABLE IF NOT EXISTS job_activity (
    seq       INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id    TEXT NOT NULL REFERENCES jobs(id),
    timestamp TEXT NOT NULL,
    message   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_activity_job ON job_activity(job_id);
";

const ADD_CANCEL_REQUESTED: &str =
    "ALTER TABLE jobs ADD COLUMN cancel_requested INTEGER NOT NULL DEFAULT 0;";

const ADD_SOURCE_ROW: &str = "ALTER TABLE job_records ADD COLUMN source_row INTEGER;";

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_jobs_table",
        sql: CREATE_JOBS,
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "create_job_records_table",
        sql: CREATE_JOB_RECORDS,
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 3,
        description: "create_job_errors_table",
        sql: CREATE_JOB_ERRORS,
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 4,
        description: "create_job_activity_table",
        sql: CREATE_JOB_ACTIVITY,
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 5,
        description: "add_cancel_requested_to_jobs",
        sql: ADD_CANCEL_REQUESTED,
        kind: MigrationKind::AddColumn {
            table: "jobs",
            column: "cancel_requested",
        },
    },
    Migration {
        version: 6,
        description: "add_source_row_to_job_records",
        sql: ADD_SOURCE_ROW,
        kind: MigrationKind::AddColumn {
            table: "job_records",
            column: "source_row",
        },
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        let should_run = match &migration.kind {
            MigrationKind::Standard => true,
            MigrationKind::AddColumn { table, column } => !column_exists(conn, table, column)?,
        };

        if should_run {
            conn.execute_batch(migration.sql)
                .map_err(|e| DatabaseError::Migration {
                    version: migration.version,
                    reason: e.to_string(),
                })?;
        } else {
            log::info!(
                "Skipping migration v{} (condition not met)",
                migration.version
            );
        }

        conn.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
    }

    Ok(())
}

/// Checks whether a column exists on a table using `PRAGMA table_info`.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DatabaseError::Migration {
            version: 0,
            reason: format!("Invalid table name: {}", table),
        });
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .any(|r| r.map(|name| name == column).unwrap_or(false));
    Ok(exists)
}
