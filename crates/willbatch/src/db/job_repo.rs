//! Job repository: SQL operations for the `jobs` table and its
//! append-only child tables (`job_records`, `job_errors`, `job_activity`).
//!
//! Functions take a `&Connection` so callers can compose several of them
//! inside one transaction.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub seq: i64,
    pub id: String,
    pub job_type: String,
    pub firm_id: String,
    pub user_id: String,
    pub file_name: String,
    pub total_records: i64,
    pub processed_records: i64,
    pub successful_records: i64,
    pub failed_records: i64,
    pub batch_size: i64,
    pub current_batch: i64,
    pub total_batches: i64,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub estimated_completion: Option<String>,
    pub duration_ms: Option<i64>,
    pub failure: Option<String>,
    pub retry_of: Option<String>,
    pub cancel_requested: bool,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            seq: row.get("seq")?,
            id: row.get("id")?,
            job_type: row.get("job_type")?,
            firm_id: row.get("firm_id")?,
            user_id: row.get("user_id")?,
            file_name: row.get("file_name")?,
            total_records: row.get("total_records")?,
            processed_records: row.get("processed_records")?,
            successful_records: row.get("successful_records")?,
            failed_records: row.get("failed_records")?,
            batch_size: row.get("batch_size")?,
            current_batch: row.get("current_batch")?,
            total_batches: row.get("total_batches")?,
            status: row.get("status")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            estimated_completion: row.get("estimated_completion")?,
            duration_ms: row.get("duration_ms")?,
            failure: row.get("failure")?,
            retry_of: row.get("retry_of")?,
            cancel_requested: row.get("cancel_requested")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// A raw error row.
#[derive(Debug, Clone)]
pub struct ErrorRow {
    pub row_number: i64,
    pub reason: String,
    pub data: String,
}

/// A raw source record. `source_row` is the row in the upload the record
/// first arrived in; it differs from `position` only for retries.
#[derive(Debug, Clone)]
pub struct RecordRow {
    pub position: i64,
    pub source_row: i64,
    pub data: String,
}

/// A raw activity row.
#[derive(Debug, Clone)]
pub struct ActivityRow {
    pub timestamp: String,
    pub message: String,
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    /// Matches any of the given statuses; empty means all.
    pub statuses: Vec<String>,
    pub firm_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Newest first instead of insertion order.
    pub newest_first: bool,
}

/// Returns the next job sequence number.
pub fn next_seq(conn: &Connection) -> Result<i64, DatabaseError> {
    let seq: i64 = conn.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM jobs", [], |r| {
        r.get(0)
    })?;
    Ok(seq)
}

/// Inserts a new job row.
pub fn insert(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (seq, id, job_type, firm_id, user_id, file_name, total_records,
         processed_records, successful_records, failed_records, batch_size, current_batch,
         total_batches, status, started_at, completed_at, estimated_completion, duration_ms,
         failure, retry_of, cancel_requested, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
         ?18, ?19, ?20, ?21, ?22)",
        params![
            job.seq,
            job.id,
            job.job_type,
            job.firm_id,
            job.user_id,
            job.file_name,
            job.total_records,
            job.processed_records,
            job.successful_records,
            job.failed_records,
            job.batch_size,
            job.current_batch,
            job.total_batches,
            job.status,
            job.started_at,
            job.completed_at,
            job.estimated_completion,
            job.duration_ms,
            job.failure,
            job.retry_of,
            job.cancel_requested,
            job.updated_at,
        ],
    )?;
    Ok(())
}

/// Overwrites the progress columns of an existing job.
pub fn update_progress(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET processed_records=?2, successful_records=?3, failed_records=?4,
         current_batch=?5, estimated_completion=?6, updated_at=?7
         WHERE id=?1",
        params![
            job.id,
            job.processed_records,
            job.successful_records,
            job.failed_records,
            job.current_batch,
            job.estimated_completion,
            job.updated_at,
        ],
    )?;
    Ok(())
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
        .optional()?;
    Ok(row)
}

/// Lists jobs matching the filter, in insertion order unless `newest_first`.
pub fn query(conn: &Connection, filter: &JobFilter) -> Result<Vec<JobRow>, DatabaseError> {
    let mut conditions = Vec::new();
    let mut values: Vec<String> = Vec::new();

    if !filter.statuses.is_empty() {
        let placeholders: Vec<String> = filter
            .statuses
            .iter()
            .map(|s| {
                values.push(s.clone());
                format!("?{}", values.len())
            })
            .collect();
        conditions.push(format!("status IN ({})", placeholders.join(", ")));
    }
    if let Some(ref firm_id) = filter.firm_id {
        values.push(firm_id.clone());
        conditions.push(format!("firm_id = ?{}", values.len()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    let order = if filter.newest_first { "DESC" } else { "ASC" };
    // LIMIT -1 is SQLite for "no limit".
    let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
    let offset = filter.offset.unwrap_or(0) as i64;

    let sql = format!(
        "SELECT * FROM jobs {} ORDER BY seq {} LIMIT {} OFFSET {}",
        where_clause, order, limit, offset
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Counts jobs whose status is any of `statuses`.
pub fn count_by_statuses(conn: &Connection, statuses: &[&str]) -> Result<u64, DatabaseError> {
    if statuses.is_empty() {
        return Ok(0);
    }
    let placeholders: Vec<String> = (1..=statuses.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT COUNT(*) FROM jobs WHERE status IN ({})",
        placeholders.join(", ")
    );
    let count: u64 = conn.query_row(&sql, params_from_iter(statuses.iter()), |r| r.get(0))?;
    Ok(count)
}

/// Moves a job to `to` only if its current status is one of `from`.
/// Returns the number of rows changed (0 or 1).
pub fn compare_and_set_status(
    conn: &Connection,
    id: &str,
    from: &[&str],
    to: &str,
    updated_at: &str,
) -> Result<usize, DatabaseError> {
    let placeholders: Vec<String> = (0..from.len()).map(|i| format!("?{}", i + 4)).collect();
    let sql = format!(
        "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status IN ({})",
        placeholders.join(", ")
    );
    let mut values: Vec<&str> = vec![id, to, updated_at];
    values.extend_from_slice(from);
    let changed = conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(changed)
}

/// Writes the terminal status and completion timing, once, provided the
/// current status is one of `from`. Returns 0 when nothing matched.
pub fn finalize(
    conn: &Connection,
    id: &str,
    from: &[&str],
    status: &str,
    completed_at: &str,
    duration_ms: i64,
    failure: Option<&str>,
) -> Result<usize, DatabaseError> {
    let placeholders: Vec<String> = (0..from.len()).map(|i| format!("?{}", i + 6)).collect();
    let sql = format!(
        "UPDATE jobs SET status = ?2, completed_at = ?3, duration_ms = ?4, failure = ?5,
         estimated_completion = NULL, cancel_requested = 0, updated_at = ?3
         WHERE id = ?1 AND completed_at IS NULL AND status IN ({})",
        placeholders.join(", ")
    );
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
        Box::new(id.to_string()),
        Box::new(status.to_string()),
        Box::new(completed_at.to_string()),
        Box::new(duration_ms),
        Box::new(failure.map(|f| f.to_string())),
    ];
    for s in from {
        param_values.push(Box::new(s.to_string()));
    }
    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let changed = conn.execute(&sql, params_ref.as_slice())?;
    Ok(changed)
}

/// Flags a pending cancellation on a processing job.
pub fn set_cancel_requested(
    conn: &Connection,
    id: &str,
    updated_at: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET cancel_requested = 1, updated_at = ?2
         WHERE id = ?1 AND status = 'processing'",
        params![id, updated_at],
    )?;
    Ok(changed)
}

/// Stores the job's source records, positions starting at 1.
pub fn insert_records(
    conn: &Connection,
    job_id: &str,
    records: &[(i64, String)],
) -> Result<(), DatabaseError> {
    let mut stmt = conn.prepare(
        "INSERT INTO job_records (job_id, position, source_row, data) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (i, (source_row, data)) in records.iter().enumerate() {
        stmt.execute(params![job_id, (i + 1) as i64, source_row, data])?;
    }
    Ok(())
}

/// Reads `limit` records starting after `offset`, in position order.
pub fn load_records(
    conn: &Connection,
    job_id: &str,
    offset: u64,
    limit: u64,
) -> Result<Vec<RecordRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT position, COALESCE(source_row, position), data FROM job_records
         WHERE job_id = ?1 AND position > ?2 AND position <= ?3 ORDER BY position",
    )?;
    let rows = stmt
        .query_map(
            params![job_id, offset as i64, (offset + limit) as i64],
            |r| {
                Ok(RecordRow {
                    position: r.get(0)?,
                    source_row: r.get(1)?,
                    data: r.get(2)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Raw JSON of every record a committed batch accepted, across all jobs
/// of `job_type`, oldest job first.
pub fn accepted_records(conn: &Connection, job_type: &str) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT r.data FROM job_records r JOIN jobs j ON j.id = r.job_id
         WHERE j.job_type = ?1 AND r.position <= j.processed_records
           AND NOT EXISTS (
               SELECT 1 FROM job_errors e
               WHERE e.job_id = r.job_id
                 AND e.row_number = COALESCE(r.source_row, r.position)
           )
         ORDER BY j.seq, r.position",
    )?;
    let rows = stmt
        .query_map(params![job_type], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}

/// Appends a per-row error.
pub fn append_error(conn: &Connection, job_id: &str, error: &ErrorRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO job_errors (job_id, row_number, reason, data) VALUES (?1, ?2, ?3, ?4)",
        params![job_id, error.row_number, error.reason, error.data],
    )?;
    Ok(())
}

/// Lists a job's errors in emission order.
pub fn list_errors(conn: &Connection, job_id: &str) -> Result<Vec<ErrorRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT row_number, reason, data FROM job_errors WHERE job_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt
        .query_map(params![job_id], |r| {
            Ok(ErrorRow {
                row_number: r.get(0)?,
                reason: r.get(1)?,
                data: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Appends an activity log line.
pub fn append_activity(
    conn: &Connection,
    job_id: &str,
    timestamp: &str,
    message: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO job_activity (job_id, timestamp, message) VALUES (?1, ?2, ?3)",
        params![job_id, timestamp, message],
    )?;
    Ok(())
}

/// Lists a job's activity log in emission order.
pub fn list_activity(conn: &Connection, job_id: &str) -> Result<Vec<ActivityRow>, DatabaseError> {
    let mut stmt = conn
        .prepare("SELECT timestamp, message FROM job_activity WHERE job_id = ?1 ORDER BY seq")?;
    let rows = stmt
        .query_map(params![job_id], |r| {
            Ok(ActivityRow {
                timestamp: r.get(0)?,
                message: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
