//! Job store with persistent database storage.
//!
//! Every mutation runs inside one SQLite transaction on the shared
//! connection, so a job's read-merge-write can never interleave with
//! another writer.

use chrono::{DateTime, Utc};

use crate::db::job_repo::{self, ActivityRow, ErrorRow, JobFilter, JobRow};
use crate::db::{Database, DatabaseError};
use crate::error::JobError;
use crate::job::{
    total_batches, ActivityEntry, Job, JobPatch, JobStatus, JobSubmission, JobType, Record,
    RecordError, SourceRecord,
};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn parse_timestamp(s: &str, column: &'static str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Decode {
            column,
            reason: format!("'{}': {}", s, e),
        })
}

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn to_count(value: i64, column: &'static str) -> Result<usize, DatabaseError> {
    usize::try_from(value).map_err(|_| DatabaseError::Decode {
        column,
        reason: format!("negative count {}", value),
    })
}

fn status_strs(statuses: &[JobStatus]) -> Vec<&'static str> {
    statuses.iter().map(|s| s.as_str()).collect()
}

fn job_from_rows(
    row: JobRow,
    errors: Vec<ErrorRow>,
    activity: Vec<ActivityRow>,
) -> Result<Job, DatabaseError> {
    let status = JobStatus::parse(&row.status).ok_or_else(|| DatabaseError::Decode {
        column: "status",
        reason: format!("unknown status '{}' for job {}", row.status, row.id),
    })?;
    let job_type = JobType::parse(&row.job_type).ok_or_else(|| DatabaseError::Decode {
        column: "job_type",
        reason: format!("unknown job type '{}' for job {}", row.job_type, row.id),
    })?;

    let errors = errors
        .into_iter()
        .map(|e| -> Result<RecordError, DatabaseError> {
            Ok(RecordError {
                row: to_count(e.row_number, "row_number")?,
                reason: e.reason,
                data: serde_json::from_str(&e.data).map_err(|err| DatabaseError::Decode {
                    column: "job_errors.data",
                    reason: err.to_string(),
                })?,
            })
        })
        .collect::<Result<Vec<_>, DatabaseError>>()?;

    let activity = activity
        .into_iter()
        .map(|a| -> Result<ActivityEntry, DatabaseError> {
            Ok(ActivityEntry {
                timestamp: parse_timestamp(&a.timestamp, "job_activity.timestamp")?,
                message: a.message,
            })
        })
        .collect::<Result<Vec<_>, DatabaseError>>()?;

    let mut job = Job {
        id: row.id,
        job_type,
        firm_id: row.firm_id,
        user_id: row.user_id,
        file_name: row.file_name,
        total_records: to_count(row.total_records, "total_records")?,
        processed_records: to_count(row.processed_records, "processed_records")?,
        successful_records: to_count(row.successful_records, "successful_records")?,
        failed_records: to_count(row.failed_records, "failed_records")?,
        batch_size: to_count(row.batch_size, "batch_size")?,
        current_batch: to_count(row.current_batch, "current_batch")?,
        total_batches: to_count(row.total_batches, "total_batches")?,
        status,
        started_at: parse_timestamp(&row.started_at, "started_at")?,
        completed_at: row
            .completed_at
            .as_deref()
            .map(|s| parse_timestamp(s, "completed_at"))
            .transpose()?,
        estimated_completion: row
            .estimated_completion
            .as_deref()
            .map(|s| parse_timestamp(s, "estimated_completion"))
            .transpose()?,
        duration_ms: row.duration_ms,
        errors,
        failure: row.failure,
        can_cancel: false,
        can_retry: false,
        cancel_requested: row.cancel_requested,
        retry_of: row.retry_of,
        activity,
    };
    job.refresh_flags();
    Ok(job)
}

fn load_job(conn: &rusqlite::Connection, id: &str) -> Result<Job, JobError> {
    let row = job_repo::find_by_id(conn, id)?.ok_or_else(|| JobError::NotFound(id.to_string()))?;
    hydrate(conn, row)
}

fn hydrate(conn: &rusqlite::Connection, row: JobRow) -> Result<Job, JobError> {
    let errors = job_repo::list_errors(conn, &row.id)?;
    let activity = job_repo::list_activity(conn, &row.id)?;
    Ok(job_from_rows(row, errors, activity)?)
}

/// Checks a patch against the stored job before anything is written.
fn validate_patch(job: &Job, patch: &JobPatch) -> Result<(usize, usize, usize, usize), JobError> {
    let invalid = |reason: String| JobError::InvalidPatch {
        job_id: job.id.clone(),
        reason,
    };

    let processed = patch.processed_records.unwrap_or(job.processed_records);
    let successful = patch.successful_records.unwrap_or(job.successful_records);
    let failed = patch.failed_records.unwrap_or(job.failed_records);
    let batch = patch.current_batch.unwrap_or(job.current_batch);

    if processed != successful + failed {
        return Err(invalid(format!(
            "processed ({}) must equal successful ({}) + failed ({})",
            processed, successful, failed
        )));
    }
    if processed > job.total_records {
        return Err(invalid(format!(
            "processed ({}) exceeds total ({})",
            processed, job.total_records
        )));
    }
    if processed < job.processed_records {
        return Err(invalid(format!(
            "processed may not regress from {} to {}",
            job.processed_records, processed
        )));
    }
    if batch < job.current_batch || batch > job.total_batches {
        return Err(invalid(format!(
            "current batch {} outside {}..={}",
            batch, job.current_batch, job.total_batches
        )));
    }
    if failed < job.failed_records + patch.append_errors.len() && !patch.append_errors.is_empty() {
        return Err(invalid(format!(
            "{} new errors but failed count only moved to {}",
            patch.append_errors.len(),
            failed
        )));
    }

    Ok((processed, successful, failed, batch))
}

// ─── JobStore ───────────────────────────────────────────────────────────────

/// Single source of truth for job records.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store backed by a fresh in-memory database.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Creates a queued job with zeroed counters and persists its records.
    pub fn create_job(&self, submission: &JobSubmission, batch_size: usize) -> Result<Job, JobError> {
        if batch_size == 0 {
            return Err(JobError::InvalidBatchSize(batch_size));
        }

        if !submission.source_rows.is_empty()
            && submission.source_rows.len() != submission.records.len()
        {
            return Err(JobError::InvalidSubmission(format!(
                "{} source rows for {} records",
                submission.source_rows.len(),
                submission.records.len()
            )));
        }

        let records = submission
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let data = serde_json::to_string(r).map_err(|e| DatabaseError::Decode {
                    column: "job_records.data",
                    reason: e.to_string(),
                })?;
                Ok((submission.source_row(i) as i64, data))
            })
            .collect::<Result<Vec<_>, DatabaseError>>()?;

        let total = submission.records.len();
        let now = format_timestamp(Utc::now());

        let job = self.db.with_conn(|conn| {
            let tx = conn.transaction().map_err(DatabaseError::from)?;
            let seq = job_repo::next_seq(&tx)?;
            let id = format!("JOB_{}", seq);

            let row = JobRow {
                seq,
                id: id.clone(),
                job_type: submission.job_type.as_str().to_string(),
                firm_id: submission.firm_id.clone(),
                user_id: submission.user_id.clone(),
                file_name: submission.file_name.clone(),
                total_records: total as i64,
                processed_records: 0,
                successful_records: 0,
                failed_records: 0,
                batch_size: batch_size as i64,
                current_batch: 0,
                total_batches: total_batches(total, batch_size) as i64,
                status: JobStatus::Queued.as_str().to_string(),
                started_at: now.clone(),
                completed_at: None,
                estimated_completion: None,
                duration_ms: None,
                failure: None,
                retry_of: submission.retry_of.clone(),
                cancel_requested: false,
                updated_at: now.clone(),
            };
            job_repo::insert(&tx, &row)?;
            job_repo::insert_records(&tx, &id, &records)?;

            let message = match &submission.retry_of {
                Some(original) => format!(
                    "Retry of {} submitted: {} records from {}",
                    original, total, submission.file_name
                ),
                None => format!("Job submitted: {} records from {}", total, submission.file_name),
            };
            job_repo::append_activity(&tx, &id, &now, &message)?;

            let job = load_job(&tx, &id)?;
            tx.commit().map_err(DatabaseError::from)?;
            Ok::<_, JobError>(job)
        })?;

        log::info!(
            "Created {} job {} ({} records, {} batches)",
            job.job_type,
            job.id,
            job.total_records,
            job.total_batches
        );
        Ok(job)
    }

    /// Returns a job by ID.
    pub fn get(&self, id: &str) -> Result<Job, JobError> {
        self.db.with_conn(|conn| load_job(conn, id))
    }

    /// Returns all jobs in insertion order.
    pub fn list_jobs(&self) -> Result<Vec<Job>, JobError> {
        self.query(&JobFilter::default())
    }

    /// Returns the jobs whose status is any of `statuses`, in insertion order.
    pub fn list_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, JobError> {
        self.query(&JobFilter {
            statuses: statuses.iter().map(|s| s.as_str().to_string()).collect(),
            ..Default::default()
        })
    }

    /// Query jobs with filters and pagination.
    pub fn query(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        self.db.with_conn(|conn| {
            job_repo::query(conn, filter)?
                .into_iter()
                .map(|row| hydrate(conn, row))
                .collect()
        })
    }

    /// Active count and the newest `limit` active jobs, read under one lock
    /// so the two always agree.
    pub fn active_summary(&self, limit: usize) -> Result<(usize, Vec<Job>), JobError> {
        let statuses = status_strs(&JobStatus::ACTIVE);
        let filter = JobFilter {
            statuses: statuses.iter().map(|s| s.to_string()).collect(),
            limit: Some(limit as u64),
            newest_first: true,
            ..Default::default()
        };
        self.db.with_conn(|conn| {
            let count = job_repo::count_by_statuses(conn, &statuses)?;
            let jobs = job_repo::query(conn, &filter)?
                .into_iter()
                .map(|row| hydrate(conn, row))
                .collect::<Result<Vec<_>, JobError>>()?;
            Ok((count as usize, jobs))
        })
    }

    /// Number of jobs in `queued` or `processing`. Read-only.
    pub fn active_count(&self) -> Result<usize, JobError> {
        let statuses = status_strs(&JobStatus::ACTIVE);
        let count = self
            .db
            .with_conn(|conn| job_repo::count_by_statuses(conn, &statuses))?;
        Ok(count as usize)
    }

    /// Applies a merge-patch to a processing job's progress fields.
    pub fn update_job(&self, id: &str, patch: JobPatch) -> Result<Job, JobError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction().map_err(DatabaseError::from)?;
            let row = job_repo::find_by_id(&tx, id)?.ok_or_else(|| JobError::NotFound(id.to_string()))?;
            let current = hydrate(&tx, row.clone())?;

            if current.status != JobStatus::Processing {
                return Err(JobError::InvalidState {
                    job_id: id.to_string(),
                    status: current.status,
                    operation: "update",
                });
            }

            let (processed, successful, failed, batch) = validate_patch(&current, &patch)?;
            let now = format_timestamp(Utc::now());

            let updated = JobRow {
                processed_records: processed as i64,
                successful_records: successful as i64,
                failed_records: failed as i64,
                current_batch: batch as i64,
                estimated_completion: patch
                    .estimated_completion
                    .map(format_timestamp)
                    .or(row.estimated_completion.clone()),
                updated_at: now.clone(),
                ..row
            };
            job_repo::update_progress(&tx, &updated)?;

            for error in &patch.append_errors {
                job_repo::append_error(
                    &tx,
                    id,
                    &ErrorRow {
                        row_number: error.row as i64,
                        reason: error.reason.clone(),
                        data: error.data.to_string(),
                    },
                )?;
            }
            for message in &patch.append_activity {
                job_repo::append_activity(&tx, id, &now, message)?;
            }

            let job = load_job(&tx, id)?;
            tx.commit().map_err(DatabaseError::from)?;
            Ok(job)
        })
    }

    /// Moves a job between non-terminal states. Fails with `InvalidState`
    /// when the current status is not one of `from`.
    pub fn transition(
        &self,
        id: &str,
        from: &[JobStatus],
        to: JobStatus,
        message: &str,
    ) -> Result<Job, JobError> {
        debug_assert!(to.is_active(), "terminal states go through finalize");
        let from_strs = status_strs(from);
        self.db.with_conn(|conn| {
            let tx = conn.transaction().map_err(DatabaseError::from)?;
            let now = format_timestamp(Utc::now());
            let changed = job_repo::compare_and_set_status(&tx, id, &from_strs, to.as_str(), &now)?;
            if changed == 0 {
                let current = load_job(&tx, id)?;
                return Err(JobError::InvalidState {
                    job_id: id.to_string(),
                    status: current.status,
                    operation: "transition",
                });
            }
            job_repo::append_activity(&tx, id, &now, message)?;
            let job = load_job(&tx, id)?;
            tx.commit().map_err(DatabaseError::from)?;
            Ok(job)
        })
    }

    /// Records an accepted cancel request on a processing job.
    pub fn mark_cancel_requested(&self, id: &str) -> Result<Job, JobError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction().map_err(DatabaseError::from)?;
            let now = format_timestamp(Utc::now());
            let changed = job_repo::set_cancel_requested(&tx, id, &now)?;
            if changed == 1 {
                job_repo::append_activity(&tx, id, &now, "Cancellation requested")?;
            }
            let job = load_job(&tx, id)?;
            tx.commit().map_err(DatabaseError::from)?;
            Ok(job)
        })
    }

    /// Moves a job from one of `from` into the terminal `status`, setting
    /// `completed_at` and `duration_ms`. The only writer of those fields.
    pub fn finalize(
        &self,
        id: &str,
        from: &[JobStatus],
        status: JobStatus,
        failure: Option<&str>,
        message: &str,
    ) -> Result<Job, JobError> {
        debug_assert!(status.is_terminal(), "finalize needs a terminal status");
        let from_strs = status_strs(from);
        self.db.with_conn(|conn| {
            let tx = conn.transaction().map_err(DatabaseError::from)?;
            let current = load_job(&tx, id)?;
            if current.completed_at.is_some() {
                return Err(JobError::AlreadyFinalized(id.to_string()));
            }

            let completed_at = Utc::now();
            let duration_ms = (completed_at - current.started_at).num_milliseconds().max(0);
            let completed_str = format_timestamp(completed_at);
            let changed = job_repo::finalize(
                &tx,
                id,
                &from_strs,
                status.as_str(),
                &completed_str,
                duration_ms,
                failure,
            )?;
            if changed == 0 {
                return Err(JobError::InvalidState {
                    job_id: id.to_string(),
                    status: current.status,
                    operation: "finalize",
                });
            }
            job_repo::append_activity(&tx, id, &completed_str, message)?;

            let job = load_job(&tx, id)?;
            tx.commit().map_err(DatabaseError::from)?;
            Ok(job)
        })
    }

    /// Reads up to `limit` source records after position `offset`.
    pub fn load_records(
        &self,
        id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, JobError> {
        let raw = self
            .db
            .with_conn(|conn| job_repo::load_records(conn, id, offset as u64, limit as u64))?;
        let records = raw
            .into_iter()
            .map(|r| -> Result<SourceRecord, DatabaseError> {
                let data = serde_json::from_str(&r.data).map_err(|e| DatabaseError::Decode {
                    column: "job_records.data",
                    reason: format!("position {}: {}", r.position, e),
                })?;
                Ok(SourceRecord {
                    position: to_count(r.position, "position")?,
                    row: to_count(r.source_row, "source_row")?,
                    data,
                })
            })
            .collect::<Result<Vec<_>, DatabaseError>>()?;
        Ok(records)
    }

    /// Every record of `job_type` that a committed batch accepted.
    pub fn accepted_records(&self, job_type: JobType) -> Result<Vec<Record>, JobError> {
        let raw = self
            .db
            .with_conn(|conn| job_repo::accepted_records(conn, job_type.as_str()))?;
        let records = raw
            .iter()
            .map(|data| {
                serde_json::from_str(data).map_err(|e| DatabaseError::Decode {
                    column: "job_records.data",
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, DatabaseError>>()?;
        Ok(records)
    }
}
