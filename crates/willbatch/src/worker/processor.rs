use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::broadcast::JobProgressBroadcaster;
use crate::error::{JobError, ProcessingError};
use crate::job::{Job, JobPatch, JobStatus, RecordError};
use crate::store::JobStore;
use crate::validation::{RecordContext, RecordValidator, Validation, ValidatorRegistry};

use super::delay::{BatchDelay, TokioDelay};

/// Drives a claimed job through its batches.
///
/// The processor only ever touches jobs in `processing`; claiming and
/// cancellation requests belong to [`super::JobController`].
pub struct BatchProcessor {
    store: JobStore,
    validators: ValidatorRegistry,
    delay: Arc<dyn BatchDelay>,
    batch_delay: Duration,
    progress: Option<JobProgressBroadcaster>,
}

/// How a batch loop stopped short of completion.
enum Interrupt {
    Cancelled,
    Failed(ProcessingError),
    Store(JobError),
}

struct Tally {
    successful: usize,
    failed: usize,
    errors: Vec<RecordError>,
}

impl BatchProcessor {
    pub fn new(store: JobStore, validators: ValidatorRegistry) -> Self {
        Self {
            store,
            validators,
            delay: Arc::new(TokioDelay),
            batch_delay: Duration::from_millis(500),
            progress: None,
        }
    }

    pub fn with_delay(mut self, delay: Arc<dyn BatchDelay>, batch_delay: Duration) -> Self {
        self.delay = delay;
        self.batch_delay = batch_delay;
        self
    }

    pub fn with_progress(mut self, progress: JobProgressBroadcaster) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn validators(&self) -> &ValidatorRegistry {
        &self.validators
    }

    /// Processes every remaining batch of `job_id` and finalizes the job.
    ///
    /// Returns the job in its terminal state. Per-row rejections never fail
    /// the run; only a [`ProcessingError`] ends it as `failed`.
    pub async fn run(&self, job_id: &str, token: &CancellationToken) -> Result<Job, JobError> {
        let job = self.store.get(job_id)?;
        if job.status != JobStatus::Processing {
            return Err(JobError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
                operation: "process",
            });
        }

        let span = info_span!("job_run",
            job_id = %job.id,
            job_type = %job.job_type,
            total_records = job.total_records,
            total_batches = job.total_batches,
        );

        async {
            let Some(validator) = self.validators.get(job.job_type) else {
                let err = ProcessingError::ValidatorUnavailable(format!(
                    "no validator registered for {}",
                    job.job_type
                ));
                return self.finish_failed(&job, err);
            };

            let outcome = self.process_batches(&job, validator.as_ref(), token).await;
            validator.finish(&job.id);

            match outcome {
                Ok(()) => self.finish_complete(&job.id),
                Err(Interrupt::Cancelled) => self.finish_cancelled(&job.id),
                Err(Interrupt::Failed(err)) => self.finish_failed(&job, err),
                Err(Interrupt::Store(err)) => {
                    warn!("Job {}: progress update failed: {}", job.id, err);
                    self.finish_failed(&job, ProcessingError::ProgressNotStored(err.to_string()))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn process_batches(
        &self,
        job: &Job,
        validator: &dyn RecordValidator,
        token: &CancellationToken,
    ) -> Result<(), Interrupt> {
        let run_started = Utc::now();
        let first_batch = job.current_batch + 1;
        let mut processed = job.processed_records;
        let mut successful = job.successful_records;
        let mut failed = job.failed_records;

        for batch in first_batch..=job.total_batches {
            if token.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }

            let offset = (batch - 1) * job.batch_size;
            let expected = job.batch_size.min(job.total_records - offset);

            let tally = self
                .process_batch(job, batch, offset, expected, validator)
                .instrument(info_span!("batch", batch, records = expected))
                .await?;

            processed += expected;
            successful += tally.successful;
            failed += tally.failed;

            let message = format!(
                "Batch {}/{} processed: {} succeeded, {} failed",
                batch, job.total_batches, tally.successful, tally.failed
            );
            let patch = JobPatch {
                processed_records: Some(processed),
                successful_records: Some(successful),
                failed_records: Some(failed),
                current_batch: Some(batch),
                estimated_completion: estimate_completion(
                    run_started,
                    batch + 1 - first_batch,
                    job.total_batches - batch,
                ),
                append_errors: tally.errors,
                append_activity: vec![message.clone()],
            };

            let updated = self
                .store
                .update_job(&job.id, patch)
                .map_err(Interrupt::Store)?;
            validator.commit(&job.id);
            debug!("Job {}: {}", job.id, message);
            self.publish(&updated, &message);

            if batch < job.total_batches {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = self.delay.pause(self.batch_delay) => {}
                }
            }
        }

        if token.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        Ok(())
    }

    async fn process_batch(
        &self,
        job: &Job,
        batch: usize,
        offset: usize,
        expected: usize,
        validator: &dyn RecordValidator,
    ) -> Result<Tally, Interrupt> {
        let records = self
            .store
            .load_records(&job.id, offset, job.batch_size)
            .map_err(|e| Interrupt::Failed(ProcessingError::UnreadableSource(e.to_string())))?;

        if records.len() != expected {
            return Err(Interrupt::Failed(ProcessingError::UnreadableSource(format!(
                "batch {} expected {} records, found {}",
                batch,
                expected,
                records.len()
            ))));
        }

        let mut tally = Tally {
            successful: 0,
            failed: 0,
            errors: Vec::new(),
        };

        for record in records {
            let ctx = RecordContext {
                job_id: &job.id,
                row: record.row,
            };
            match validator.validate(&ctx, &record.data).map_err(Interrupt::Failed)? {
                Validation::Accepted => tally.successful += 1,
                Validation::Rejected { reason } => {
                    tally.failed += 1;
                    tally.errors.push(RecordError {
                        row: record.row,
                        reason,
                        data: record.data,
                    });
                }
            }
        }

        Ok(tally)
    }

    fn finish_complete(&self, job_id: &str) -> Result<Job, JobError> {
        let current = self.store.get(job_id)?;
        let message = format!(
            "Job complete: {} succeeded, {} failed",
            current.successful_records, current.failed_records
        );
        let job = self.store.finalize(
            job_id,
            &[JobStatus::Processing],
            JobStatus::Complete,
            None,
            &message,
        )?;
        info!("{}", format_summary(&job));
        self.publish(&job, &message);
        Ok(job)
    }

    fn finish_cancelled(&self, job_id: &str) -> Result<Job, JobError> {
        let current = self.store.get(job_id)?;
        let message = format!(
            "Job cancelled after {} of {} records",
            current.processed_records, current.total_records
        );
        let job = self.store.finalize(
            job_id,
            &[JobStatus::Processing],
            JobStatus::Cancelled,
            None,
            &message,
        )?;
        info!("{}", format_summary(&job));
        self.publish(&job, &message);
        Ok(job)
    }

    fn finish_failed(&self, job: &Job, err: ProcessingError) -> Result<Job, JobError> {
        let failure = err.to_string();
        warn!("Job {} failed: {}", job.id, failure);
        let message = format!("Job failed: {}", failure);
        let job = self
            .store
            .finalize(
                &job.id,
                &[JobStatus::Processing],
                JobStatus::Failed,
                Some(&failure),
                &message,
            )
            .map_err(|e| {
                error!("Job {} could not be marked failed: {}", job.id, e);
                e
            })?;
        self.publish(&job, &message);
        Ok(job)
    }

    fn publish(&self, job: &Job, message: &str) {
        if let Some(ref progress) = self.progress {
            progress.publish(job, message);
        }
    }
}

/// Projects the finish time from the average duration of the batches run so far.
fn estimate_completion(
    run_started: DateTime<Utc>,
    batches_done: usize,
    batches_left: usize,
) -> Option<DateTime<Utc>> {
    if batches_done == 0 {
        return None;
    }
    let now = Utc::now();
    let elapsed_ms = (now - run_started).num_milliseconds().max(0);
    let per_batch_ms = elapsed_ms / batches_done as i64;
    let remaining = TimeDelta::try_milliseconds(per_batch_ms.saturating_mul(batches_left as i64))?;
    now.checked_add_signed(remaining)
}

/// One-line summary used in logs and by the binary.
pub fn format_summary(job: &Job) -> String {
    let mut summary = format!(
        "Job {} ({}) {}: {}/{} processed, {} succeeded, {} failed",
        job.id,
        job.job_type,
        job.status,
        job.processed_records,
        job.total_records,
        job.successful_records,
        job.failed_records
    );
    if let Some(ms) = job.duration_ms {
        summary.push_str(&format!(" in {}ms", ms));
    }
    if let Some(ref failure) = job.failure {
        summary.push_str(&format!(" ({})", failure));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseError;
    use crate::job::{JobSubmission, JobType};
    use crate::validation::SearchRecordValidator;
    use crate::worker::delay::NoDelay;
    use serde_json::json;

    fn processor(store: &JobStore) -> BatchProcessor {
        let mut validators = ValidatorRegistry::new();
        validators.register(JobType::SearchBatch, Arc::new(SearchRecordValidator));
        BatchProcessor::new(store.clone(), validators).with_delay(Arc::new(NoDelay), Duration::ZERO)
    }

    fn claimed_job(store: &JobStore, records: Vec<serde_json::Value>, batch_size: usize) -> Job {
        let submission =
            JobSubmission::new(JobType::SearchBatch, "FIRM_1", "USER_1", "search.csv", records);
        let job = store.create_job(&submission, batch_size).unwrap();
        store
            .transition(&job.id, &[JobStatus::Queued], JobStatus::Processing, "start")
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_requires_processing() {
        let store = JobStore::in_memory().unwrap();
        let submission = JobSubmission::new(
            JobType::SearchBatch,
            "FIRM_1",
            "USER_1",
            "search.csv",
            vec![json!({ "lastName": "A" })],
        );
        let job = store.create_job(&submission, 1).unwrap();

        let err = processor(&store)
            .run(&job.id, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidState {
                status: JobStatus::Queued,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_run_records_rejections_with_absolute_rows() {
        let store = JobStore::in_memory().unwrap();
        let mut records: Vec<_> = (0..5).map(|i| json!({ "lastName": format!("N{}", i) })).collect();
        records[3] = json!({ "firstName": "nobody" });
        let job = claimed_job(&store, records, 2);

        let done = processor(&store)
            .run(&job.id, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(done.status, JobStatus::Complete);
        assert_eq!(done.current_batch, 3);
        assert_eq!(done.successful_records, 4);
        assert_eq!(done.failed_records, 1);
        assert_eq!(done.errors.len(), 1);
        assert_eq!(done.errors[0].row, 4);
        assert!(done.estimated_completion.is_none());
        assert!(done
            .activity
            .iter()
            .any(|a| a.message == "Batch 2/3 processed: 1 succeeded, 1 failed"));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_first_batch() {
        let store = JobStore::in_memory().unwrap();
        let job = claimed_job(&store, vec![json!({ "lastName": "A" }); 4], 2);
        let token = CancellationToken::new();
        token.cancel();

        let done = processor(&store).run(&job.id, &token).await.unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
        assert_eq!(done.processed_records, 0);
        assert!(done.can_retry);
    }

    #[tokio::test]
    async fn test_missing_validator_fails_job() {
        let store = JobStore::in_memory().unwrap();
        let submission = JobSubmission::new(
            JobType::WillUpload,
            "FIRM_1",
            "USER_1",
            "wills.csv",
            vec![json!({})],
        );
        let job = store.create_job(&submission, 1).unwrap();
        store
            .transition(&job.id, &[JobStatus::Queued], JobStatus::Processing, "start")
            .unwrap();

        let done = processor(&store)
            .run(&job.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.failure.unwrap().contains("no validator"));
        assert!(done.errors.is_empty());
    }

    #[tokio::test]
    async fn test_progress_events_published_per_batch() {
        let store = JobStore::in_memory().unwrap();
        let broadcaster = JobProgressBroadcaster::new(16);
        let mut rx = broadcaster.subscribe();
        let job = claimed_job(&store, vec![json!({ "lastName": "A" }); 3], 2);

        processor(&store)
            .with_progress(broadcaster)
            .run(&job.id, &CancellationToken::new())
            .await
            .unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.current_batch, 1);
        assert_eq!(first.processed_records, 2);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.current_batch, 2);
        let last = rx.try_recv().unwrap();
        assert_eq!(last.status, JobStatus::Complete);
        assert!(last.is_terminal());
    }

    #[tokio::test]
    async fn test_unstored_progress_fails_job() {
        let store = JobStore::in_memory().unwrap();
        let job = claimed_job(&store, vec![json!({ "lastName": "A" }); 4], 2);
        store
            .database()
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_progress BEFORE UPDATE OF processed_records ON jobs
                     BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
                )
                .map_err(DatabaseError::from)
            })
            .unwrap();

        let done = processor(&store)
            .run(&job.id, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(done.status, JobStatus::Failed);
        let failure = done.failure.clone().unwrap();
        assert!(failure.starts_with("Progress could not be stored"));
        assert!(failure.contains("disk I/O error"));
        assert_eq!(done.processed_records, 0);
        assert!(done.completed_at.is_some());
        assert!(done.can_retry);
        assert_eq!(store.active_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_errors_use_source_rows() {
        let store = JobStore::in_memory().unwrap();
        let mut submission = JobSubmission::new(
            JobType::SearchBatch,
            "FIRM_1",
            "USER_1",
            "search.csv",
            vec![json!({ "lastName": "A" }), json!({ "firstName": "B" })],
        );
        submission.source_rows = vec![7, 19];
        let job = store.create_job(&submission, 10).unwrap();
        store
            .transition(&job.id, &[JobStatus::Queued], JobStatus::Processing, "start")
            .unwrap();

        let done = processor(&store)
            .run(&job.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.failed_records, 1);
        assert_eq!(done.errors[0].row, 19);
    }

    #[test]
    fn test_estimate_completion() {
        let started = Utc::now() - TimeDelta::seconds(10);
        assert!(estimate_completion(started, 0, 3).is_none());
        let eta = estimate_completion(started, 2, 2).unwrap();
        assert!(eta > Utc::now() + TimeDelta::seconds(8));
    }
}
