use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broadcast::JobProgressBroadcaster;
use crate::config::EngineConfig;
use crate::error::JobError;
use crate::job::{Job, JobStatus, JobSubmission, Record};
use crate::store::JobStore;
use crate::validation::ValidatorRegistry;

use super::delay::{BatchDelay, TokioDelay};
use super::processor::BatchProcessor;

/// Owns job state transitions: submission, the `queued → processing`
/// claim, cancellation and retry.
///
/// Cheap to clone; clones share the store, the processor and the
/// cancellation tokens.
#[derive(Clone)]
pub struct JobController {
    store: JobStore,
    processor: Arc<BatchProcessor>,
    batch_size: usize,
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
    progress: Option<JobProgressBroadcaster>,
}

impl JobController {
    pub fn new(processor: BatchProcessor, batch_size: usize) -> Self {
        Self {
            store: processor.store().clone(),
            processor: Arc::new(processor),
            batch_size,
            tokens: Arc::new(Mutex::new(HashMap::new())),
            progress: None,
        }
    }

    /// Builds the controller and its processor from engine settings, pausing
    /// between batches on the tokio timer.
    pub fn from_config(
        store: JobStore,
        validators: ValidatorRegistry,
        config: &EngineConfig,
        progress: Option<JobProgressBroadcaster>,
    ) -> Self {
        Self::with_delay(store, validators, config, progress, Arc::new(TokioDelay))
    }

    pub fn with_delay(
        store: JobStore,
        validators: ValidatorRegistry,
        config: &EngineConfig,
        progress: Option<JobProgressBroadcaster>,
        delay: Arc<dyn BatchDelay>,
    ) -> Self {
        let mut processor = BatchProcessor::new(store, validators)
            .with_delay(delay, Duration::from_millis(config.batch_delay_ms));
        if let Some(ref progress) = progress {
            processor = processor.with_progress(progress.clone());
        }
        let mut controller = Self::new(processor, config.batch_size);
        controller.progress = progress;
        controller
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Creates a queued job for `submission`.
    pub fn submit(&self, submission: &JobSubmission) -> Result<Job, JobError> {
        if self
            .processor
            .validators()
            .get(submission.job_type)
            .is_none()
        {
            return Err(JobError::MissingValidator(submission.job_type));
        }

        let job = self.store.create_job(submission, self.batch_size)?;
        debug!("Submitted job {} for firm {}", job.id, job.firm_id);
        self.publish(&job, "Job submitted");
        Ok(job)
    }

    /// Claims a queued job and processes it to a terminal state.
    ///
    /// Fails with `InvalidState` if the job is not queued, which includes a
    /// second run of a job that is already processing.
    pub async fn run(&self, job_id: &str) -> Result<Job, JobError> {
        let token = self.token_for(job_id);

        let claimed = match self.store.transition(
            job_id,
            &[JobStatus::Queued],
            JobStatus::Processing,
            "Processing started",
        ) {
            Ok(job) => job,
            Err(JobError::InvalidState {
                job_id, status, ..
            }) => {
                if status.is_terminal() {
                    self.release_token(&job_id);
                }
                return Err(JobError::InvalidState {
                    job_id,
                    status,
                    operation: "run",
                });
            }
            Err(e) => {
                self.release_token(job_id);
                return Err(e);
            }
        };

        debug!("Job {} claimed for processing", job_id);
        self.publish(&claimed, "Processing started");

        let result = self.processor.run(job_id, &token).await;
        self.release_token(job_id);
        result
    }

    /// Runs the job on a tokio task.
    pub fn spawn(&self, job_id: &str) -> JoinHandle<Result<Job, JobError>> {
        let controller = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            let result = controller.run(&job_id).await;
            if let Err(ref e) = result {
                warn!("Job {} did not run: {}", job_id, e);
            }
            result
        })
    }

    /// Cancels a queued or processing job.
    ///
    /// A queued job becomes `cancelled` immediately. A processing job is
    /// flagged and stops at its next batch boundary; the returned job then
    /// still reads `processing` with `cancel_requested` set.
    pub fn cancel(&self, job_id: &str) -> Result<Job, JobError> {
        let job = self.store.get(job_id)?;
        if !job.can_cancel {
            return Err(JobError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
                operation: "cancel",
            });
        }

        // Signal first so a concurrent claim observes it at its first boundary.
        self.token_for(job_id).cancel();

        match self.store.finalize(
            job_id,
            &[JobStatus::Queued],
            JobStatus::Cancelled,
            None,
            "Job cancelled before processing started",
        ) {
            Ok(job) => {
                self.release_token(job_id);
                info!("Job {} cancelled while queued", job_id);
                self.publish(&job, "Job cancelled");
                return Ok(job);
            }
            Err(JobError::InvalidState { .. }) | Err(JobError::AlreadyFinalized(_)) => {}
            Err(e) => return Err(e),
        }

        let job = self.store.mark_cancel_requested(job_id)?;
        if job.status == JobStatus::Processing {
            info!("Cancellation requested for job {}", job_id);
            self.publish(&job, "Cancellation requested");
            return Ok(job);
        }

        // Finished between the checks above.
        self.release_token(job_id);
        Err(JobError::InvalidState {
            job_id: job_id.to_string(),
            status: job.status,
            operation: "cancel",
        })
    }

    /// Queues a new job holding the original's failed and unprocessed
    /// records, in their original order. Each keeps its row in the first upload.
    pub fn retry(&self, job_id: &str) -> Result<Job, JobError> {
        let original = self.store.get(job_id)?;
        if !original.can_retry {
            return Err(JobError::InvalidState {
                job_id: job_id.to_string(),
                status: original.status,
                operation: "retry",
            });
        }

        let failed_rows: HashSet<usize> = original.errors.iter().map(|e| e.row).collect();
        let (source_rows, records): (Vec<usize>, Vec<Record>) = self
            .store
            .load_records(job_id, 0, original.total_records)?
            .into_iter()
            .filter(|r| failed_rows.contains(&r.row) || r.position > original.processed_records)
            .map(|r| (r.row, r.data))
            .unzip();

        let submission = JobSubmission {
            job_type: original.job_type,
            firm_id: original.firm_id.clone(),
            user_id: original.user_id.clone(),
            file_name: original.file_name.clone(),
            records,
            retry_of: Some(original.id.clone()),
            source_rows,
        };

        let job = self.store.create_job(&submission, original.batch_size)?;
        info!(
            "Job {} retries {} with {} records",
            job.id, original.id, job.total_records
        );
        self.publish(&job, "Retry submitted");
        Ok(job)
    }

    /// Number of runs currently holding a cancellation token.
    pub fn tracked_runs(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or(0)
    }

    fn token_for(&self, job_id: &str) -> CancellationToken {
        match self.tokens.lock() {
            Ok(mut tokens) => tokens
                .entry(job_id.to_string())
                .or_insert_with(CancellationToken::new)
                .clone(),
            Err(poisoned) => poisoned
                .into_inner()
                .entry(job_id.to_string())
                .or_insert_with(CancellationToken::new)
                .clone(),
        }
    }

    fn release_token(&self, job_id: &str) {
        match self.tokens.lock() {
            Ok(mut tokens) => {
                tokens.remove(job_id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(job_id);
            }
        }
    }

    fn publish(&self, job: &Job, message: &str) {
        if let Some(ref progress) = self.progress {
            progress.publish(job, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;
    use crate::worker::delay::NoDelay;
    use serde_json::json;

    fn controller() -> JobController {
        let store = JobStore::in_memory().unwrap();
        let config = EngineConfig {
            batch_size: 2,
            ..EngineConfig::default()
        };
        JobController::with_delay(
            store,
            ValidatorRegistry::with_defaults(),
            &config,
            None,
            Arc::new(NoDelay),
        )
    }

    fn search(count: usize) -> JobSubmission {
        let records = (0..count)
            .map(|i| json!({ "lastName": format!("Name{}", i) }))
            .collect();
        JobSubmission::new(JobType::SearchBatch, "FIRM_1", "USER_1", "search.csv", records)
    }

    #[tokio::test]
    async fn test_run_then_second_run_rejected() {
        let controller = controller();
        let job = controller.submit(&search(3)).unwrap();

        let done = controller.run(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Complete);
        assert_eq!(controller.tracked_runs(), 0);

        let err = controller.run(&job.id).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidState {
                operation: "run",
                status: JobStatus::Complete,
                ..
            }
        ));
        assert_eq!(controller.tracked_runs(), 0);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let controller = controller();
        let job = controller.submit(&search(3)).unwrap();

        let cancelled = controller.cancel(&job.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.processed_records, 0);
        assert!(cancelled.completed_at.is_some());
        assert!(cancelled.can_retry);
        assert!(!cancelled.can_cancel);
        assert_eq!(controller.tracked_runs(), 0);

        assert!(matches!(
            controller.cancel(&job.id),
            Err(JobError::InvalidState { .. })
        ));
        assert!(matches!(
            controller.run(&job.id).await,
            Err(JobError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_submit_requires_validator() {
        let store = JobStore::in_memory().unwrap();
        let processor = BatchProcessor::new(store, ValidatorRegistry::new());
        let controller = JobController::new(processor, 10);

        let err = controller.submit(&search(1)).unwrap_err();
        assert!(matches!(err, JobError::MissingValidator(JobType::SearchBatch)));
        assert!(controller.store().list_jobs().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_job() {
        let controller = controller();
        assert!(matches!(controller.cancel("JOB_9"), Err(JobError::NotFound(_))));
        assert!(matches!(controller.retry("JOB_9"), Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_retry_rules() {
        let controller = controller();

        let job = controller.submit(&search(2)).unwrap();
        assert!(matches!(
            controller.retry(&job.id),
            Err(JobError::InvalidState { status: JobStatus::Queued, .. })
        ));

        let done = controller.run(&job.id).await.unwrap();
        assert!(matches!(
            controller.retry(&done.id),
            Err(JobError::InvalidState { status: JobStatus::Complete, .. })
        ));

        let job = controller.submit(&search(5)).unwrap();
        controller.cancel(&job.id).unwrap();
        let retry = controller.retry(&job.id).unwrap();
        assert_eq!(retry.total_records, 5);
        assert_eq!(retry.retry_of.as_deref(), Some(job.id.as_str()));
        assert_eq!(retry.status, JobStatus::Queued);
        assert!(retry.errors.is_empty());
    }
}
