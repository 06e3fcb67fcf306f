//! Test harness for isolated job engine runs.
//!
//! Every harness owns its own in-memory (or temp-file) database, so tests
//! can run in parallel without sharing job ids.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use willbatch::{
    BatchDelay, Database, EngineConfig, Job, JobController, JobProgressBroadcaster,
    JobProgressEvent, JobStore, NoDelay, ProcessingError, Record, RecordContext, RecordValidator,
    Validation, ValidatorRegistry,
};

/// A pause that never ends on its own; only cancellation moves the job on.
pub struct StallDelay;

#[async_trait]
impl BatchDelay for StallDelay {
    async fn pause(&self, _duration: Duration) {
        std::future::pending::<()>().await;
    }
}

/// Accepts every record until `fail_at`, then reports the source unreadable.
pub struct FailingValidator {
    pub fail_at: usize,
    pub reject: Vec<usize>,
}

impl RecordValidator for FailingValidator {
    fn validate(
        &self,
        ctx: &RecordContext<'_>,
        _record: &Record,
    ) -> Result<Validation, ProcessingError> {
        if ctx.row == self.fail_at {
            return Err(ProcessingError::UnreadableSource(format!(
                "row {} is truncated",
                ctx.row
            )));
        }
        if self.reject.contains(&ctx.row) {
            return Ok(Validation::rejected("rejected by test"));
        }
        Ok(Validation::Accepted)
    }
}

/// Accepts every record after handing its job id and row to `hook`.
pub struct HookValidator<F> {
    pub hook: F,
}

impl<F> RecordValidator for HookValidator<F>
where
    F: Fn(&str, usize) + Send + Sync,
{
    fn validate(
        &self,
        ctx: &RecordContext<'_>,
        _record: &Record,
    ) -> Result<Validation, ProcessingError> {
        (self.hook)(ctx.job_id, ctx.row);
        Ok(Validation::Accepted)
    }
}

/// Test harness wiring store, controller and progress channel.
pub struct TestHarness {
    /// Keeps a file-backed database alive for the harness lifetime.
    temp_dir: Option<TempDir>,
    pub store: JobStore,
    pub controller: JobController,
    pub progress: JobProgressBroadcaster,
}

impl TestHarness {
    /// In-memory store, default validators, batch size 10, no inter-batch delay.
    pub fn new() -> Self {
        Self::build(ValidatorRegistry::with_defaults(), Arc::new(NoDelay), None)
    }

    /// Like `new` but every inter-batch pause stalls until cancelled.
    pub fn stalling() -> Self {
        Self::build(ValidatorRegistry::with_defaults(), Arc::new(StallDelay), None)
    }

    pub fn with_validators(validators: ValidatorRegistry) -> Self {
        Self::build(validators, Arc::new(NoDelay), None)
    }

    /// Backs the store with a SQLite file in a temp directory.
    pub fn file_backed() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        Self::build(
            ValidatorRegistry::with_defaults(),
            Arc::new(NoDelay),
            Some(temp_dir),
        )
    }

    fn build(
        validators: ValidatorRegistry,
        delay: Arc<dyn BatchDelay>,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let db = match temp_dir {
            Some(ref dir) => Database::open(&dir.path().join("jobs.db")).expect("open db"),
            None => Database::open_in_memory().expect("open in-memory db"),
        };
        let store = JobStore::new(db);
        let progress = JobProgressBroadcaster::new(1024);
        let config = EngineConfig::default();
        let controller = JobController::with_delay(
            store.clone(),
            validators,
            &config,
            Some(progress.clone()),
            delay,
        );

        Self {
            temp_dir,
            store,
            controller,
            progress,
        }
    }

    pub fn db_path(&self) -> Option<std::path::PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().join("jobs.db"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.progress.subscribe()
    }

    /// Waits for the first event on `job_id` matching `pred`.
    pub async fn wait_for<F>(
        rx: &mut broadcast::Receiver<JobProgressEvent>,
        job_id: &str,
        pred: F,
    ) -> JobProgressEvent
    where
        F: Fn(&JobProgressEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("progress channel closed");
                if event.job_id == job_id && pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for progress event")
    }

    pub fn reload(&self, job: &Job) -> Job {
        self.store.get(&job.id).expect("job exists")
    }
}
