//! Pluggable per-record validation policies.
//!
//! The batch processor never hardcodes rules: each job type maps to a
//! [`RecordValidator`] in a [`ValidatorRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{JobError, ProcessingError};
use crate::job::{JobType, Record};
use crate::store::JobStore;

pub mod duplicates;
pub mod search;
pub mod will;

pub use duplicates::DuplicateGuard;
pub use search::SearchRecordValidator;
pub use will::WillRecordValidator;

/// Outcome of validating one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Accepted,
    Rejected { reason: String },
}

impl Validation {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Validation::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Validation::Accepted)
    }
}

/// Where a record sits while it is being validated.
#[derive(Debug, Clone, Copy)]
pub struct RecordContext<'a> {
    pub job_id: &'a str,
    /// 1-based row in the upload the record first arrived in.
    pub row: usize,
}

pub trait RecordValidator: Send + Sync {
    /// Per-row rejections are `Ok(Validation::Rejected)`; `Err` aborts the whole job.
    fn validate(&self, ctx: &RecordContext<'_>, record: &Record)
        -> Result<Validation, ProcessingError>;

    /// Called after the results of a batch of `job_id` are stored.
    fn commit(&self, _job_id: &str) {}

    /// Called once when a run for `job_id` stops, whatever the outcome.
    fn finish(&self, _job_id: &str) {}
}

/// Maps job types to their validation policy.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<JobType, Arc<dyn RecordValidator>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Will uploads reject duplicate will references; searches are checked field by field.
    pub fn with_defaults() -> Self {
        Self::with_registered_wills(&[])
    }

    /// Like [`with_defaults`](Self::with_defaults), with every will already
    /// accepted into `store` registered for duplicate checks.
    pub fn from_store(store: &JobStore) -> Result<Self, JobError> {
        let wills = store.accepted_records(JobType::WillUpload)?;
        Ok(Self::with_registered_wills(&wills))
    }

    fn with_registered_wills(wills: &[Record]) -> Self {
        let mut registry = Self::new();
        registry.register(
            JobType::WillUpload,
            Arc::new(
                DuplicateGuard::new(WillRecordValidator::default(), will::will_reference)
                    .with_existing_records(wills),
            ),
        );
        registry.register(JobType::SearchBatch, Arc::new(SearchRecordValidator));
        registry
    }

    pub fn register(&mut self, job_type: JobType, validator: Arc<dyn RecordValidator>) {
        self.validators.insert(job_type, validator);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn RecordValidator>> {
        self.validators.get(&job_type).cloned()
    }
}

/// Returns the trimmed string at `field` if present and non-empty.
pub(crate) fn text_field<'a>(record: &'a Record, field: &str) -> Option<&'a str> {
    record
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
