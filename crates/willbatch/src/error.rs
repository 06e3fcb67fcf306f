use std::path::PathBuf;
use thiserror::Error;

use crate::job::JobStatus;

#[derive(Error, Debug)]
pub enum WillbatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

/// Errors surfaced to callers of the store and the lifecycle controller.
///
/// None of these mutate the job: a rejected operation leaves the stored
/// record exactly as it was.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Cannot {operation} job '{job_id}' while it is {status}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("Job '{0}' has already been finalized")]
    AlreadyFinalized(String),

    #[error("Batch size must be at least 1, got {0}")]
    InvalidBatchSize(usize),

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Invalid update for job '{job_id}': {reason}")]
    InvalidPatch { job_id: String, reason: String },

    #[error("No validator registered for job type '{0}'")]
    MissingValidator(crate::job::JobType),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

/// Unrecoverable, job-level fault. Aborts the run and marks the job failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("Source data unreadable: {0}")]
    UnreadableSource(String),

    #[error("Validation backend unavailable: {0}")]
    ValidatorUnavailable(String),

    #[error("Progress could not be stored: {0}")]
    ProgressNotStored(String),
}

pub type Result<T> = std::result::Result<T, WillbatchError>;
