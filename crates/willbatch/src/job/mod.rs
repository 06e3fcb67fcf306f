//! Persisted shape of a bulk-operation job.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single source record as submitted (one CSV row / one JSON object).
pub type Record = serde_json::Value;

/// Kind of bulk operation a job performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    WillUpload,
    SearchBatch,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::WillUpload => "will-upload",
            JobType::SearchBatch => "search-batch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "will-upload" => Some(JobType::WillUpload),
            "search-batch" => Some(JobType::SearchBatch),
            _ => None,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a job. `Queued` and `Processing` are the only non-terminal states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Queued, JobStatus::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "complete" => Some(JobStatus::Complete),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Processing)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed record. `row` is the record's 1-based row in the upload it
/// first arrived in, so rows of a retry job point back at the original file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordError {
    pub row: usize,
    pub reason: String,
    pub data: Record,
}

/// One line of a job's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Inbound request to start a bulk job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub firm_id: String,
    pub user_id: String,
    pub file_name: String,
    pub records: Vec<Record>,
    /// Set when the submission re-queues rows from an earlier job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
    /// Original upload row of each record. Empty means rows `1..=n`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_rows: Vec<usize>,
}

impl JobSubmission {
    pub fn new(
        job_type: JobType,
        firm_id: &str,
        user_id: &str,
        file_name: &str,
        records: Vec<Record>,
    ) -> Self {
        Self {
            job_type,
            firm_id: firm_id.to_string(),
            user_id: user_id.to_string(),
            file_name: file_name.to_string(),
            records,
            retry_of: None,
            source_rows: Vec::new(),
        }
    }

    /// Row in the original upload of the record at 0-based `index`.
    pub fn source_row(&self, index: usize) -> usize {
        self.source_rows.get(index).copied().unwrap_or(index + 1)
    }
}

/// A stored source record read back for processing.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// 1-based position within this job.
    pub position: usize,
    /// 1-based row in the original upload.
    pub row: usize,
    pub data: Record,
}

/// A tracked bulk job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub firm_id: String,
    pub user_id: String,
    pub file_name: String,
    pub total_records: usize,
    pub processed_records: usize,
    pub successful_records: usize,
    pub failed_records: usize,
    pub batch_size: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub errors: Vec<RecordError>,
    /// Top-level processing failure, distinct from per-row errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub can_cancel: bool,
    pub can_retry: bool,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
    pub activity: Vec<ActivityEntry>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Records not yet processed by any batch.
    pub fn unprocessed_records(&self) -> usize {
        self.total_records - self.processed_records
    }

    /// Percentage of records processed, 0-100.
    pub fn progress_percent(&self) -> u8 {
        if self.total_records == 0 {
            return if self.is_terminal() { 100 } else { 0 };
        }
        ((self.processed_records * 100) / self.total_records) as u8
    }

    /// Recomputes the derived control flags from status and counters.
    pub fn refresh_flags(&mut self) {
        self.can_cancel = self.status.is_active();
        self.can_retry = matches!(self.status, JobStatus::Failed | JobStatus::Cancelled)
            && (self.failed_records > 0 || self.unprocessed_records() > 0);
    }
}

/// Merge-patch over a job's mutable progress fields.
///
/// `None` leaves a field untouched; errors and activity are appended, never replaced.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub processed_records: Option<usize>,
    pub successful_records: Option<usize>,
    pub failed_records: Option<usize>,
    pub current_batch: Option<usize>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub append_errors: Vec<RecordError>,
    pub append_activity: Vec<String>,
}

impl JobPatch {
    pub fn activity(message: impl Into<String>) -> Self {
        Self {
            append_activity: vec![message.into()],
            ..Default::default()
        }
    }
}

/// `ceil(total / batch_size)`; zero records means zero batches.
pub fn total_batches(total_records: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        return 0;
    }
    total_records.div_ceil(batch_size)
}
