//! Job progress broadcaster for streaming batch updates to observers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{Job, JobStatus};

/// Progress event for a job, emitted after every state-changing step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    pub file_name: String,
    pub status: JobStatus,
    pub processed_records: usize,
    pub successful_records: usize,
    pub failed_records: usize,
    pub total_records: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    /// Human-readable message describing the step.
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Job-level failure (set when the job itself failed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl JobProgressEvent {
    /// Builds an event from a job snapshot.
    pub fn from_job(job: &Job, message: &str) -> Self {
        Self {
            job_id: job.id.clone(),
            file_name: job.file_name.clone(),
            status: job.status,
            processed_records: job.processed_records,
            successful_records: job.successful_records,
            failed_records: job.failed_records,
            total_records: job.total_records,
            current_batch: job.current_batch,
            total_batches: job.total_batches,
            message: message.to_string(),
            timestamp: Utc::now(),
            failure: job.failure.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    /// Creates a new job progress broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: JobProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    /// Publishes the current state of `job`.
    pub fn publish(&self, job: &Job, message: &str) {
        self.send(JobProgressEvent::from_job(job, message));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobSubmission, JobType};
    use crate::store::JobStore;
    use serde_json::json;

    fn sample_job() -> Job {
        let store = JobStore::in_memory().unwrap();
        let submission = JobSubmission::new(
            JobType::SearchBatch,
            "firm-1",
            "user-1",
            "search.csv",
            vec![json!({ "lastName": "Smith" }); 3],
        );
        store.create_job(&submission, 2).unwrap()
    }

    #[test]
    fn test_broadcaster_send_receive() {
        let broadcaster = JobProgressBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();
        let job = sample_job();

        broadcaster.publish(&job, "Job submitted");

        let received = rx.try_recv().unwrap();
        assert_eq!(received.job_id, job.id);
        assert_eq!(received.file_name, "search.csv");
        assert_eq!(received.status, JobStatus::Queued);
        assert_eq!(received.total_records, 3);
        assert_eq!(received.total_batches, 2);
        assert!(!received.is_terminal());
    }

    #[test]
    fn test_send_without_receivers() {
        let broadcaster = JobProgressBroadcaster::default();
        assert_eq!(broadcaster.receiver_count(), 0);
        broadcaster.publish(&sample_job(), "nobody listening");
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = JobProgressEvent::from_job(&sample_job(), "x");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["status"], "queued");
        assert_eq!(value["processedRecords"], 0);
        assert!(value.get("failure").is_none());
    }
}
