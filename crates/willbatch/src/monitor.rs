//! Live "N active" view over the job store.
//!
//! Snapshots are pull-based; [`JobMonitor::start`] adds a polling task that
//! pushes them to subscribers.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::job::{Job, JobStatus, JobType};
use crate::store::JobStore;

/// Condensed view of one active job.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJobPreview {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub firm_id: String,
    pub file_name: String,
    pub status: JobStatus,
    pub processed_records: usize,
    pub total_records: usize,
    pub progress_percent: u8,
}

impl From<&Job> for ActiveJobPreview {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            job_type: job.job_type,
            firm_id: job.firm_id.clone(),
            file_name: job.file_name.clone(),
            status: job.status,
            processed_records: job.processed_records,
            total_records: job.total_records,
            progress_percent: job.progress_percent(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJobsSummary {
    pub active_count: usize,
    /// Most recently submitted active jobs first.
    pub preview: Vec<ActiveJobPreview>,
    /// Active jobs not shown in `preview`.
    pub overflow: usize,
    pub taken_at: DateTime<Utc>,
}

pub struct JobMonitor {
    store: JobStore,
    preview_limit: usize,
    sender: broadcast::Sender<ActiveJobsSummary>,
    poller: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl JobMonitor {
    pub fn new(store: JobStore, preview_limit: usize) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            store,
            preview_limit,
            sender,
            poller: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> Result<ActiveJobsSummary, JobError> {
        take_snapshot(&self.store, self.preview_limit)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActiveJobsSummary> {
        self.sender.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.poller
            .lock()
            .map(|p| p.is_some())
            .unwrap_or(false)
    }

    /// Publishes a snapshot every `interval` until [`stop`](Self::stop).
    /// Restarting replaces the running poller.
    pub fn start(&self, interval: Duration) {
        self.stop();

        let token = CancellationToken::new();
        let child = token.clone();
        let store = self.store.clone();
        let preview_limit = self.preview_limit;
        let sender = self.sender.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match take_snapshot(&store, preview_limit) {
                    Ok(summary) => {
                        // No active receivers is fine
                        let _ = sender.send(summary);
                    }
                    Err(e) => warn!("Job monitor snapshot failed: {}", e),
                }
            }
            debug!("Job monitor stopped");
        });

        if let Ok(mut poller) = self.poller.lock() {
            *poller = Some((token, handle));
        }
    }

    pub fn stop(&self) {
        let previous = self.poller.lock().ok().and_then(|mut p| p.take());
        if let Some((token, _handle)) = previous {
            token.cancel();
        }
    }
}

fn take_snapshot(store: &JobStore, preview_limit: usize) -> Result<ActiveJobsSummary, JobError> {
    let (active_count, recent) = store.active_summary(preview_limit)?;
    let preview: Vec<ActiveJobPreview> = recent.iter().map(ActiveJobPreview::from).collect();
    let overflow = active_count.saturating_sub(preview.len());

    Ok(ActiveJobsSummary {
        active_count,
        preview,
        overflow,
        taken_at: Utc::now(),
    })
}

impl Drop for JobMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
