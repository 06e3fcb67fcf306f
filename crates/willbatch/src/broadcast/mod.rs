//! Broadcasting of job events to live observers.

pub mod job_progress;

pub use job_progress::{JobProgressBroadcaster, JobProgressEvent};
