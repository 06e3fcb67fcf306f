pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod logging;
pub mod monitor;
pub mod store;
pub mod validation;
pub mod worker;

pub use broadcast::{JobProgressBroadcaster, JobProgressEvent};
pub use config::{load_config, load_config_from_str, EngineConfig};
pub use db::{Database, DatabaseError};
pub use error::{ConfigError, JobError, ProcessingError, Result, WillbatchError};
pub use job::{
    Job, JobPatch, JobStatus, JobSubmission, JobType, Record, RecordError, SourceRecord,
};
pub use monitor::{ActiveJobPreview, ActiveJobsSummary, JobMonitor};
pub use store::{JobFilter, JobStore};
pub use validation::{
    DuplicateGuard, RecordContext, RecordValidator, SearchRecordValidator, Validation,
    ValidatorRegistry, WillRecordValidator,
};
pub use worker::{BatchDelay, BatchProcessor, JobController, NoDelay, TokioDelay};
