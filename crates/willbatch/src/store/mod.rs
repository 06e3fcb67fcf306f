pub mod job_store;

pub use crate::db::job_repo::JobFilter;
pub use job_store::JobStore;
