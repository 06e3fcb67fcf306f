pub mod delay;
pub mod lifecycle;
pub mod processor;

pub use delay::{BatchDelay, NoDelay, TokioDelay};
pub use lifecycle::JobController;
pub use processor::{format_summary, BatchProcessor};
