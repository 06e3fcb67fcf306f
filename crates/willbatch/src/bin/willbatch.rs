//! Runs one demo will upload end to end and prints its summary.
//!
//! Usage: `willbatch [config.json]`

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use log::{error, info};
use serde_json::json;

use willbatch::worker::format_summary;
use willbatch::{
    load_config, Database, EngineConfig, JobController, JobMonitor, JobProgressBroadcaster,
    JobStore, JobSubmission, JobType, Record, ValidatorRegistry, WillbatchError,
};

/// `batch_tag` keeps references unique across runs against the same database.
fn demo_records(batch_tag: i64, count: usize, invalid_row: usize) -> Vec<Record> {
    (1..=count)
        .map(|row| {
            if row == invalid_row {
                json!({ "testatorFirstName": "Unknown", "willDate": "2021-03-04" })
            } else {
                json!({
                    "testatorFirstName": format!("Testator{}", row),
                    "testatorLastName": "Example",
                    "dateOfBirth": "1950-06-15",
                    "willDate": "2019-11-02",
                    "willReference": format!("DEMO-{}-{:04}", batch_tag, row)
                })
            }
        })
        .collect()
}

async fn run(config: EngineConfig) -> Result<(), WillbatchError> {
    let db = match config.resolved_database_path() {
        Some(path) => Database::open(&path)?,
        None => {
            info!("No home directory found, using an in-memory database");
            Database::open_in_memory()?
        }
    };
    let store = JobStore::new(db);

    let progress = JobProgressBroadcaster::default();
    let mut events = progress.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(
                "[{}] {} ({}/{})",
                event.job_id, event.message, event.processed_records, event.total_records
            );
        }
    });

    let monitor = JobMonitor::new(store.clone(), config.preview_limit);
    let mut snapshots = monitor.subscribe();
    monitor.start(Duration::from_millis(config.monitor_interval_ms));
    tokio::spawn(async move {
        while let Ok(summary) = snapshots.recv().await {
            info!(
                "{} active ({} more not shown)",
                summary.active_count, summary.overflow
            );
        }
    });

    let validators = ValidatorRegistry::from_store(&store)?;
    let controller = JobController::from_config(store, validators, &config, Some(progress));

    let submission = JobSubmission::new(
        JobType::WillUpload,
        "FIRM_DEMO",
        "USER_DEMO",
        "demo-wills.csv",
        demo_records(chrono::Utc::now().timestamp(), 25, 17),
    );
    let job = controller.submit(&submission)?;
    let job = controller.run(&job.id).await?;

    monitor.stop();
    info!("{}", format_summary(&job));
    for err in &job.errors {
        info!("  row {}: {}", err.row, err.reason);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => match load_config(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => EngineConfig::default(),
    };

    if let Err(e) = willbatch::logging::init(&config.logging) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
