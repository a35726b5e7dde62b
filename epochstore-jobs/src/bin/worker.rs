//! Standalone worker process: opens a job database on disk and runs
//! a poll-claim-execute loop until told to stop.

use clap::Parser;
use epochstore_backends::HeedBackend;
use epochstore_jobs::{JobManager, Worker};
use std::{path::PathBuf, sync::Arc, time::Duration};

#[derive(Parser, Debug)]
#[command(about = "Claims and executes jobs from an epochstore job database")]
struct Args {
    /// Directory holding the job database's LMDB environments.
    #[arg(long)]
    db_path: PathBuf,

    /// How long to sleep between empty polls, in milliseconds.
    #[arg(long, default_value_t = 200)]
    polling_interval_ms: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let backend = Arc::new(HeedBackend::open(&args.db_path)?);
    let jobs = JobManager::open(backend);
    let worker = Worker::new(jobs, Duration::from_millis(args.polling_interval_ms));

    worker.run();
    Ok(())
}
