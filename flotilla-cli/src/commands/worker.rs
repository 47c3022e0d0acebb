//! `flotilla worker` and the internal `flotilla run-job`

use anyhow::{Context, Result};
use flotilla_config::FlotillaConfig;
use flotilla_execution::launcher::RemoteWorkerJob;
use flotilla_execution::{LaunchJob, NodeRunner, OperationRegistry};
use std::time::Duration;
use tracing::info;

/// Operations known to every worker started by this binary. Jobs carry the
/// `command` template themselves.
fn runner() -> NodeRunner {
    NodeRunner::new(OperationRegistry::with_builtins(None))
}

pub struct WorkerArgs {
    pub pool: Vec<String>,
    pub idle_timeout: Option<u64>,
    pub bind_address: Option<String>,
    pub advertise_host: Option<String>,
}

/// The remote worker job a standalone `flotilla worker` runs
pub fn worker_job(mut config: FlotillaConfig, args: WorkerArgs) -> RemoteWorkerJob {
    if let Some(seconds) = args.idle_timeout {
        config.distribution.idle_timeout = Duration::from_secs(seconds);
    }
    if let Some(address) = args.bind_address {
        config.distribution.bind_address = address;
    }
    if args.advertise_host.is_some() {
        config.distribution.advertise_host = args.advertise_host;
    }
    RemoteWorkerJob::new(args.pool, &config.distribution, config.coordinator.command)
}

pub async fn worker_command(config: FlotillaConfig, args: WorkerArgs) -> Result<()> {
    let job = worker_job(config, args);
    info!(pool = %job.pool_endpoints.join(" "), idle_timeout = ?job.idle_timeout, "Starting standalone worker");
    runner()
        .run(LaunchJob::RemoteWorker(job))
        .await
        .context("Worker failed")
}

pub async fn run_job_command(encoded: &str) -> Result<()> {
    runner()
        .run_encoded(encoded)
        .await
        .context("Launch job failed")
}
