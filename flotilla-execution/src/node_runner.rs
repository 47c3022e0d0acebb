//! Runs launch jobs in the current process

use std::sync::Arc;

use flotilla_config::COMMAND_OPERATION;
use tracing::info;
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::executor::MasterWorkerExecutor;
use crate::launcher::LaunchJob;
use crate::operations::{CommandOperation, OperationRegistry};
use crate::output_dir::OutputDirStructure;
use crate::server::run_remote_worker;
use crate::worker::LocalWorker;

/// Entry point of every launched job, whichever launcher started it
#[derive(Debug, Clone)]
pub struct NodeRunner {
    registry: OperationRegistry,
}

impl NodeRunner {
    pub fn new(registry: OperationRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub async fn run(&self, job: LaunchJob) -> Result<(), ExecutionError> {
        match job {
            LaunchJob::RemoteWorker(job) => {
                let mut registry = self.registry.clone();
                if let Some(template) = job.command.clone() {
                    registry.register(COMMAND_OPERATION, CommandOperation::new(template));
                }
                let name = format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]);
                info!(worker = %name, pool = %job.pool_endpoints.join(" "), "Starting remote worker");

                let worker = Arc::new(LocalWorker::new(name, Arc::new(registry)));
                run_remote_worker(worker, &job.pool_endpoints, &job.options()).await
            }
            LaunchJob::Coordinator(job) => {
                info!(tasks = job.tasks.len(), output = %job.output_dir.display(), "Starting coordinator");
                let output = OutputDirStructure::open(job.output_dir);
                MasterWorkerExecutor::new(job.config)
                    .with_registry(self.registry.clone())
                    .coordinate(&output, job.tasks)
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Decode a job passed on the command line and run it
    pub async fn run_encoded(&self, encoded: &str) -> Result<(), ExecutionError> {
        let job = LaunchJob::decode(encoded)?;
        self.run(job).await
    }
}
