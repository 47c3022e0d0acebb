//! Flotilla execution layer
//!
//! Worker pool, local and remote workers, launchers and the master/worker
//! executor built on top of them.

pub mod error;
pub mod executor;
pub mod factory;
pub mod launcher;
pub mod master;
pub mod node_runner;
pub mod operations;
pub mod output_dir;
pub mod pool;
pub mod proxy;
pub mod query;
pub mod rpc_pool;
pub mod server;
pub mod summary;
pub mod task;
pub mod worker;

// Re-export main types
pub use error::{ExecutionError, LaunchError};
pub use executor::{MasterWorkerExecutor, RunReport, RESULTS_FILE};
pub use factory::{DistributedPool, DistributedPoolFactory};
pub use launcher::{
    build_launcher, InProcessLauncher, LaunchHandle, LaunchJob, LaunchOutcome, Launcher, SlurmLauncher,
    SubprocessLauncher, RUN_JOB_SUBCOMMAND,
};
pub use master::{ManifestMaster, Master, StaticMaster};
pub use node_runner::NodeRunner;
pub use operations::{Operation, OperationRegistry, ECHO_OPERATION};
pub use output_dir::OutputDirStructure;
pub use pool::{PoolOptions, WorkerPool};
pub use proxy::RemoteWorkerProxy;
pub use query::query_mapped_jobs;
pub use rpc_pool::RpcWorkerPool;
pub use server::{run_remote_worker, RemoteWorkerOptions, RemoteWorkerServer, ServerState};
pub use summary::{format_jobs_summary, format_listing, DisplayFilter, ListingOptions};
pub use task::{TaskInvocation, TaskOutcome, TaskResult};
pub use worker::{LocalWorker, Worker};
