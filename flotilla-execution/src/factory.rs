//! Builds a worker pool with its workers already launched

use flotilla_config::{CommandTemplate, DistributionConfig};
use flotilla_ipc::ServerOptions;
use flotilla_resilience::{Scope, Scoped};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ExecutionError;
use crate::launcher::{LaunchHandle, LaunchJob, Launcher, RemoteWorkerJob};
use crate::pool::PoolOptions;
use crate::rpc_pool::RpcWorkerPool;

/// A pool together with the handles of the workers launched for it.
///
/// Closing it closes the pool, which sends every registered worker a close
/// request, then waits for the workers running in this process.
pub struct DistributedPool {
    pool: Arc<RpcWorkerPool>,
    handles: Arc<Mutex<Vec<LaunchHandle>>>,
    scope: Scope,
}

impl DistributedPool {
    fn new(pool: RpcWorkerPool, grace: Duration) -> Self {
        let pool = Arc::new(pool);
        let handles: Arc<Mutex<Vec<LaunchHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new("distributed pool");

        let launched = handles.clone();
        let _ = scope.on_exit(move || async move {
            let handles = std::mem::take(&mut *launched.lock());
            wait_in_process(handles, grace).await;
            Ok(())
        });
        // Workers only exit once the pool has told them to
        let closing_pool = pool.clone();
        let _ = scope.on_exit(move || async move {
            closing_pool.close().await?;
            Ok(())
        });

        Self {
            pool,
            handles,
            scope,
        }
    }

    fn push(&self, handle: LaunchHandle) {
        self.handles.lock().push(handle);
    }

    /// Number of launches made for this pool
    pub fn launched(&self) -> usize {
        self.handles.lock().len()
    }
}

async fn wait_in_process(handles: Vec<LaunchHandle>, grace: Duration) {
    for handle in handles {
        if let LaunchHandle::InProcess(mut task) = handle {
            match tokio::time::timeout(grace, &mut task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("In-process worker failed: {}", e),
                Ok(Err(e)) => warn!("In-process worker panicked: {}", e),
                Err(_) => {
                    warn!("In-process worker still running after {:?}, aborting it", grace);
                    task.abort();
                }
            }
        }
    }
}

impl Deref for DistributedPool {
    type Target = RpcWorkerPool;

    fn deref(&self) -> &RpcWorkerPool {
        &self.pool
    }
}

impl Scoped for DistributedPool {
    fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl std::fmt::Debug for DistributedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedPool")
            .field("pool", &self.pool)
            .field("launched", &self.launched())
            .finish()
    }
}

/// Creates pools and launches their workers
#[derive(Debug, Clone)]
pub struct DistributedPoolFactory {
    distribution: DistributionConfig,
    command: Option<CommandTemplate>,
}

impl DistributedPoolFactory {
    pub fn new(distribution: DistributionConfig) -> Self {
        Self {
            distribution,
            command: None,
        }
    }

    /// Template of the `command` operation handed to every worker
    pub fn with_command(mut self, command: Option<CommandTemplate>) -> Self {
        self.command = command;
        self
    }

    fn server_options(&self) -> ServerOptions {
        ServerOptions {
            bind_address: self.distribution.bind_address.clone(),
            advertise_host: self.distribution.advertise_host.clone(),
            heartbeat_interval: self.distribution.heartbeat_interval(),
        }
    }

    /// Bind the pool and launch its workers. On any launch failure the pool
    /// is closed before the error is returned.
    pub async fn create(
        &self,
        options: PoolOptions,
        remote: &dyn Launcher,
        local: &dyn Launcher,
    ) -> Result<DistributedPool, ExecutionError> {
        let rpc_pool =
            RpcWorkerPool::bind(options, self.server_options(), self.distribution.rpc_timeout).await?;
        let pool = DistributedPool::new(rpc_pool, self.distribution.rpc_timeout);

        if let Err(e) = self.launch_workers(&pool, remote, local).await {
            warn!("Worker launch failed, closing pool: {}", e);
            if let Err(close_error) = pool.close().await {
                warn!("Pool closed with errors: {}", close_error);
            }
            return Err(e);
        }
        Ok(pool)
    }

    async fn launch_workers(
        &self,
        pool: &DistributedPool,
        remote: &dyn Launcher,
        local: &dyn Launcher,
    ) -> Result<(), ExecutionError> {
        let job = LaunchJob::RemoteWorker(RemoteWorkerJob::new(
            pool.endpoints(),
            &self.distribution,
            self.command.clone(),
        ));

        if self.distribution.launches_local_worker() {
            pool.push(local.launch(job.clone()).await?);
        }
        let remote_count = self.distribution.remote_worker_count();
        for _ in 0..remote_count {
            pool.push(remote.launch(job.clone()).await?);
        }

        info!(
            local = self.distribution.launches_local_worker(),
            remote = remote_count,
            launcher = remote.name(),
            "Launched workers"
        );
        Ok(())
    }
}
