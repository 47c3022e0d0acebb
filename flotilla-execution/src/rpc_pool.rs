//! Worker pool reachable over RPC
//!
//! Remote workers join by calling `RegisterRemoteWorker` with their own
//! endpoints; the query tool polls `DescribeMappedJobs`.

use async_trait::async_trait;
use flotilla_core::{ClosedError, TaskSnapshot};
use flotilla_ipc::{RemoteError, RpcHandler, RpcReply, RpcRequest, RpcServer, ServerOptions, WorkerStatus};
use flotilla_resilience::{Scope, Scoped};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ExecutionError;
use crate::pool::{PoolOptions, WorkerPool};
use crate::proxy::RemoteWorkerProxy;
use crate::task::{TaskInvocation, TaskResult};
use crate::worker::Worker;

struct PoolRpcHandler {
    pool: Arc<WorkerPool>,
    rpc_timeout: Duration,
}

impl PoolRpcHandler {
    async fn register(&self, endpoints: &[String]) -> Result<(), ExecutionError> {
        let proxy = Arc::new(RemoteWorkerProxy::connect(endpoints, self.rpc_timeout).await?);
        if let Err(e) = self.pool.register_worker(proxy.clone()) {
            if let Err(close_error) = proxy.close().await {
                warn!("Failed to close rejected worker: {}", close_error);
            }
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl RpcHandler for PoolRpcHandler {
    async fn handle(&self, request: RpcRequest) -> RpcReply {
        let correlation_id = request.correlation_id();
        match request {
            RpcRequest::RegisterRemoteWorker { endpoints, .. } => {
                info!(endpoints = %endpoints.join(" "), "Remote worker registering");
                match self.register(&endpoints).await {
                    Ok(()) => RpcReply::Ack { correlation_id },
                    Err(e) => {
                        warn!("Rejected remote worker: {}", e);
                        RpcReply::error(
                            correlation_id,
                            RemoteError::RegistrationFailed { error: e.to_string() },
                        )
                    }
                }
            }
            RpcRequest::DescribeMappedJobs { .. } => RpcReply::MappedJobs {
                correlation_id,
                batches: self.pool.describe_mapped_jobs(),
            },
            RpcRequest::Ping { .. } => RpcReply::Pong {
                correlation_id,
                status: WorkerStatus::new("pool".to_string(), std::process::id()),
            },
            other => RpcReply::error(
                correlation_id,
                RemoteError::UnsupportedRequest {
                    request: other.kind().to_string(),
                },
            ),
        }
    }
}

/// [`WorkerPool`] plus the RPC server remote workers register with
pub struct RpcWorkerPool {
    pool: Arc<WorkerPool>,
    rpc: Arc<RpcServer>,
    scope: Scope,
}

impl RpcWorkerPool {
    pub async fn bind(
        options: PoolOptions,
        server: ServerOptions,
        rpc_timeout: Duration,
    ) -> Result<Self, ExecutionError> {
        let pool = Arc::new(WorkerPool::new(options));
        let handler = Arc::new(PoolRpcHandler {
            pool: pool.clone(),
            rpc_timeout,
        });
        let rpc = match RpcServer::bind(server, handler).await {
            Ok(rpc) => Arc::new(rpc),
            Err(e) => {
                pool.close().await?;
                return Err(e.into());
            }
        };

        // Stop taking registrations before the pool drains
        let scope = Scope::new("rpc worker pool");
        let closing_pool = pool.clone();
        let _ = scope.on_exit(move || async move {
            closing_pool.close().await?;
            Ok(())
        });
        let server = rpc.clone();
        let _ = scope.on_exit(move || async move {
            server.stop().await;
            Ok(())
        });

        info!(endpoints = %rpc.endpoint_strings().join(" "), "Worker pool accepting registrations");
        Ok(Self { pool, rpc, scope })
    }

    /// `tcp://host:port` endpoints remote workers register with
    pub fn endpoints(&self) -> Vec<String> {
        self.rpc.endpoint_strings()
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn register_worker(&self, worker: Arc<dyn Worker>) -> Result<(), ClosedError> {
        self.pool.register_worker(worker)
    }

    pub async fn map(
        &self,
        operation: &str,
        items: Vec<JsonValue>,
    ) -> Result<Vec<TaskResult>, ClosedError> {
        self.pool.map(operation, items).await
    }

    pub async fn map_invocations(
        &self,
        tasks: Vec<TaskInvocation>,
    ) -> Result<Vec<TaskResult>, ClosedError> {
        self.pool.map_invocations(tasks).await
    }

    pub fn describe_mapped_jobs(&self) -> Vec<Vec<TaskSnapshot>> {
        self.pool.describe_mapped_jobs()
    }
}

impl Scoped for RpcWorkerPool {
    fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl std::fmt::Debug for RpcWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcWorkerPool")
            .field("endpoints", &self.endpoints())
            .field("pool", &self.pool)
            .finish()
    }
}
