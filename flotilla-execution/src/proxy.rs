//! Pool-side handle of a worker living in another process

use async_trait::async_trait;
use flotilla_core::{ClosedError, RunError, TaskError, WorkerDisabledError};
use flotilla_ipc::{decode_payload, IpcError, RemoteError, RpcClient, RpcReply, RpcRequest, WorkerStatus};
use flotilla_resilience::{Scope, Scoped};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ExecutionError;
use crate::task::{TaskInvocation, TaskOutcome};
use crate::worker::Worker;

/// Forwards tasks to a remote worker server over RPC.
///
/// Losing the connection, or the server going silent for longer than the
/// RPC timeout, disables the worker instead of failing the task.
pub struct RemoteWorkerProxy {
    name: String,
    client: Arc<Mutex<RpcClient>>,
    scope: Scope,
}

impl RemoteWorkerProxy {
    /// Connect to the first reachable endpoint
    pub async fn connect<S: AsRef<str>>(
        endpoints: &[S],
        timeout: Duration,
    ) -> Result<Self, ExecutionError> {
        let client = RpcClient::connect_str(endpoints, timeout).await?;
        let name = client.endpoint().authority();
        let client = Arc::new(Mutex::new(client));
        let scope = Scope::new(format!("remote worker {}", name));

        // Exit actions run last-in first-out: the close request goes out
        // before the connection is dropped.
        let transport = client.clone();
        let _ = scope.on_exit(move || async move {
            transport.lock().await.disconnect().await;
            Ok(())
        });
        let remote = client.clone();
        let worker = name.clone();
        let _ = scope.on_exit(move || async move {
            let mut client = remote.lock().await;
            if client.is_connected() {
                // Best effort: an unreachable worker stops on its idle timeout
                if let Err(e) = client.call(RpcRequest::close()).await {
                    debug!(worker = %worker, "Close request failed: {}", e);
                }
            }
            Ok(())
        });

        info!(worker = %name, "Connected to remote worker");
        Ok(Self { name, client, scope })
    }

    /// Status counters reported by the remote worker
    pub async fn ping(&self) -> Result<WorkerStatus, ExecutionError> {
        match self.client.lock().await.call(RpcRequest::ping()).await? {
            RpcReply::Pong { status, .. } => Ok(status),
            other => Err(ExecutionError::WorkerError(format!(
                "unexpected reply to ping: {:?}",
                other
            ))),
        }
    }

    fn disabled(&self, reason: impl std::fmt::Display) -> RunError {
        WorkerDisabledError::new(self.name.clone(), reason.to_string()).into()
    }
}

fn decode_outcome(payload: &str) -> Result<TaskOutcome, TaskError> {
    let bytes = decode_payload(payload)
        .map_err(|e| TaskError::new(format!("undecodable task outcome: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| TaskError::new(format!("undecodable task outcome: {}", e)))
}

impl Scoped for RemoteWorkerProxy {
    fn scope(&self) -> &Scope {
        &self.scope
    }
}

#[async_trait]
impl Worker for RemoteWorkerProxy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, task: &TaskInvocation) -> Result<JsonValue, RunError> {
        if self.scope.is_closing() {
            return Err(ClosedError::new("remote worker").into());
        }
        let payload = task
            .to_bytes()
            .map_err(|e| TaskError::new(format!("failed to encode task: {}", e)))?;

        let reply = self
            .client
            .lock()
            .await
            .call(RpcRequest::run_serialized(&payload))
            .await;

        match reply {
            Ok(RpcReply::RunCompleted { payload, .. }) => {
                Ok(decode_outcome(&payload)?.into_result()?)
            }
            Ok(other) => Err(TaskError::new(format!("unexpected reply to run request: {:?}", other)).into()),
            Err(IpcError::Remote(RemoteError::Closed)) => Err(self.disabled("worker is shutting down")),
            Err(e) if e.is_connection_loss() || e.is_fatal() => Err(self.disabled(e)),
            Err(e) => Err(TaskError::new(format!("remote worker {} rejected the task: {}", self.name, e)).into()),
        }
    }
}

impl std::fmt::Debug for RemoteWorkerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteWorkerProxy")
            .field("name", &self.name)
            .field("closed", &self.scope.is_closed())
            .finish()
    }
}
