//! Worker-process side of a remote worker
//!
//! A [`RemoteWorkerServer`] serves `RunSerialized` requests on an ephemeral
//! port and shuts itself down when it has been idle for a whole
//! `idle_timeout` window, or when the pool asks it to close.

use async_trait::async_trait;
use flotilla_core::RunError;
use flotilla_ipc::{
    decode_payload, encode_payload, run_single_rpc, IpcError, RemoteError, RpcHandler, RpcReply,
    RpcRequest, RpcServer, ServerOptions, WorkerStatus,
};
use flotilla_resilience::{Scope, Scoped};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::task::{TaskInvocation, TaskOutcome};
use crate::worker::Worker;

#[derive(Debug, Clone)]
pub struct RemoteWorkerOptions {
    pub idle_timeout: Duration,
    /// Timeout of the registration call to the pool
    pub rpc_timeout: Duration,
    pub server: ServerOptions,
}

impl Default for RemoteWorkerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            rpc_timeout: Duration::from_secs(10),
            server: ServerOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Running,
    Closed,
}

struct ServerShared {
    worker: Arc<dyn Worker>,
    running: AtomicUsize,
    has_run_since_last_check: AtomicBool,
    closing: AtomicBool,
    status: Mutex<WorkerStatus>,
    close_requested: watch::Sender<bool>,
}

/// Counts a task as running until dropped, also when the request is
/// cancelled by a dropped connection
struct RunningGuard<'a>(&'a ServerShared);

impl<'a> RunningGuard<'a> {
    fn enter(shared: &'a ServerShared) -> Self {
        shared.running.fetch_add(1, Ordering::SeqCst);
        shared.has_run_since_last_check.store(true, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.has_run_since_last_check.store(true, Ordering::SeqCst);
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ServerShared {
    async fn run_serialized(&self, correlation_id: Uuid, payload: &str) -> RpcReply {
        if self.closing.load(Ordering::SeqCst) {
            return RpcReply::error(correlation_id, RemoteError::Closed);
        }

        let _running = RunningGuard::enter(self);
        self.execute(correlation_id, payload).await
    }

    async fn execute(&self, correlation_id: Uuid, payload: &str) -> RpcReply {
        let task = match decode_payload(payload)
            .and_then(|bytes| TaskInvocation::from_bytes(&bytes).map_err(IpcError::from))
        {
            Ok(task) => task,
            Err(e) => {
                warn!("Could not decode task: {}", e);
                return RpcReply::error(
                    correlation_id,
                    RemoteError::PayloadDecodeFailed { error: e.to_string() },
                );
            }
        };

        let outcome = match self.worker.run(&task).await {
            Ok(value) => TaskOutcome::Succeeded { value },
            Err(RunError::Task(error)) => TaskOutcome::Failed { error },
            Err(RunError::Closed(_)) => return RpcReply::error(correlation_id, RemoteError::Closed),
            Err(e @ RunError::WorkerDisabled(_)) => TaskOutcome::Failed {
                error: flotilla_core::TaskError::new(e.to_string()),
            },
        };
        self.status
            .lock()
            .record_task_execution(matches!(outcome, TaskOutcome::Succeeded { .. }));

        match serde_json::to_vec(&outcome) {
            Ok(bytes) => RpcReply::RunCompleted {
                correlation_id,
                payload: encode_payload(&bytes),
            },
            Err(e) => RpcReply::error(
                correlation_id,
                RemoteError::PayloadDecodeFailed {
                    error: format!("failed to encode task outcome: {}", e),
                },
            ),
        }
    }
}

struct WorkerRpcHandler {
    shared: Arc<ServerShared>,
}

#[async_trait]
impl RpcHandler for WorkerRpcHandler {
    async fn handle(&self, request: RpcRequest) -> RpcReply {
        let correlation_id = request.correlation_id();
        match request {
            RpcRequest::RunSerialized { payload, .. } => {
                self.shared.run_serialized(correlation_id, &payload).await
            }
            RpcRequest::Ping { .. } => {
                let status = self.shared.status.lock().clone();
                RpcReply::Pong {
                    correlation_id,
                    status,
                }
            }
            RpcRequest::Close { .. } => {
                info!("Close requested by the pool");
                self.shared.close_requested.send_replace(true);
                RpcReply::Ack { correlation_id }
            }
            other => RpcReply::error(
                correlation_id,
                RemoteError::UnsupportedRequest {
                    request: other.kind().to_string(),
                },
            ),
        }
    }
}

/// Closes the server on request or after a full idle window
async fn watchdog(shared: Arc<ServerShared>, scope: Arc<Scope>, idle_timeout: Duration) {
    let mut close_rx = shared.close_requested.subscribe();
    let closed = scope.closed_signal();

    loop {
        tokio::select! {
            _ = close_rx.wait_for(|requested| *requested) => break,
            _ = closed.wait() => return,
            _ = tokio::time::sleep(idle_timeout) => {
                if shared.running.load(Ordering::SeqCst) > 0 {
                    continue;
                }
                if shared.has_run_since_last_check.swap(false, Ordering::SeqCst) {
                    continue;
                }
                info!("No task received for {:?}, shutting down", idle_timeout);
                break;
            }
        }
    }

    if let Err(e) = scope.close().await {
        warn!("Remote worker shut down with errors: {}", e);
    }
}

/// RPC server running tasks on a local worker
pub struct RemoteWorkerServer {
    shared: Arc<ServerShared>,
    rpc: Arc<RpcServer>,
    scope: Arc<Scope>,
}

impl RemoteWorkerServer {
    /// Bind the listener and start the idle watchdog
    pub async fn start(
        worker: Arc<dyn Worker>,
        options: &RemoteWorkerOptions,
    ) -> Result<Self, ExecutionError> {
        let (close_requested, _) = watch::channel(false);
        let shared = Arc::new(ServerShared {
            status: Mutex::new(WorkerStatus::new(worker.name().to_string(), std::process::id())),
            worker,
            running: AtomicUsize::new(0),
            has_run_since_last_check: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            close_requested,
        });

        let handler = Arc::new(WorkerRpcHandler {
            shared: shared.clone(),
        });
        let rpc = Arc::new(RpcServer::bind(options.server.clone(), handler).await?);
        let scope = Arc::new(Scope::new(format!("remote worker server {}", rpc.local_addr())));

        // Exit actions run last-in first-out: refuse new tasks, answer the
        // in-flight ones, then close the worker.
        let worker = shared.worker.clone();
        let _ = scope.on_exit(move || async move {
            worker.close().await?;
            Ok(())
        });
        let server = rpc.clone();
        let _ = scope.on_exit(move || async move {
            server.stop().await;
            Ok(())
        });
        let flag = shared.clone();
        let _ = scope.on_exit_sync(move || {
            flag.closing.store(true, Ordering::SeqCst);
            Ok(())
        });

        tokio::spawn(watchdog(shared.clone(), scope.clone(), options.idle_timeout));
        info!(
            endpoints = %rpc.endpoint_strings().join(" "),
            idle_timeout = ?options.idle_timeout,
            "Remote worker listening"
        );

        Ok(Self { shared, rpc, scope })
    }

    /// `tcp://host:port` endpoints of this server
    pub fn endpoints(&self) -> Vec<String> {
        self.rpc.endpoint_strings()
    }

    pub fn state(&self) -> ServerState {
        if self.shared.closing.load(Ordering::SeqCst) || self.scope.is_closing() {
            ServerState::Closed
        } else if self.shared.running.load(Ordering::SeqCst) > 0 {
            ServerState::Running
        } else {
            ServerState::Idle
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.status.lock().clone()
    }

    /// Drop every connection at once, as if the process had died
    pub fn abort(&self) {
        self.rpc.abort();
    }

    /// Announce this server to a pool
    pub async fn register_with_pool<S: AsRef<str>>(
        &self,
        pool_endpoints: &[S],
        timeout: Duration,
    ) -> Result<(), ExecutionError> {
        let request = RpcRequest::register_remote_worker(self.endpoints());
        match run_single_rpc(pool_endpoints, request, timeout).await {
            Ok(RpcReply::Ack { .. }) => {
                debug!("Registered with pool");
                Ok(())
            }
            Ok(other) => Err(ExecutionError::RegistrationFailed(format!(
                "unexpected reply: {:?}",
                other
            ))),
            Err(IpcError::Remote(e)) => Err(ExecutionError::RegistrationFailed(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

impl Scoped for RemoteWorkerServer {
    fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl std::fmt::Debug for RemoteWorkerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteWorkerServer")
            .field("endpoints", &self.endpoints())
            .field("state", &self.state())
            .finish()
    }
}

/// Serve `worker` for the pool at `pool_endpoints` until the server closes
pub async fn run_remote_worker<S: AsRef<str>>(
    worker: Arc<dyn Worker>,
    pool_endpoints: &[S],
    options: &RemoteWorkerOptions,
) -> Result<(), ExecutionError> {
    let server = RemoteWorkerServer::start(worker, options).await?;
    if let Err(e) = server.register_with_pool(pool_endpoints, options.rpc_timeout).await {
        warn!("Could not register with pool: {}", e);
        server.close().await?;
        return Err(e);
    }

    server.closed().wait().await;
    info!("Remote worker finished");
    Ok(())
}
