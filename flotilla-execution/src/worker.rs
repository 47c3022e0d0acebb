//! Workers: things that can run a task
//!
//! The pool only sees the [`Worker`] trait. [`LocalWorker`] runs tasks in
//! the calling process; the remote proxy forwards them over RPC.

use async_trait::async_trait;
use flotilla_core::{ClosedError, RunError};
use flotilla_ipc::WorkerStatus;
use flotilla_resilience::{Scope, Scoped};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::debug;

use crate::operations::OperationRegistry;
use crate::task::TaskInvocation;

/// A handle the pool can hand tasks to. Closing goes through [`Scoped`].
#[async_trait]
pub trait Worker: Scoped {
    /// Identity recorded in task attempts and run summaries
    fn name(&self) -> &str;

    /// Run one task. A [`RunError::WorkerDisabled`] takes the worker out of
    /// service; any other error only fails the task.
    async fn run(&self, task: &TaskInvocation) -> Result<JsonValue, RunError>;
}

/// Runs tasks directly through an operation registry
pub struct LocalWorker {
    name: String,
    registry: Arc<OperationRegistry>,
    status: Mutex<WorkerStatus>,
    scope: Scope,
}

impl LocalWorker {
    pub fn new(name: impl Into<String>, registry: Arc<OperationRegistry>) -> Self {
        let name = name.into();
        Self {
            status: Mutex::new(WorkerStatus::new(name.clone(), std::process::id())),
            scope: Scope::new(format!("worker {}", name)),
            name,
            registry,
        }
    }

    /// Counters of the tasks run so far
    pub fn status(&self) -> WorkerStatus {
        self.status.lock().clone()
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }
}

impl Scoped for LocalWorker {
    fn scope(&self) -> &Scope {
        &self.scope
    }
}

#[async_trait]
impl Worker for LocalWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, task: &TaskInvocation) -> Result<JsonValue, RunError> {
        if self.scope.is_closing() {
            return Err(ClosedError::new("worker").into());
        }

        debug!(worker = %self.name, operation = %task.operation, "Running task");
        let result = self.registry.run(task).await;
        self.status.lock().record_task_execution(result.is_ok());
        result.map_err(RunError::from)
    }
}

impl std::fmt::Debug for LocalWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWorker").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::TaskError;
    use serde_json::json;

    #[tokio::test]
    async fn test_local_worker_runs_and_counts() {
        let mut registry = OperationRegistry::with_builtins(None);
        registry.register_fn("fail", |_| Err(TaskError::new("bad input")));
        let worker = LocalWorker::new("local", Arc::new(registry));

        let value = worker.run(&TaskInvocation::new("echo", json!(1))).await.unwrap();
        assert_eq!(value, json!(1));

        let err = worker.run(&TaskInvocation::new("fail", json!(2))).await.unwrap_err();
        assert_eq!(err, RunError::Task(TaskError::new("bad input")));
        assert!(!err.disables_worker());

        let status = worker.status();
        assert_eq!(status.tasks_executed, 2);
        assert_eq!(status.tasks_failed, 1);
    }

    #[tokio::test]
    async fn test_closed_worker_rejects_tasks() {
        let worker = LocalWorker::new("local", Arc::new(OperationRegistry::with_builtins(None)));
        worker.close().await.unwrap();
        assert!(worker.closed().is_set());

        let err = worker.run(&TaskInvocation::new("echo", json!(1))).await.unwrap_err();
        assert!(matches!(err, RunError::Closed(_)));
    }
}
