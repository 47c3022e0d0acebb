//! Core error types for Flotilla
//!
//! Errors defined here end up inside [`ResultSlot`](crate::ResultSlot)s and are
//! observed by several readers, so they are cheap to clone and compare.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Operation attempted on a queue, scope or pool that was already closed.
///
/// Always a lifecycle error, never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{resource} is closed")]
pub struct ClosedError {
    pub resource: &'static str,
}

impl ClosedError {
    pub fn new(resource: &'static str) -> Self {
        Self { resource }
    }
}

/// A task payload failed at the application level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(message: impl Into<String>, details: JsonValue) -> Self {
        Self {
            message: message.into(),
            details: Some(details),
        }
    }
}

/// A worker could not be reached anymore (lost connection or RPC timeout).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("lost connection to worker {worker}: {reason}")]
pub struct WorkerDisabledError {
    pub worker: String,
    pub reason: String,
}

impl WorkerDisabledError {
    pub fn new(worker: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            reason: reason.into(),
        }
    }
}

/// Outcome of a failed attempt at running a task on a worker.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunError {
    /// The worker is gone; the task goes back to the queue and the worker
    /// leaves the pool.
    #[error(transparent)]
    WorkerDisabled(#[from] WorkerDisabledError),

    /// The task itself failed; the worker stays in service.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// The task could not be requeued because the pool was shutting down.
    #[error(transparent)]
    Closed(#[from] ClosedError),
}

impl RunError {
    /// Whether this failure takes the worker out of service
    pub fn disables_worker(&self) -> bool {
        matches!(self, RunError::WorkerDisabled(_))
    }

    /// Whether another attempt may be made on this task
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RunError::Closed(_))
    }
}
