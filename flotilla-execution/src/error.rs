//! Error types for pool construction, launching and orchestration

use flotilla_config::ConfigError;
use flotilla_core::ClosedError;
use flotilla_ipc::IpcError;
use flotilla_resilience::AggregateError;
use thiserror::Error;

/// A launcher failed to start a process or job
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Job submission with '{program}' failed ({status}): {stderr}")]
    Submission {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Launch I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode launch job: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid launch job: {0}")]
    InvalidJob(String),

    #[error("Launcher configuration error: {0}")]
    Configuration(String),
}

/// Errors of the execution layer
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("IPC error: {0}")]
    IpcError(#[from] IpcError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigError),

    #[error("Launch error: {0}")]
    LaunchError(#[from] LaunchError),

    #[error(transparent)]
    Closed(#[from] ClosedError),

    #[error(transparent)]
    Shutdown(#[from] AggregateError),

    #[error("Worker registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Failed to read task list: {0}")]
    ManifestError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Worker error: {0}")]
    WorkerError(String),
}

impl ExecutionError {
    /// Whether the error comes from an unreachable pool or worker
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, ExecutionError::IpcError(e) if e.is_connection_loss())
    }
}
