//! RPC protocol definitions and message types
//!
//! Every message travels inside a [`MessageEnvelope`] as one line of JSON.
//! Requests carry a correlation id that the matching reply echoes back.

use base64::Engine;
use chrono::{DateTime, Utc};
use flotilla_core::TaskSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::IpcError;

/// RPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Requests accepted by pool and worker endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcRequest {
    /// A remote worker announces the endpoints it listens on (served by pools)
    RegisterRemoteWorker {
        correlation_id: Uuid,
        endpoints: Vec<String>,
    },

    /// Snapshot of every batch mapped so far (served by pools)
    DescribeMappedJobs { correlation_id: Uuid },

    /// Run an encoded task and return the encoded outcome (served by workers)
    RunSerialized {
        correlation_id: Uuid,
        /// base64 of the serialized task
        payload: String,
    },

    /// Health check ping
    Ping { correlation_id: Uuid },

    /// Ask the remote side to shut down once this request is answered
    Close { correlation_id: Uuid },
}

impl RpcRequest {
    pub fn register_remote_worker(endpoints: Vec<String>) -> Self {
        RpcRequest::RegisterRemoteWorker {
            correlation_id: Uuid::new_v4(),
            endpoints,
        }
    }

    pub fn describe_mapped_jobs() -> Self {
        RpcRequest::DescribeMappedJobs {
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn run_serialized(payload: &[u8]) -> Self {
        RpcRequest::RunSerialized {
            correlation_id: Uuid::new_v4(),
            payload: encode_payload(payload),
        }
    }

    pub fn ping() -> Self {
        RpcRequest::Ping {
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn close() -> Self {
        RpcRequest::Close {
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        match self {
            RpcRequest::RegisterRemoteWorker { correlation_id, .. }
            | RpcRequest::DescribeMappedJobs { correlation_id }
            | RpcRequest::RunSerialized { correlation_id, .. }
            | RpcRequest::Ping { correlation_id }
            | RpcRequest::Close { correlation_id } => *correlation_id,
        }
    }

    /// Short name used in logs and error replies
    pub fn kind(&self) -> &'static str {
        match self {
            RpcRequest::RegisterRemoteWorker { .. } => "register_remote_worker",
            RpcRequest::DescribeMappedJobs { .. } => "describe_mapped_jobs",
            RpcRequest::RunSerialized { .. } => "run_serialized",
            RpcRequest::Ping { .. } => "ping",
            RpcRequest::Close { .. } => "close",
        }
    }
}

/// Replies sent back for each request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcReply {
    /// Request handled, nothing to return
    Ack { correlation_id: Uuid },

    /// Encoded outcome of a `RunSerialized` request
    RunCompleted {
        correlation_id: Uuid,
        payload: String,
    },

    /// One list of task snapshots per mapped batch
    MappedJobs {
        correlation_id: Uuid,
        batches: Vec<Vec<TaskSnapshot>>,
    },

    /// Health check response
    Pong {
        correlation_id: Uuid,
        status: WorkerStatus,
    },

    /// Sent periodically while a request is still being handled
    Heartbeat { correlation_id: Uuid },

    /// Request could not be handled
    Error {
        correlation_id: Option<Uuid>,
        error: RemoteError,
    },
}

impl RpcReply {
    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            RpcReply::Ack { correlation_id }
            | RpcReply::RunCompleted { correlation_id, .. }
            | RpcReply::MappedJobs { correlation_id, .. }
            | RpcReply::Pong { correlation_id, .. }
            | RpcReply::Heartbeat { correlation_id } => Some(*correlation_id),
            RpcReply::Error { correlation_id, .. } => *correlation_id,
        }
    }

    pub fn error(correlation_id: Uuid, error: RemoteError) -> Self {
        RpcReply::Error {
            correlation_id: Some(correlation_id),
            error,
        }
    }
}

/// Worker status information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub tasks_executed: u64,
    pub tasks_failed: u64,
}

impl WorkerStatus {
    /// Create a new worker status
    pub fn new(worker_id: String, pid: u32) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            pid,
            started_at: now,
            last_activity: now,
            tasks_executed: 0,
            tasks_failed: 0,
        }
    }

    /// Update activity timestamp
    pub fn update_activity(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Record task execution
    pub fn record_task_execution(&mut self, success: bool) {
        self.tasks_executed += 1;
        if !success {
            self.tasks_failed += 1;
        }
        self.update_activity();
    }
}

/// Errors reported by the remote side of a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum RemoteError {
    /// The endpoint does not serve this kind of request
    UnsupportedRequest { request: String },

    /// The request payload could not be decoded
    PayloadDecodeFailed { error: String },

    /// The endpoint is shutting down
    Closed,

    /// A worker could not be added to the pool
    RegistrationFailed { error: String },

    /// Message parse error
    MessageParseError { error: String },
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::UnsupportedRequest { request } => {
                write!(f, "Unsupported request: {}", request)
            }
            RemoteError::PayloadDecodeFailed { error } => {
                write!(f, "Payload decode failed: {}", error)
            }
            RemoteError::Closed => write!(f, "Remote endpoint is closed"),
            RemoteError::RegistrationFailed { error } => {
                write!(f, "Worker registration failed: {}", error)
            }
            RemoteError::MessageParseError { error } => {
                write!(f, "Message parse error: {}", error)
            }
        }
    }
}

impl std::error::Error for RemoteError {}

/// Message envelope for all RPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}

pub fn encode_payload(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_payload(payload: &str) -> Result<Vec<u8>, IpcError> {
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| IpcError::InvalidMessage(format!("payload is not base64: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = RpcRequest::register_remote_worker(vec!["tcp://10.0.0.1:5000".to_string()]);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "register_remote_worker");
        assert_eq!(json["endpoints"][0], "tcp://10.0.0.1:5000");
        assert_eq!(request.kind(), "register_remote_worker");
    }

    #[test]
    fn test_reply_correlation() {
        let request = RpcRequest::ping();
        let reply = RpcReply::error(request.correlation_id(), RemoteError::Closed);
        assert_eq!(reply.correlation_id(), Some(request.correlation_id()));

        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains(r#""error_type":"closed""#));
    }

    #[test]
    fn test_payload_encoding() {
        let request = RpcRequest::run_serialized(br#"{"operation":"echo"}"#);
        let RpcRequest::RunSerialized { payload, .. } = request else {
            panic!("unexpected request kind");
        };
        assert_eq!(decode_payload(&payload).unwrap(), br#"{"operation":"echo"}"#);
        assert!(decode_payload("not base64!").is_err());
    }

    #[test]
    fn test_worker_status() {
        let mut status = WorkerStatus::new("worker-1".to_string(), 12345);
        status.record_task_execution(true);
        status.record_task_execution(false);
        assert_eq!(status.tasks_executed, 2);
        assert_eq!(status.tasks_failed, 1);
    }

    #[test]
    fn test_message_envelope() {
        let envelope = MessageEnvelope::new(RpcRequest::close());
        assert!(envelope.is_compatible());

        let json = serde_json::to_string(&envelope).unwrap();
        let deserialized: MessageEnvelope<RpcRequest> = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.protocol_version, IPC_PROTOCOL_VERSION);
        assert!(matches!(deserialized.message, RpcRequest::Close { .. }));
    }
}
