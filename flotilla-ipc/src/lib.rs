//! Inter-process communication for Flotilla
//!
//! This crate provides the RPC protocol spoken between worker pools and
//! remote workers, the newline-delimited JSON transport it travels over, and
//! a small client/server pair built on top.

pub mod client;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use client::{run_single_rpc, RpcClient};
pub use endpoint::{advertised_endpoints, parse_endpoints, Endpoint};
pub use error::IpcError;
pub use protocol::{
    decode_payload, encode_payload, MessageEnvelope, RemoteError, RpcReply, RpcRequest,
    WorkerStatus, IPC_PROTOCOL_VERSION,
};
pub use server::{RpcHandler, RpcServer, ServerOptions, DEFAULT_HEARTBEAT_INTERVAL};
pub use transport::{IpcTransport, TcpTransport};
