//! Errors of the RPC layer

use thiserror::Error;

use crate::protocol::RemoteError;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be turned into a line of JSON
    #[error("Cannot encode message: {0}")]
    Encode(String),

    /// A received line is not a message of the expected shape
    #[error("Cannot decode message: {0}")]
    Decode(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Peer speaks protocol version {actual}, expected {expected}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("No reply within the RPC timeout")]
    Timeout,

    #[error("Peer replied with an error: {0}")]
    Remote(#[from] RemoteError),

    /// Well-formed JSON that breaks the request/reply contract
    #[error("Unexpected message: {0}")]
    InvalidMessage(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid endpoint '{0}', expected tcp://host:port")]
    InvalidEndpoint(String),

    #[error("No reachable endpoint among [{}]", .0.join(", "))]
    NoReachableEndpoint(Vec<String>),
}

impl IpcError {
    /// Errors after which the connection cannot be trusted any more
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::VersionMismatch { .. } | Self::InvalidMessage(_) | Self::InvalidEndpoint(_)
        )
    }

    /// The peer is gone or never answered
    pub fn is_connection_loss(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout | Self::ConnectionClosed | Self::NotConnected => true,
            Self::NoReachableEndpoint(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        use serde_json::error::Category;
        match err.classify() {
            Category::Io => Self::Io(err.into()),
            Category::Syntax | Category::Data | Category::Eof => Self::Decode(err.to_string()),
        }
    }
}
