//! IPC transport implementations

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::endpoint::Endpoint;
use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, IPC_PROTOCOL_VERSION};

/// IPC transport trait for different communication mechanisms
#[async_trait]
pub trait IpcTransport: Send + Sync {
    /// Send a message to the other end
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError>;

    /// Receive a message from the other end
    async fn receive<T: for<'de> Deserialize<'de> + Send>(
        &mut self,
    ) -> Result<MessageEnvelope<T>, IpcError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), IpcError>;
}

/// Newline-delimited JSON over a TCP connection
pub struct TcpTransport {
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
    peer: String,
}

impl TcpTransport {
    /// Wrap an established connection
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: Some(BufReader::new(read_half)),
            writer: Some(write_half),
            peer,
        }
    }

    /// Connect to an endpoint
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, IpcError> {
        let stream = TcpStream::connect(endpoint.authority()).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    /// Address of the other end, for logging
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}

#[async_trait]
impl IpcTransport for TcpTransport {
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError> {
        let writer = self.writer.as_mut().ok_or(IpcError::NotConnected)?;

        let mut line = serde_json::to_vec(message)
            .map_err(|e| IpcError::Encode(e.to_string()))?;
        line.push(b'\n');

        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive<T: for<'de> Deserialize<'de> + Send>(
        &mut self,
    ) -> Result<MessageEnvelope<T>, IpcError> {
        let reader = self.reader.as_mut().ok_or(IpcError::NotConnected)?;

        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(IpcError::ConnectionClosed);
        }

        let envelope: MessageEnvelope<T> = serde_json::from_str(line.trim_end())
            .map_err(|e| IpcError::Decode(e.to_string()))?;

        if envelope.protocol_version != IPC_PROTOCOL_VERSION {
            return Err(IpcError::VersionMismatch {
                expected: IPC_PROTOCOL_VERSION,
                actual: envelope.protocol_version,
            });
        }

        Ok(envelope)
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        let _ = self.reader.take();
        if let Some(mut writer) = self.writer.take() {
            // The peer may already be gone
            let _ = writer.shutdown().await;
        }
        Ok(())
    }
}
