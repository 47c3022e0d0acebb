//! RPC client

use std::time::Duration;

use log::{debug, warn};
use tokio::time::timeout;

use crate::endpoint::{parse_endpoints, Endpoint};
use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, RpcReply, RpcRequest};
use crate::transport::{IpcTransport, TcpTransport};

/// Connection to one RPC server.
///
/// A call fails with [`IpcError::Timeout`] when the server stays silent for
/// longer than the client timeout. Servers send heartbeats while a request is
/// being handled, so long-running requests do not time out as long as the
/// server is alive. After a transport failure the client is disconnected and
/// every later call fails with [`IpcError::NotConnected`].
pub struct RpcClient {
    transport: Option<TcpTransport>,
    endpoint: Endpoint,
    timeout: Duration,
}

impl RpcClient {
    /// Connect to the first reachable endpoint, trying them in order.
    pub async fn connect(endpoints: &[Endpoint], timeout_duration: Duration) -> Result<Self, IpcError> {
        for endpoint in endpoints {
            match timeout(timeout_duration, TcpTransport::connect(endpoint)).await {
                Ok(Ok(transport)) => {
                    debug!("Connected to {}", endpoint);
                    return Ok(Self {
                        transport: Some(transport),
                        endpoint: endpoint.clone(),
                        timeout: timeout_duration,
                    });
                }
                Ok(Err(e)) => debug!("Could not connect to {}: {}", endpoint, e),
                Err(_) => debug!("Timed out connecting to {}", endpoint),
            }
        }
        Err(IpcError::NoReachableEndpoint(
            endpoints.iter().map(|e| e.to_string()).collect(),
        ))
    }

    /// Parse endpoint strings and connect
    pub async fn connect_str<S: AsRef<str>>(endpoints: &[S], timeout_duration: Duration) -> Result<Self, IpcError> {
        let endpoints = parse_endpoints(endpoints)?;
        Self::connect(&endpoints, timeout_duration).await
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Send a request and wait for its reply. Error replies are returned as
    /// [`IpcError::Remote`].
    pub async fn call(&mut self, request: RpcRequest) -> Result<RpcReply, IpcError> {
        let result = self.exchange(request).await;
        match &result {
            Err(e) if e.is_connection_loss() || e.is_fatal() => {
                warn!("Dropping connection to {}: {}", self.endpoint, e);
                self.disconnect().await;
            }
            _ => {}
        }
        match result? {
            RpcReply::Error { error, .. } => Err(IpcError::Remote(error)),
            reply => Ok(reply),
        }
    }

    async fn exchange(&mut self, request: RpcRequest) -> Result<RpcReply, IpcError> {
        let transport = self.transport.as_mut().ok_or(IpcError::NotConnected)?;
        let correlation_id = request.correlation_id();
        let kind = request.kind();

        timeout(self.timeout, transport.send(&MessageEnvelope::new(request)))
            .await
            .map_err(|_| IpcError::Timeout)??;

        loop {
            let envelope = timeout(self.timeout, transport.receive::<RpcReply>())
                .await
                .map_err(|_| IpcError::Timeout)??;

            match envelope.message {
                RpcReply::Heartbeat { correlation_id: id } if id == correlation_id => {
                    debug!("Heartbeat from {} for {}", self.endpoint, kind);
                }
                reply => match reply.correlation_id() {
                    Some(id) if id != correlation_id => {
                        return Err(IpcError::InvalidMessage(format!(
                            "reply to {} carries unexpected correlation id {}",
                            kind, id
                        )));
                    }
                    _ => return Ok(reply),
                },
            }
        }
    }

    /// Close the connection. Idempotent.
    pub async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.close().await;
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Connect, make one call, and disconnect
pub async fn run_single_rpc<S: AsRef<str>>(
    endpoints: &[S],
    request: RpcRequest,
    timeout_duration: Duration,
) -> Result<RpcReply, IpcError> {
    let mut client = RpcClient::connect_str(endpoints, timeout_duration).await?;
    let result = client.call(request).await;
    client.disconnect().await;
    result
}
