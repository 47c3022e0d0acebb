//! RPC server
//!
//! Accepts TCP connections and answers [`RpcRequest`]s through an
//! [`RpcHandler`]. Stopping the server closes the listener and lets every
//! connection finish the request it is currently handling, so callers always
//! receive their final reply.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::endpoint::{advertised_endpoints, Endpoint};
use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, RemoteError, RpcReply, RpcRequest};
use crate::transport::{IpcTransport, TcpTransport};

/// Default interval between heartbeats sent during long requests
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Request handler behind an [`RpcServer`]
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, request: RpcRequest) -> RpcReply;
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to bind; the port is always chosen by the OS
    pub bind_address: String,
    /// Host advertised in endpoints instead of the detected addresses
    pub advertise_host: Option<String>,
    pub heartbeat_interval: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            advertise_host: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

impl ServerOptions {
    /// Options for a server reachable only from this host
    pub fn loopback() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            ..Self::default()
        }
    }
}

/// TCP RPC server bound to an ephemeral port
pub struct RpcServer {
    local_addr: SocketAddr,
    endpoints: Vec<Endpoint>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Bind and start serving
    pub async fn bind(options: ServerOptions, handler: Arc<dyn RpcHandler>) -> Result<Self, IpcError> {
        let listener = TcpListener::bind((options.bind_address.as_str(), 0)).await?;
        let local_addr = listener.local_addr()?;
        let endpoints = advertised_endpoints(local_addr, options.advertise_host.as_deref());
        info!(
            "RPC server listening on {} (endpoints: {})",
            local_addr,
            endpoints.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(" ")
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            handler,
            shutdown_rx,
            options.heartbeat_interval,
        ));

        Ok(Self {
            local_addr,
            endpoints,
            shutdown_tx,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Endpoints as `tcp://host:port` strings
    pub fn endpoint_strings(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.to_string()).collect()
    }

    /// Stop accepting connections and wait until every connection has
    /// answered its in-flight request. Must not be awaited from inside a
    /// handler of this server.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("RPC server task on {} failed: {}", self.local_addr, e);
                }
            }
            debug!("RPC server on {} stopped", self.local_addr);
        }
    }

    /// Drop every connection immediately, without answering pending requests
    pub fn abort(&self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
    heartbeat_interval: Duration,
) {
    let mut connections = JoinSet::new();
    let connection_shutdown_rx = shutdown_rx.clone();
    loop {
        tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted RPC connection from {}", peer);
                    connections.spawn(serve_connection(
                        stream,
                        handler.clone(),
                        connection_shutdown_rx.clone(),
                        heartbeat_interval,
                    ));
                }
                Err(e) => warn!("Failed to accept RPC connection: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn RpcHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
    heartbeat_interval: Duration,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY: {}", e);
    }
    let mut transport = TcpTransport::new(stream);

    loop {
        let received = tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            received = transport.receive::<RpcRequest>() => received,
        };

        let reply = match received {
            Ok(envelope) => {
                handle_with_heartbeats(&mut transport, handler.as_ref(), envelope.message, heartbeat_interval)
                    .await
            }
            Err(IpcError::ConnectionClosed) => break,
            Err(IpcError::Decode(error)) => {
                warn!("Unparseable request from {}: {}", transport.peer(), error);
                RpcReply::Error {
                    correlation_id: None,
                    error: RemoteError::MessageParseError { error },
                }
            }
            Err(e) => {
                debug!("Connection from {} ended: {}", transport.peer(), e);
                break;
            }
        };

        if let Err(e) = transport.send(&MessageEnvelope::new(reply)).await {
            debug!("Could not reply to {}: {}", transport.peer(), e);
            break;
        }
    }

    let _ = transport.close().await;
}

async fn handle_with_heartbeats(
    transport: &mut TcpTransport,
    handler: &dyn RpcHandler,
    request: RpcRequest,
    heartbeat_interval: Duration,
) -> RpcReply {
    let correlation_id = request.correlation_id();
    let handling = handler.handle(request);
    tokio::pin!(handling);

    let start = tokio::time::Instant::now() + heartbeat_interval;
    let mut ticker = tokio::time::interval_at(start, heartbeat_interval);
    let mut heartbeats_enabled = true;

    loop {
        tokio::select! {
            reply = &mut handling => return reply,
            _ = ticker.tick(), if heartbeats_enabled => {
                let heartbeat = MessageEnvelope::new(RpcReply::Heartbeat { correlation_id });
                if let Err(e) = transport.send(&heartbeat).await {
                    // Keep handling; the reply will fail to send as well
                    debug!("Heartbeat to {} failed: {}", transport.peer(), e);
                    heartbeats_enabled = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{run_single_rpc, RpcClient};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowPing {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RpcHandler for SlowPing {
        async fn handle(&self, request: RpcRequest) -> RpcReply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match request {
                RpcRequest::Ping { correlation_id } => {
                    tokio::time::sleep(self.delay).await;
                    RpcReply::Ack { correlation_id }
                }
                other => RpcReply::error(
                    other.correlation_id(),
                    RemoteError::UnsupportedRequest {
                        request: other.kind().to_string(),
                    },
                ),
            }
        }
    }

    async fn server(delay: Duration, heartbeat: Duration) -> (RpcServer, Arc<SlowPing>) {
        let handler = Arc::new(SlowPing {
            delay,
            calls: AtomicUsize::new(0),
        });
        let options = ServerOptions {
            heartbeat_interval: heartbeat,
            ..ServerOptions::loopback()
        };
        let server = RpcServer::bind(options, handler.clone()).await.unwrap();
        (server, handler)
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (server, handler) = server(Duration::ZERO, DEFAULT_HEARTBEAT_INTERVAL).await;
        let endpoints = server.endpoint_strings();
        assert_eq!(endpoints.len(), 1);
        assert!(endpoints[0].starts_with("tcp://127.0.0.1:"));

        let reply = run_single_rpc(endpoints.as_slice(), RpcRequest::ping(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(reply, RpcReply::Ack { .. }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let err = run_single_rpc(endpoints.as_slice(), RpcRequest::close(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Remote(RemoteError::UnsupportedRequest { .. })));

        server.stop().await;
        assert!(server.is_stopped());
    }

    #[tokio::test]
    async fn test_heartbeats_keep_long_call_alive() {
        let (server, _) = server(Duration::from_millis(300), Duration::from_millis(20)).await;
        let mut client = RpcClient::connect(server.endpoints(), Duration::from_millis(100))
            .await
            .unwrap();

        let reply = client.call(RpcRequest::ping()).await.unwrap();
        assert!(matches!(reply, RpcReply::Ack { .. }));
        client.disconnect().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (server, _) = server(Duration::from_millis(300), Duration::from_secs(60)).await;
        let mut client = RpcClient::connect(server.endpoints(), Duration::from_millis(50))
            .await
            .unwrap();

        let err = client.call(RpcRequest::ping()).await.unwrap_err();
        assert!(matches!(err, IpcError::Timeout));
        assert!(!client.is_connected());
        server.abort();
    }

    #[tokio::test]
    async fn test_stop_finishes_in_flight_request() {
        let (server, _) = server(Duration::from_millis(100), DEFAULT_HEARTBEAT_INTERVAL).await;
        let server = Arc::new(server);
        let mut client = RpcClient::connect(server.endpoints(), Duration::from_secs(5))
            .await
            .unwrap();

        let call = tokio::spawn(async move { client.call(RpcRequest::ping()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.stop().await;

        let reply = call.await.unwrap().unwrap();
        assert!(matches!(reply, RpcReply::Ack { .. }));

        // The listener is gone after stop
        let err = RpcClient::connect(server.endpoints(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::NoReachableEndpoint(_)));
    }

    #[tokio::test]
    async fn test_first_reachable_endpoint_is_used() {
        let (server, _) = server(Duration::ZERO, DEFAULT_HEARTBEAT_INTERVAL).await;

        // Grab a port that nothing listens on
        let unused = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            Endpoint::from_socket_addr(listener.local_addr().unwrap())
        };
        let endpoints = vec![unused, server.endpoints()[0].clone()];

        let client = RpcClient::connect(&endpoints, Duration::from_secs(1)).await.unwrap();
        assert_eq!(client.endpoint(), &server.endpoints()[0]);
        server.stop().await;
    }
}
