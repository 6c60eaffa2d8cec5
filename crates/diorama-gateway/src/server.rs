//! Gateway server: accept loop and shutdown orchestration.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};

use diorama_lifecycle::ShutdownCoordinator;

use crate::connection::{ClientConnection, ConnectionActor, RemovalGuard, OUTBOUND_BUFFER};
use crate::registry::ConnectionRegistry;
use crate::{GatewayError, SessionHandler};

/// Gateway server configuration.
#[derive(Debug, Clone)]
pub struct GatewayServerConfig {
    /// Address to listen on for client connections (default: 0.0.0.0:8765)
    pub bind_addr: SocketAddr,
}

impl Default for GatewayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8765".parse().unwrap(),
        }
    }
}

/// WebSocket gateway server.
///
/// Owns the listening socket, the connection registry, and the shutdown
/// coordinator. An instance that has finished shutting down is spent;
/// start a new one to serve again.
pub struct GatewayServer<H> {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown: ShutdownCoordinator,
    handler: Arc<H>,
}

impl<H: SessionHandler> GatewayServer<H> {
    /// Bind the listening socket and prepare a server.
    ///
    /// Binding failures (port in use, permission denied, unresolvable
    /// address) are fatal for the instance; retry policy belongs to the
    /// caller.
    pub async fn start(config: GatewayServerConfig, handler: Arc<H>) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| GatewayError::bind(config.bind_addr, source))?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Scene gateway listening");

        Ok(Self {
            listener,
            local_addr,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: ShutdownCoordinator::new(),
            handler,
        })
    }

    /// Address the server is listening on. Useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle on the shutdown coordinator.
    ///
    /// Clones share state: any of them may request shutdown or await the
    /// `Stopping` and `Stopped` phases.
    pub fn shutdown_handle(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    /// Handle on the connection registry, for observation.
    pub fn registry_handle(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until shutdown is requested, then tear down.
    ///
    /// Consumes the server. When this returns, the listening socket is
    /// closed, every tracked connection has been closed, and the
    /// coordinator has reached `Stopped`. Returns an error only when the
    /// accept loop ended because the listening socket itself became
    /// unusable; the teardown still runs in that case.
    pub async fn run(self) -> Result<(), GatewayError> {
        let mut fatal = None;

        loop {
            tokio::select! {
                _ = self.shutdown.stopping() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.spawn_connection(stream, peer_addr),
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        if is_listener_fault(&e) {
                            self.shutdown.request_shutdown();
                            fatal = Some(GatewayError::Accept(e));
                            break;
                        }
                    }
                },
            }
        }

        // Close the listening socket before any connection is torn down;
        // nothing accepted after this point can slip into the registry
        // mid-drain.
        info!("Shutdown requested, closing listener");
        drop(self.listener);

        drain_connections(&self.registry, &self.shutdown).await;
        info!("Scene gateway stopped");

        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let conn = Arc::new(ClientConnection::new(peer_addr, outbound_tx));
        self.registry.add(Arc::clone(&conn));

        info!(connection_id = %conn.id(), client_ip = %peer_addr, "Client connected");

        let registry = Arc::clone(&self.registry);
        let handler = Arc::clone(&self.handler);
        let connection_id = conn.id();

        tokio::spawn(
            async move {
                let _guard = RemovalGuard::new(Arc::clone(&conn), registry);
                if let Err(e) =
                    ConnectionActor::handle_connection(stream, conn, outbound_rx, handler).await
                {
                    warn!(error = %e, "Connection error");
                }
            }
            .instrument(info_span!(
                "gateway.connection.lifecycle",
                connection_id = %connection_id,
                client_ip = %peer_addr,
                transport = "ws",
            )),
        );
    }
}

/// Close every still-active connection in accept order, then clear the
/// registry and mark the coordinator stopped.
///
/// One connection's close failure never aborts the rest of the drain.
async fn drain_connections(registry: &ConnectionRegistry, shutdown: &ShutdownCoordinator) {
    let members = registry.snapshot();
    info!(connections = members.len(), "Draining active connections");

    for conn in members {
        if !conn.is_active() {
            continue;
        }
        if let Err(e) = conn.close().await {
            warn!(
                connection_id = %conn.id(),
                error = %e,
                "Failed to close connection during shutdown"
            );
        }
    }

    registry.clear();
    shutdown.mark_stopped();
}

/// Whether an accept error means the listening socket itself is unusable.
///
/// Transient per-connection failures (peer reset mid-handshake, file
/// descriptor exhaustion) leave the listener serviceable; these kinds do
/// not.
fn is_listener_fault(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::protocol::Message;

    use diorama_lifecycle::LifecyclePhase;

    use crate::connection::ConnectionId;

    struct NullSession;

    impl SessionHandler for NullSession {
        fn on_message(
            &self,
            _conn: &Arc<ClientConnection>,
            _message: Message,
        ) -> impl std::future::Future<Output = Result<(), GatewayError>> + Send {
            async { Ok(()) }
        }
    }

    struct FaultySession;

    impl SessionHandler for FaultySession {
        fn on_message(
            &self,
            _conn: &Arc<ClientConnection>,
            _message: Message,
        ) -> impl std::future::Future<Output = Result<(), GatewayError>> + Send {
            async { Err(GatewayError::session("scene update rejected")) }
        }
    }

    fn test_config() -> GatewayServerConfig {
        GatewayServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
        }
    }

    async fn start_test_server() -> (
        SocketAddr,
        Arc<ConnectionRegistry>,
        ShutdownCoordinator,
        JoinHandle<Result<(), GatewayError>>,
    ) {
        let server = GatewayServer::start(test_config(), Arc::new(NullSession))
            .await
            .unwrap();
        let addr = server.local_addr();
        let registry = server.registry_handle();
        let shutdown = server.shutdown_handle();
        let run = tokio::spawn(server.run());
        (addr, registry, shutdown, run)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_update_registry() {
        let (addr, registry, shutdown, _run) = start_test_server().await;

        let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        wait_until(|| registry.connection_count() == 1).await;

        client.close(None).await.unwrap();
        wait_until(|| registry.is_empty()).await;

        // A normal disconnect never starts a shutdown.
        assert_eq!(shutdown.phase(), LifecyclePhase::Running);
    }

    #[tokio::test]
    async fn test_bind_error_when_port_taken() {
        let first = GatewayServer::start(test_config(), Arc::new(NullSession))
            .await
            .unwrap();
        let taken = GatewayServerConfig {
            bind_addr: first.local_addr(),
        };

        let result = GatewayServer::start(taken, Arc::new(NullSession)).await;
        assert!(matches!(result, Err(GatewayError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_client() {
        let (addr, registry, shutdown, run) = start_test_server().await;

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
            clients.push(client);
        }
        wait_until(|| registry.connection_count() == 3).await;

        shutdown.request_shutdown();
        // Duplicate requests are harmless.
        shutdown.request_shutdown();

        for client in &mut clients {
            let frame = timeout(Duration::from_secs(10), client.next())
                .await
                .expect("no close frame before timeout")
                .expect("stream ended without close frame")
                .unwrap();
            assert!(matches!(frame, Message::Close(_)));
            // Drive the client once more so its close reply gets flushed.
            let _ = client.next().await;
        }

        timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(registry.is_empty());
        assert_eq!(shutdown.phase(), LifecyclePhase::Stopped);

        // The listening socket is gone; new clients are refused.
        assert!(connect_async(format!("ws://{addr}")).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_with_no_connections() {
        let (_addr, registry, shutdown, run) = start_test_server().await;
        assert_eq!(shutdown.phase(), LifecyclePhase::Running);

        shutdown.request_shutdown();
        timeout(Duration::from_secs(5), shutdown.stopped())
            .await
            .unwrap();

        run.await.unwrap().unwrap();
        assert!(registry.is_empty());
        assert_eq!(shutdown.phase(), LifecyclePhase::Stopped);
    }

    #[tokio::test]
    async fn test_handler_fault_scoped_to_its_connection() {
        let server = GatewayServer::start(test_config(), Arc::new(FaultySession))
            .await
            .unwrap();
        let addr = server.local_addr();
        let registry = server.registry_handle();
        let _run = tokio::spawn(server.run());

        let (mut faulting, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let (_steady, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        wait_until(|| registry.connection_count() == 2).await;

        faulting
            .send(Message::text("place a red cube"))
            .await
            .unwrap();
        wait_until(|| registry.connection_count() == 1).await;

        // The server keeps accepting after the fault.
        let (_late, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        wait_until(|| registry.connection_count() == 2).await;
    }

    #[tokio::test]
    async fn test_failed_handshake_still_deregisters() {
        let (addr, registry, shutdown, run) = start_test_server().await;

        // Raw TCP client that starts the HTTP upgrade but never finishes
        // it. The preamble must stay incomplete: a finished-but-invalid
        // request is rejected so fast that the registry entry can come
        // and go between polls.
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket
            .write_all(b"GET /scene HTTP/1.1\r\nHost: diorama\r\n")
            .await
            .unwrap();
        wait_until(|| registry.connection_count() == 1).await;

        // Severing the socket mid-handshake fails the upgrade; the
        // removal guard still deregisters the connection.
        drop(socket);
        wait_until(|| registry.is_empty()).await;

        shutdown.request_shutdown();
        timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(shutdown.phase(), LifecyclePhase::Stopped);
    }

    fn simulated_connection(
        registry: &Arc<ConnectionRegistry>,
        closed_order: &Arc<Mutex<Vec<ConnectionId>>>,
        close_failure: Option<&'static str>,
    ) -> Arc<ClientConnection> {
        let (tx, _rx) = mpsc::channel(OUTBOUND_BUFFER);
        let conn = Arc::new(ClientConnection::new("127.0.0.1:9000".parse().unwrap(), tx));
        registry.add(Arc::clone(&conn));

        let task_conn = Arc::clone(&conn);
        let order = Arc::clone(closed_order);
        let close_requested = conn.close_requested_token();
        tokio::spawn(async move {
            close_requested.cancelled().await;
            if let Some(reason) = close_failure {
                task_conn.record_close_error(reason.to_string());
            }
            order.lock().unwrap().push(task_conn.id());
            task_conn.mark_closed();
        });

        conn
    }

    #[tokio::test]
    async fn test_drain_closes_in_accept_order_despite_failures() {
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = ShutdownCoordinator::new();
        let closed_order = Arc::new(Mutex::new(Vec::new()));

        // First connection fails its close, second closes cleanly.
        let failing = simulated_connection(&registry, &closed_order, Some("transport severed"));
        let healthy = simulated_connection(&registry, &closed_order, None);

        shutdown.request_shutdown();
        timeout(
            Duration::from_secs(5),
            drain_connections(&registry, &shutdown),
        )
        .await
        .unwrap();

        assert!(registry.is_empty());
        assert!(!failing.is_active());
        assert!(!healthy.is_active());
        assert_eq!(shutdown.phase(), LifecyclePhase::Stopped);
        assert_eq!(
            *closed_order.lock().unwrap(),
            vec![failing.id(), healthy.id()]
        );
    }

    #[test]
    fn test_listener_fault_classification() {
        assert!(is_listener_fault(&io::Error::new(
            io::ErrorKind::InvalidInput,
            "bad fd"
        )));
        assert!(!is_listener_fault(&io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset"
        )));
        assert!(!is_listener_fault(&io::Error::new(
            io::ErrorKind::WouldBlock,
            "busy"
        )));
    }

    #[test]
    fn test_default_config() {
        let config = GatewayServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8765);
    }
}
