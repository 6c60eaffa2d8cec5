//! Client connection handles and the per-connection actor.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::registry::ConnectionRegistry;
use crate::{GatewayError, SessionHandler};

/// Capacity of the per-connection outbound frame queue.
pub(crate) const OUTBOUND_BUFFER: usize = 64;

/// How long a closing connection waits for the peer's close acknowledgement
/// before giving up and dropping the socket.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one accepted connection, assigned in accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next id.
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to one accepted client connection.
///
/// The registry and the shutdown sweep hold clones of this handle; the
/// connection's own task drives the actual socket. The handle stays valid
/// after the connection terminates so that late observers still get
/// coherent answers: `is_active` reports `false`, `disconnected` completes
/// immediately, `close` is a no-op.
pub struct ClientConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    active: AtomicBool,
    outbound: mpsc::Sender<Message>,
    close_requested: CancellationToken,
    disconnected: CancellationToken,
    close_error: OnceLock<String>,
}

impl ClientConnection {
    pub(crate) fn new(peer_addr: SocketAddr, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            id: ConnectionId::next(),
            peer_addr,
            active: AtomicBool::new(true),
            outbound,
            close_requested: CancellationToken::new(),
            disconnected: CancellationToken::new(),
            close_error: OnceLock::new(),
        }
    }

    /// Identity of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the underlying socket is still open.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until the connection has terminated.
    ///
    /// Fires once, for any termination cause (peer disconnect, transport
    /// error, handler fault, server-initiated close), and stays observable
    /// afterwards: awaiting an already-terminated connection completes
    /// immediately.
    pub async fn disconnected(&self) {
        self.disconnected.cancelled().await;
    }

    /// Queue a frame for delivery to the client.
    ///
    /// Never blocks. Fails when the outbound queue is full or the
    /// connection has gone away.
    pub fn send(&self, message: Message) -> Result<(), GatewayError> {
        match self.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(GatewayError::send(self.id, "outbound queue full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(GatewayError::send(self.id, "connection closed"))
            }
        }
    }

    /// Close the connection and wait until its teardown has finished.
    ///
    /// Safe to call at any point in the lifecycle: closing a connection
    /// that is already closing or closed returns `Ok` without doing
    /// anything. An error is reported only when the closing handshake
    /// itself failed, for example on a transport the peer already severed.
    pub async fn close(&self) -> Result<(), GatewayError> {
        if self.disconnected.is_cancelled() {
            return Ok(());
        }

        self.close_requested.cancel();
        self.disconnected.cancelled().await;

        match self.close_error.get() {
            Some(reason) => Err(GatewayError::connection_close(self.id, reason.clone())),
            None => Ok(()),
        }
    }

    /// Mark the connection terminated and fire the disconnected
    /// notification. Idempotent.
    pub(crate) fn mark_closed(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.disconnected.cancel();
    }

    /// Record the transport failure a later `close` call should surface.
    /// The first recorded failure wins.
    pub(crate) fn record_close_error(&self, reason: String) {
        let _ = self.close_error.set(reason);
    }

    #[cfg(test)]
    pub(crate) fn close_requested_token(&self) -> CancellationToken {
        self.close_requested.clone()
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Guard owned by a connection's handling task.
///
/// Dropping it marks the handle inactive, fires the disconnected
/// notification, and removes the registry entry. It runs on every exit
/// path, handler panics included, so each accepted connection deregisters
/// exactly once.
pub(crate) struct RemovalGuard {
    conn: Arc<ClientConnection>,
    registry: Arc<ConnectionRegistry>,
}

impl RemovalGuard {
    pub(crate) fn new(conn: Arc<ClientConnection>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { conn, registry }
    }
}

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        self.conn.mark_closed();
        self.registry.remove(self.conn.id());
        info!(
            connection_id = %self.conn.id(),
            client_ip = %self.conn.peer_addr(),
            "Client disconnected"
        );
    }
}

/// Actor driving a single client connection.
pub(crate) struct ConnectionActor<H> {
    conn: Arc<ClientConnection>,
    handler: Arc<H>,
}

impl<H: SessionHandler> ConnectionActor<H> {
    /// Handle a newly accepted connection: WebSocket handshake, then the
    /// frame loop until the peer disconnects or a close is requested.
    #[instrument(
        name = "gateway.connection.handle",
        skip(stream, conn, outbound, handler),
        fields(connection_id = %conn.id(), peer = %conn.peer_addr())
    )]
    pub(crate) async fn handle_connection(
        stream: TcpStream,
        conn: Arc<ClientConnection>,
        outbound: mpsc::Receiver<Message>,
        handler: Arc<H>,
    ) -> Result<(), GatewayError> {
        let peer = conn.peer_addr();
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|source| GatewayError::Handshake { peer, source })?;
        debug!("WebSocket handshake complete");

        let actor = Self { conn, handler };
        actor.handler.on_connect(&actor.conn).await;

        let result = actor.run(ws, outbound).await;

        actor.conn.mark_closed();
        actor.handler.on_disconnect(&actor.conn).await;
        result
    }

    async fn run(
        &self,
        mut ws: WebSocketStream<TcpStream>,
        mut outbound: mpsc::Receiver<Message>,
    ) -> Result<(), GatewayError> {
        loop {
            tokio::select! {
                _ = self.conn.close_requested.cancelled() => {
                    debug!("Close requested, starting closing handshake");
                    return self.close_websocket(&mut ws).await;
                }
                Some(message) = outbound.recv() => {
                    if let Err(e) = ws.send(message).await {
                        warn!(error = %e, "Failed to send frame");
                        self.conn.record_close_error(e.to_string());
                        break;
                    }
                }
                frame = ws.next() => match frame {
                    Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                        if let Err(e) = self.handler.on_message(&self.conn, message).await {
                            warn!(error = %e, "Session handler fault");
                            return Err(e);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        // tungstenite queues the pong reply itself.
                        debug!(len = payload.len(), "Ping");
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!("Peer closed connection");
                        let _ = ws.close(None).await;
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Error reading frame");
                        self.conn.record_close_error(e.to_string());
                        break;
                    }
                    None => break,
                },
            }
        }

        Ok(())
    }

    async fn close_websocket(
        &self,
        ws: &mut WebSocketStream<TcpStream>,
    ) -> Result<(), GatewayError> {
        if let Err(e) = ws.close(None).await {
            self.conn.record_close_error(e.to_string());
            return Err(GatewayError::connection_close(self.conn.id(), e.to_string()));
        }

        // Wait for the peer to acknowledge the close, bounded so a silent
        // peer cannot stall the shutdown sweep.
        let drain = async {
            while let Some(frame) = ws.next().await {
                if matches!(frame, Ok(Message::Close(_)) | Err(_)) {
                    break;
                }
            }
        };
        if tokio::time::timeout(CLOSE_GRACE, drain).await.is_err() {
            debug!("Peer did not acknowledge close in time");
        }

        Ok(())
    }
}
