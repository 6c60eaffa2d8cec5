//! # diorama-gateway
//!
//! Connection lifecycle for the diorama scene server's WebSocket gateway.
//!
//! Accepts clients over TCP, tracks every live connection in a registry,
//! and coordinates a graceful shutdown in which the listening socket
//! closes first and the remaining connections are then closed in accept
//! order.
//!
//! ## Architecture
//!
//! - **Server**: accept loop spawning one handling task per client
//! - **Connection handles**: activity flag, disconnect notification that
//!   stays observable after it fires, idempotent async close
//! - **Registry**: concurrent map of live connections with snapshot-based
//!   iteration
//! - **Session handlers**: application logic behind [`SessionHandler`];
//!   faults stay scoped to their own connection

pub mod connection;
pub mod registry;
pub mod server;

mod error;

pub use connection::{ClientConnection, ConnectionId};
pub use error::GatewayError;
pub use registry::ConnectionRegistry;
pub use server::{GatewayServer, GatewayServerConfig};

/// Message type carried over connections, re-exported for handler
/// implementations.
pub use tokio_tungstenite::tungstenite::protocol::Message;

use std::sync::Arc;

/// Application logic attached to the gateway.
///
/// One handler instance serves every connection; per-connection state
/// belongs in the handler's own structures, keyed by [`ConnectionId`].
/// An error returned from a handler terminates the connection that raised
/// it and nothing else.
pub trait SessionHandler: Send + Sync + 'static {
    /// Handle one inbound data frame (text or binary).
    fn on_message(
        &self,
        conn: &Arc<ClientConnection>,
        message: Message,
    ) -> impl std::future::Future<Output = Result<(), GatewayError>> + Send;

    /// Called once the WebSocket handshake has completed.
    fn on_connect(
        &self,
        conn: &Arc<ClientConnection>,
    ) -> impl std::future::Future<Output = ()> + Send {
        let _ = conn;
        async {}
    }

    /// Called after the connection has terminated, before its task ends.
    fn on_disconnect(
        &self,
        conn: &Arc<ClientConnection>,
    ) -> impl std::future::Future<Output = ()> + Send {
        let _ = conn;
        async {}
    }
}
