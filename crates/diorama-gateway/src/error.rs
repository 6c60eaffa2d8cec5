//! Error types for the scene gateway.

use std::net::SocketAddr;

use thiserror::Error;

use crate::connection::ConnectionId;

/// Errors raised by the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The listening socket could not be bound. Fatal for the server
    /// instance; retry policy belongs to the caller.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address the bind was attempted on
        addr: SocketAddr,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// An incoming connection could not be accepted.
    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    /// The WebSocket handshake with a client failed.
    #[error("WebSocket handshake with {peer} failed: {source}")]
    Handshake {
        /// Remote peer address
        peer: SocketAddr,
        /// Underlying handshake error
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// A connection could not be closed cleanly.
    #[error("Failed to close connection {id}: {reason}")]
    ConnectionClose {
        /// Connection the close was attempted on
        id: ConnectionId,
        /// Transport-level failure description
        reason: String,
    },

    /// Opaque fault raised by a session handler.
    #[error("Session handler fault: {0}")]
    Session(String),

    /// An outbound frame could not be queued for delivery.
    #[error("Failed to queue frame for connection {id}: {reason}")]
    Send {
        /// Connection the frame was addressed to
        id: ConnectionId,
        /// Why the frame was not queued
        reason: String,
    },

    /// IO error (network)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Create a bind error.
    pub fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Bind { addr, source }
    }

    /// Create a connection-close error.
    pub fn connection_close(id: ConnectionId, reason: impl Into<String>) -> Self {
        Self::ConnectionClose {
            id,
            reason: reason.into(),
        }
    }

    /// Create a session-handler fault.
    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }

    /// Create a send error.
    pub fn send(id: ConnectionId, reason: impl Into<String>) -> Self {
        Self::Send {
            id,
            reason: reason.into(),
        }
    }
}
