//! Echo session handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use diorama_gateway::{ClientConnection, GatewayError, Message, SessionHandler};

/// Session logic that echoes every inbound data frame back to its sender.
///
/// Stands in for the scene-generation pipeline until that service exists;
/// it exercises the full connection lifecycle without defining a protocol.
pub struct EchoSession {
    echoed: AtomicU64,
}

impl EchoSession {
    pub fn new() -> Self {
        Self {
            echoed: AtomicU64::new(0),
        }
    }
}

impl Default for EchoSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHandler for EchoSession {
    fn on_message(
        &self,
        conn: &Arc<ClientConnection>,
        message: Message,
    ) -> impl std::future::Future<Output = Result<(), GatewayError>> + Send {
        async move {
            match message {
                Message::Text(text) => {
                    self.echoed.fetch_add(1, Ordering::Relaxed);
                    debug!(connection_id = %conn.id(), len = text.len(), "Echoing text frame");
                    conn.send(Message::Text(text))?;
                }
                Message::Binary(payload) => {
                    self.echoed.fetch_add(1, Ordering::Relaxed);
                    debug!(connection_id = %conn.id(), len = payload.len(), "Echoing binary frame");
                    conn.send(Message::Binary(payload))?;
                }
                other => {
                    debug!(connection_id = %conn.id(), frame = ?other, "Ignoring non-data frame");
                }
            }
            Ok(())
        }
    }

    fn on_disconnect(
        &self,
        conn: &Arc<ClientConnection>,
    ) -> impl std::future::Future<Output = ()> + Send {
        let id = conn.id();
        let echoed = self.echoed.load(Ordering::Relaxed);
        async move {
            debug!(connection_id = %id, total_echoed = echoed, "Echo session ended");
        }
    }
}
