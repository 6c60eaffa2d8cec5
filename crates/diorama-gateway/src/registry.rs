//! Registry of live client connections.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::connection::{ClientConnection, ConnectionId};

/// Tracks every live client connection.
///
/// Keyed by [`ConnectionId`] rather than peer address, since one peer may
/// hold several connections. Backed by `DashMap`, so registration,
/// removal, and snapshots never contend on a single lock.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Add a connection.
    pub fn add(&self, conn: Arc<ClientConnection>) {
        debug!(connection_id = %conn.id(), "Registered connection");
        self.connections.insert(conn.id(), conn);
    }

    /// Remove a connection by id, returning its handle if it was present.
    ///
    /// Removing an id that is absent is a no-op: the disconnect path and a
    /// concurrent shutdown sweep may both try to drop the same entry.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ClientConnection>> {
        match self.connections.remove(&id) {
            Some((_, conn)) => {
                debug!(connection_id = %id, "Removed connection");
                Some(conn)
            }
            None => {
                debug!(connection_id = %id, "Connection was not registered");
                None
            }
        }
    }

    /// Point-in-time copy of the current members, in accept order.
    ///
    /// The returned list is independent of the registry: connections may
    /// keep registering and removing themselves while it is iterated.
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        let mut members: Vec<Arc<ClientConnection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        members.sort_by_key(|conn| conn.id());
        members
    }

    /// Whether the given id is currently registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.connections.clear();
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connections.len())
            .finish()
    }
}
