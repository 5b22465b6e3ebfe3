//! Connection registry keyed by connection id.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::connection::ResourceConnection;
use crate::types::ConnectionId;

/// Registry of every live resource connection.
///
/// Thread-safe map from connection id to connection, backed by DashMap so
/// lookups from the router and the worker pools never contend on one lock.
///
/// ## Usage
///
/// ```ignore
/// let registry = ConnectionRegistry::new();
/// registry.insert(Arc::clone(&conn));
///
/// // Later, from the close path:
/// registry.remove_if_same(&conn);
/// ```
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ResourceConnection>>,
    max_connections: AtomicUsize,
    total_connections: AtomicUsize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            max_connections: AtomicUsize::new(0),
            total_connections: AtomicUsize::new(0),
        }
    }

    /// Register a connection under its current id.
    ///
    /// Returns the connection previously stored under that id, if any.
    #[instrument(skip(self, conn), fields(conn_id = %conn.id()))]
    pub fn insert(&self, conn: Arc<ResourceConnection>) -> Option<Arc<ResourceConnection>> {
        let previous = self.connections.insert(conn.id(), conn);
        if previous.is_some() {
            debug!("Replaced existing connection registration");
        } else {
            debug!("Registered new connection");
        }

        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.max_connections
            .fetch_max(self.connections.len(), Ordering::Relaxed);
        previous
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ResourceConnection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Remove whatever is stored under `id`.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ResourceConnection>> {
        self.connections.remove(id).map(|(_, conn)| conn)
    }

    /// Remove `conn` only if it is still the value stored under its id.
    ///
    /// A newer connection registered under the same id is left alone.
    pub fn remove_if_same(&self, conn: &Arc<ResourceConnection>) -> bool {
        self.remove_id_if_same(&conn.id(), conn)
    }

    /// Remove the entry under `id` only if it holds `conn`.
    pub fn remove_id_if_same(&self, id: &ConnectionId, conn: &Arc<ResourceConnection>) -> bool {
        let removed = self
            .connections
            .remove_if(id, |_, stored| Arc::ptr_eq(stored, conn))
            .is_some();
        if removed {
            debug!(conn_id = %id, "Unregistered connection");
        }
        removed
    }

    /// Snapshot of every registered connection.
    pub fn connections(&self) -> Vec<Arc<ResourceConnection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Highest number of simultaneous connections seen.
    pub fn max_connections(&self) -> usize {
        self.max_connections.load(Ordering::Relaxed)
    }

    /// Number of connections ever registered.
    pub fn total_connections(&self) -> usize {
        self.total_connections.load(Ordering::Relaxed)
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
            .field("connections", &self.connections.len())
            .finish()
    }
}
