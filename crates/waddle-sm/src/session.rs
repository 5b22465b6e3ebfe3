//! Per-account aggregation of resource connections.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jid::{BareJid, FullJid, Jid};
use parking_lot::Mutex;

use crate::connection::ResourceConnection;
use crate::types::ConnectionId;

/// All active connections of one account.
///
/// The connection list is guarded by a per-session mutex; every mutation
/// (bind, close, stale sweep, stream move) goes through it, which keeps
/// resource names unique among the active connections.
pub struct UserSession {
    jid: BareJid,
    created_at: DateTime<Utc>,
    connections: Mutex<Vec<Arc<ResourceConnection>>>,
    packets: AtomicU64,
}

impl UserSession {
    pub fn new(jid: BareJid) -> Self {
        Self {
            jid,
            created_at: Utc::now(),
            connections: Mutex::new(Vec::new()),
            packets: AtomicU64::new(0),
        }
    }

    /// Bare account id.
    pub fn jid(&self) -> &BareJid {
        &self.jid
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Add a connection. Adding the same connection twice is a no-op.
    ///
    /// Returns connections evicted because they held the same resource.
    pub fn add_connection(&self, conn: &Arc<ResourceConnection>) -> Vec<Arc<ResourceConnection>> {
        let mut connections = self.connections.lock();
        let evicted = match conn.resource() {
            Some(resource) => take_resource_holders(&mut connections, conn, &resource),
            None => Vec::new(),
        };
        if !connections.iter().any(|c| Arc::ptr_eq(c, conn)) {
            connections.push(Arc::clone(conn));
        }
        evicted
    }

    /// Bind `resource` to `conn`, evicting any other connection holding it.
    pub fn bind_resource(
        &self,
        conn: &Arc<ResourceConnection>,
        resource: &str,
    ) -> Vec<Arc<ResourceConnection>> {
        let mut connections = self.connections.lock();
        let evicted = take_resource_holders(&mut connections, conn, resource);
        conn.set_resource(resource.to_string());
        if !connections.iter().any(|c| Arc::ptr_eq(c, conn)) {
            connections.push(Arc::clone(conn));
        }
        evicted
    }

    /// Remove a specific connection object. Returns true if it was present.
    pub fn remove_connection(&self, conn: &Arc<ResourceConnection>) -> bool {
        let mut connections = self.connections.lock();
        let before = connections.len();
        connections.retain(|c| !Arc::ptr_eq(c, conn));
        connections.len() != before
    }

    /// Remove whatever connection currently carries `id`.
    pub fn remove_connection_by_id(&self, id: &ConnectionId) -> Option<Arc<ResourceConnection>> {
        let mut connections = self.connections.lock();
        let idx = connections.iter().position(|c| &c.id() == id)?;
        Some(connections.remove(idx))
    }

    pub fn connection_for_id(&self, id: &ConnectionId) -> Option<Arc<ResourceConnection>> {
        self.connections.lock().iter().find(|c| &c.id() == id).cloned()
    }

    pub fn connection_for_resource(&self, resource: &str) -> Option<Arc<ResourceConnection>> {
        self.connections
            .lock()
            .iter()
            .find(|c| c.resource().as_deref() == Some(resource))
            .cloned()
    }

    /// Pick the connection a stanza addressed to `jid` should go to.
    ///
    /// A single connection is returned directly. A full JID returns its
    /// matching resource. Otherwise the highest priority wins and ties go to
    /// the most recently active connection.
    pub fn resource_connection(&self, jid: &Jid) -> Option<Arc<ResourceConnection>> {
        let connections = self.connections.lock();
        if connections.len() <= 1 {
            return connections.first().cloned();
        }

        if let Some(resource) = jid.resource() {
            let found = connections
                .iter()
                .find(|c| c.resource().as_deref() == Some(resource.as_str()));
            if let Some(conn) = found {
                return Some(Arc::clone(conn));
            }
        }

        connections
            .iter()
            .max_by_key(|c| (c.priority(), c.last_accessed()))
            .cloned()
    }

    /// Snapshot of the active connections.
    pub fn active_connections(&self) -> Vec<Arc<ResourceConnection>> {
        self.connections.lock().clone()
    }

    /// Full JIDs of every bound resource.
    pub fn jids(&self) -> Vec<FullJid> {
        self.connections
            .lock()
            .iter()
            .filter_map(|c| c.full_jid())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    pub fn inc_packets(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

fn take_resource_holders(
    connections: &mut Vec<Arc<ResourceConnection>>,
    conn: &Arc<ResourceConnection>,
    resource: &str,
) -> Vec<Arc<ResourceConnection>> {
    let mut evicted = Vec::new();
    connections.retain(|c| {
        let holds = !Arc::ptr_eq(c, conn) && c.resource().as_deref() == Some(resource);
        if holds {
            evicted.push(Arc::clone(c));
        }
        !holds
    });
    evicted
}

impl fmt::Debug for UserSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSession")
            .field("jid", &self.jid)
            .field("connections", &self.len())
            .finish()
    }
}
