//! Stale connection reaper.
//!
//! The close path queues connection ids it could not find in the connection
//! registry. A periodic sweep takes the queued ids as its working set and
//! removes matching connections still listed in a user session, which is
//! what is left behind when a transport disconnect races the bookkeeping.
//!
//! Ingestion only touches the queue set. The sweep swaps it for an empty
//! set and works on its own copy, so the expensive scan never holds the
//! ingestion lock.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument, trace, warn};

use crate::connection::ResourceConnection;
use crate::registry::{ConnectionRegistry, SessionRegistry};
use crate::types::ConnectionId;

pub struct StaleConnectionReaper {
    queue: Mutex<HashSet<ConnectionId>>,
    max_queue_size: usize,
    running: AtomicBool,
}

impl StaleConnectionReaper {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            queue: Mutex::new(HashSet::new()),
            max_queue_size,
            running: AtomicBool::new(false),
        }
    }

    /// Queue a connection id for the next sweep.
    ///
    /// Returns false if the id was already queued or the queue is full.
    pub fn queue_for_close(&self, id: ConnectionId) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= self.max_queue_size {
            debug!(conn_id = %id, "Stale connection queue full");
            return false;
        }
        let added = queue.insert(id);
        if !added {
            trace!("Connection already queued for stale check");
        }
        added
    }

    /// Number of ids waiting for the next sweep.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run one sweep and return the connections it removed.
    ///
    /// Only one sweep runs at a time; a concurrent call returns nothing.
    /// Ids not found in any session are dropped.
    #[instrument(skip_all)]
    pub fn sweep(
        &self,
        sessions: &SessionRegistry,
        connections: &ConnectionRegistry,
    ) -> Vec<Arc<ResourceConnection>> {
        if self.running.swap(true, Ordering::AcqRel) {
            trace!("Sweep already running");
            return Vec::new();
        }

        let mut working = std::mem::take(&mut *self.queue.lock());
        let mut removed = Vec::new();

        if !working.is_empty() {
            debug!(
                suspects = working.len(),
                "Trying to find and remove stale connections"
            );
        }

        for session in sessions.sessions() {
            if working.is_empty() {
                break;
            }
            let mut touched = false;
            for conn in session.active_connections() {
                let id = conn.id();
                if !working.remove(&id) {
                    continue;
                }
                warn!(conn_id = %id, jid = %session.jid(), "Found stale connection, removing");
                session.remove_connection(&conn);
                connections.remove_id_if_same(&id, &conn);
                removed.push(conn);
                touched = true;
            }
            if touched && session.is_empty() {
                sessions.remove_if_empty(&session);
            }
        }

        self.running.store(false, Ordering::Release);
        removed
    }
}

impl fmt::Debug for StaleConnectionReaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaleConnectionReaper")
            .field("queued", &self.queued())
            .field("max_queue_size", &self.max_queue_size)
            .finish()
    }
}
