//! Session registry keyed by bare account id.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::BareJid;
use tracing::debug;

use crate::connection::ResourceConnection;
use crate::session::UserSession;

/// Registry of user sessions.
///
/// Sessions are created on the first authorized connection of an account
/// and removed when their last connection goes away. Both operations run
/// under the DashMap shard lock for the account so attaching to a session
/// can never race with its removal.
pub struct SessionRegistry {
    sessions: DashMap<BareJid, Arc<UserSession>>,
    max_sessions: AtomicUsize,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, jid: &BareJid) -> Option<Arc<UserSession>> {
        self.sessions.get(jid).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, jid: &BareJid) -> bool {
        self.sessions.contains_key(jid)
    }

    /// Add `conn` to the session of `jid`, creating the session if needed.
    ///
    /// Returns the session, whether it already existed, and the connections
    /// evicted because they held the same resource.
    pub fn attach(
        &self,
        jid: &BareJid,
        conn: &Arc<ResourceConnection>,
    ) -> (Arc<UserSession>, bool, Vec<Arc<ResourceConnection>>) {
        let entry = self.sessions.entry(jid.clone());
        let existed = matches!(entry, Entry::Occupied(_));
        let guard = entry.or_insert_with(|| {
            debug!(jid = %jid, "Creating new user session");
            Arc::new(UserSession::new(jid.clone()))
        });
        let session = Arc::clone(guard.value());
        let evicted = session.add_connection(conn);
        drop(guard);

        self.max_sessions
            .fetch_max(self.sessions.len(), Ordering::Relaxed);
        (session, existed, evicted)
    }

    /// Remove `session` if it is still registered and has no connections.
    pub fn remove_if_empty(&self, session: &Arc<UserSession>) -> bool {
        let removed = self
            .sessions
            .remove_if(session.jid(), |_, stored| {
                Arc::ptr_eq(stored, session) && stored.is_empty()
            })
            .is_some();
        if removed {
            debug!(jid = %session.jid(), "Removed empty user session");
        }
        removed
    }

    /// Remove the session of `jid` unconditionally.
    pub fn remove(&self, jid: &BareJid) -> Option<Arc<UserSession>> {
        self.sessions.remove(jid).map(|(_, session)| session)
    }

    /// Snapshot of every session.
    pub fn sessions(&self) -> Vec<Arc<UserSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Highest number of simultaneous sessions seen.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::Relaxed)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectionId;

    fn authorized(id: &str) -> Arc<ResourceConnection> {
        let conn = Arc::new(ResourceConnection::new(
            ConnectionId::parse(id).unwrap(),
            "localhost",
        ));
        conn.authorize("alice@localhost".parse().unwrap(), false)
            .unwrap();
        conn
    }

    #[test]
    fn test_attach_creates_once() {
        let registry = SessionRegistry::new();
        let jid: BareJid = "alice@localhost".parse().unwrap();

        let (first, existed, _) = registry.attach(&jid, &authorized("c2s@localhost/1"));
        assert!(!existed);
        let (second, existed, _) = registry.attach(&jid, &authorized("c2s@localhost/2"));
        assert!(existed);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.len(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_if_empty() {
        let registry = SessionRegistry::new();
        let jid: BareJid = "alice@localhost".parse().unwrap();
        let conn = authorized("c2s@localhost/1");
        let (session, _, _) = registry.attach(&jid, &conn);

        assert!(!registry.remove_if_empty(&session));
        session.remove_connection(&conn);
        assert!(registry.remove_if_empty(&session));
        assert!(registry.get(&jid).is_none());
        assert_eq!(registry.max_sessions(), 1);
    }
}
