//! Permission tiers attached to packets.

use std::collections::HashSet;
use std::fmt;

use jid::{BareJid, Jid};
use parking_lot::RwLock;
use tracing::debug;

use crate::connection::ResourceConnection;

/// Coarse authorization level of a packet's originating connection.
///
/// Ordered so that `>=` comparisons express "at least this tier".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    /// No connection is associated with the packet
    #[default]
    None,
    /// Local connection, not yet authenticated
    Local,
    /// Authenticated user
    Auth,
    /// Anonymous authenticated user
    Anonymous,
    /// Member of the trusted identity set
    Trusted,
    /// Server administrator
    Admin,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::None => write!(f, "none"),
            Permission::Local => write!(f, "local"),
            Permission::Auth => write!(f, "auth"),
            Permission::Anonymous => write!(f, "anonymous"),
            Permission::Trusted => write!(f, "trusted"),
            Permission::Admin => write!(f, "admin"),
        }
    }
}

/// Admin and trusted identity sets.
///
/// Trusted entries are bare JIDs or plain domains; the set may change at
/// runtime through [`add_trusted`](Self::add_trusted) and
/// [`del_trusted`](Self::del_trusted).
pub struct AccessPolicy {
    admins: Vec<BareJid>,
    trusted: RwLock<HashSet<String>>,
}

impl AccessPolicy {
    pub fn new(admins: Vec<BareJid>, trusted: impl IntoIterator<Item = String>) -> Self {
        Self {
            admins,
            trusted: RwLock::new(trusted.into_iter().collect()),
        }
    }

    pub fn admins(&self) -> &[BareJid] {
        &self.admins
    }

    pub fn is_admin(&self, jid: &Jid) -> bool {
        let bare = jid.to_bare();
        self.admins.iter().any(|admin| admin == &bare)
    }

    /// Whether the bare JID or its domain is trusted.
    pub fn is_trusted(&self, jid: &Jid) -> bool {
        let trusted = self.trusted.read();
        trusted.contains(&jid.to_bare().to_string()) || trusted.contains(jid.domain().as_str())
    }

    /// Add a bare JID (or domain) to the trusted set.
    pub fn add_trusted(&self, jid: &Jid) -> bool {
        let added = self.trusted.write().insert(jid.to_bare().to_string());
        debug!(jid = %jid, added, "Trusted entity added");
        added
    }

    /// Remove a bare JID (or domain) from the trusted set.
    pub fn del_trusted(&self, jid: &Jid) -> bool {
        let removed = self.trusted.write().remove(&jid.to_bare().to_string());
        debug!(jid = %jid, removed, "Trusted entity removed");
        removed
    }

    /// Permission tier for packets arriving on `conn`.
    pub fn permission_for(&self, conn: Option<&ResourceConnection>) -> Permission {
        let Some(conn) = conn else {
            return Permission::None;
        };
        if !conn.is_authorized() {
            return Permission::Local;
        }
        if conn.is_anonymous() {
            return Permission::Anonymous;
        }

        let Some(jid) = conn.jid() else {
            return Permission::Auth;
        };
        if self.is_admin(&jid) {
            Permission::Admin
        } else if self.is_trusted(&jid) {
            Permission::Trusted
        } else {
            Permission::Auth
        }
    }

    /// Permission tier of a sender known only by its JID.
    pub fn permission_for_jid(&self, jid: &Jid) -> Permission {
        if self.is_admin(jid) {
            Permission::Admin
        } else if self.is_trusted(jid) {
            Permission::Trusted
        } else {
            Permission::None
        }
    }
}

impl fmt::Debug for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessPolicy")
            .field("admins", &self.admins.len())
            .field("trusted", &self.trusted.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectionId;

    fn policy() -> AccessPolicy {
        AccessPolicy::new(
            vec!["admin@localhost".parse().unwrap()],
            vec!["gateway.localhost".to_string()],
        )
    }

    fn conn_for(user: Option<&str>, anonymous: bool) -> ResourceConnection {
        let conn = ResourceConnection::new(
            ConnectionId::parse("c2s@localhost/1").unwrap(),
            "localhost",
        );
        if let Some(user) = user {
            conn.authorize(user.parse().unwrap(), anonymous).unwrap();
        }
        conn
    }

    #[test]
    fn test_tier_ordering() {
        assert!(Permission::None < Permission::Local);
        assert!(Permission::Local < Permission::Auth);
        assert!(Permission::Auth < Permission::Anonymous);
        assert!(Permission::Anonymous < Permission::Trusted);
        assert!(Permission::Trusted < Permission::Admin);
    }

    #[test]
    fn test_permission_for_connection() {
        let policy = policy();
        assert_eq!(policy.permission_for(None), Permission::None);
        assert_eq!(policy.permission_for(Some(&conn_for(None, false))), Permission::Local);
        assert_eq!(
            policy.permission_for(Some(&conn_for(Some("bob@localhost"), false))),
            Permission::Auth
        );
        assert_eq!(
            policy.permission_for(Some(&conn_for(Some("anon@localhost"), true))),
            Permission::Anonymous
        );
        assert_eq!(
            policy.permission_for(Some(&conn_for(Some("admin@localhost"), false))),
            Permission::Admin
        );
    }

    #[test]
    fn test_trusted_set_runtime_changes() {
        let policy = policy();
        let bob: Jid = "bob@localhost".parse().unwrap();
        let component: Jid = "gateway.localhost".parse().unwrap();

        assert!(policy.is_trusted(&component));
        assert!(!policy.is_trusted(&bob));

        assert!(policy.add_trusted(&bob));
        assert!(!policy.add_trusted(&bob));
        assert_eq!(
            policy.permission_for(Some(&conn_for(Some("bob@localhost"), false))),
            Permission::Trusted
        );

        assert!(policy.del_trusted(&bob));
        assert!(!policy.is_trusted(&bob));
    }
}
