//! External repository contracts.
//!
//! The session manager consumes these traits; credential storage and the
//! per-account key/value store live outside this crate.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use jid::BareJid;

use crate::XmppError;

/// Authentication backend.
#[async_trait]
pub trait AuthRepository: Send + Sync {
    /// Check a plain username/password pair.
    async fn plain_auth(&self, user: &BareJid, password: &str) -> Result<bool, XmppError>;

    /// Check credentials for any other mechanism. Properties are mechanism
    /// specific; on success the authenticated account is returned.
    async fn other_auth(
        &self,
        props: &HashMap<String, String>,
    ) -> Result<Option<BareJid>, XmppError>;

    /// Record that the account's last connection went away.
    async fn logout(&self, user: &BareJid) -> Result<(), XmppError>;

    /// Record a successful login.
    async fn logged_in(&self, user: &BareJid) -> Result<(), XmppError>;

    /// Number of accounts active within `period`.
    async fn active_users_count_in(&self, period: Duration) -> Result<usize, XmppError>;
}

/// Persistent per-account key/value storage.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_data(
        &self,
        user: &BareJid,
        subnode: Option<&str>,
        key: &str,
    ) -> Result<Option<String>, XmppError>;

    async fn set_data(
        &self,
        user: &BareJid,
        subnode: Option<&str>,
        key: &str,
        value: &str,
    ) -> Result<(), XmppError>;

    async fn remove_data(
        &self,
        user: &BareJid,
        subnode: Option<&str>,
        key: &str,
    ) -> Result<(), XmppError>;
}
