//! Per-stream state held by the session manager.
//!
//! A [`ResourceConnection`] is created when the connection manager reports
//! a new stream and lives until the close path finalizes it. Its link to the
//! owning [`UserSession`](crate::session::UserSession) is the bare JID only;
//! the session is looked up through the
//! [`SessionRegistry`](crate::registry::SessionRegistry) when needed.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::packet::ns;
use crate::types::{AuthState, ConnectionId};
use crate::XmppError;

/// Storage key for the pending stream-close grace timer.
pub const SESSION_CLOSE_TIMER_KEY: &str = "session-close-timer";
/// Storage key for the pending authentication timer.
pub const AUTH_TIMER_KEY: &str = "auth-timer";
/// Set once the authentication timer closed the connection.
pub const AUTH_TIMEOUT_KEY: &str = "authentication-timeout";
/// Stream error condition to report in the CLOSE command sent on logout.
pub const ERROR_KEY: &str = "error";
/// Set when the stream was opened over a direct TLS port.
pub const SSL_KEY: &str = "SSL";
/// TLS channel binding data, raw bytes.
pub const TLS_UNIQUE_ID_KEY: &str = "tls-unique-id";
/// Client certificate presented during the TLS handshake, DER bytes.
pub const PEER_CERTIFICATE_KEY: &str = "peer-certificate";
/// Server certificate used for the TLS handshake, DER bytes.
pub const LOCAL_CERTIFICATE_KEY: &str = "local-certificate";

type Storage = HashMap<String, Arc<dyn Any + Send + Sync>>;

#[derive(Debug)]
struct Inner {
    auth: AuthState,
    authorized: bool,
    anonymous: bool,
    tmp_session: bool,
    user: Option<BareJid>,
    resource: Option<String>,
    priority: i8,
    presence: Option<Element>,
    session_id: Option<String>,
    lang: Option<String>,
    last_accessed: Instant,
}

/// State for one client stream.
pub struct ResourceConnection {
    id: RwLock<ConnectionId>,
    domain: String,
    created_at: Instant,
    connected_at: DateTime<Utc>,
    inner: RwLock<Inner>,
    storage: Mutex<Storage>,
    packets: AtomicU64,
    stanza_seq: AtomicU64,
    close_claimed: AtomicBool,
}

impl ResourceConnection {
    /// Create a connection in the `Init` state.
    pub fn new(id: ConnectionId, domain: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: RwLock::new(id),
            domain: domain.into(),
            created_at: now,
            connected_at: Utc::now(),
            inner: RwLock::new(Inner {
                auth: AuthState::Init,
                authorized: false,
                anonymous: false,
                tmp_session: false,
                user: None,
                resource: None,
                priority: 0,
                presence: None,
                session_id: None,
                lang: None,
                last_accessed: now,
            }),
            storage: Mutex::new(HashMap::new()),
            packets: AtomicU64::new(0),
            stanza_seq: AtomicU64::new(0),
            close_claimed: AtomicBool::new(false),
        }
    }

    /// Current connection id.
    pub fn id(&self) -> ConnectionId {
        self.id.read().clone()
    }

    /// Re-key the connection after a stream move.
    pub(crate) fn set_id(&self, id: ConnectionId) {
        *self.id.write() = id;
    }

    /// Virtual host this stream was opened for.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Lifecycle state.
    pub fn state(&self) -> AuthState {
        self.inner.read().auth
    }

    /// Whether the user has authenticated and the connection is not finalized.
    pub fn is_authorized(&self) -> bool {
        let inner = self.inner.read();
        inner.authorized && inner.auth != AuthState::Closed
    }

    pub fn is_anonymous(&self) -> bool {
        self.inner.read().anonymous
    }

    /// Whether this connection was created for a pre-bound or temporary login.
    pub fn is_tmp_session(&self) -> bool {
        self.inner.read().tmp_session
    }

    pub(crate) fn set_tmp_session(&self, tmp: bool) {
        self.inner.write().tmp_session = tmp;
    }

    /// Record a successful authentication.
    ///
    /// Fails once the connection has started closing.
    pub(crate) fn authorize(&self, user: BareJid, anonymous: bool) -> Result<(), XmppError> {
        let mut inner = self.inner.write();
        match inner.auth {
            AuthState::Closing | AuthState::Closed => {
                Err(XmppError::ConnectionClosing(self.id().to_string()))
            }
            AuthState::Init | AuthState::Authorized => {
                inner.auth = AuthState::Authorized;
                inner.authorized = true;
                inner.anonymous = anonymous;
                inner.user = Some(user);
                Ok(())
            }
        }
    }

    /// Move to `Closing`. Returns false if the connection was already closing.
    pub(crate) fn mark_closing(&self) -> bool {
        let mut inner = self.inner.write();
        match inner.auth {
            AuthState::Init | AuthState::Authorized => {
                inner.auth = AuthState::Closing;
                true
            }
            AuthState::Closing | AuthState::Closed => false,
        }
    }

    /// Back to `Authorized` after a stream move revived a closing connection.
    pub(crate) fn resume(&self) -> bool {
        let mut inner = self.inner.write();
        if inner.auth == AuthState::Closing && inner.authorized {
            inner.auth = AuthState::Authorized;
            return true;
        }
        inner.auth == AuthState::Authorized
    }

    /// Claim the right to run the close path. Only the first caller wins.
    pub(crate) fn claim_close(&self) -> bool {
        !self.close_claimed.swap(true, Ordering::AcqRel)
    }

    /// Whether the close path has started.
    pub fn is_closing(&self) -> bool {
        matches!(self.state(), AuthState::Closing | AuthState::Closed)
    }

    /// Move to `Closed`. Only the first call returns true.
    pub(crate) fn finalize(&self) -> bool {
        let mut inner = self.inner.write();
        if inner.auth == AuthState::Closed {
            return false;
        }
        inner.auth = AuthState::Closed;
        true
    }

    /// Account this connection belongs to, once authenticated.
    pub fn user(&self) -> Option<BareJid> {
        self.inner.read().user.clone()
    }

    /// Whether the connection belongs to the given account.
    pub fn is_user_id(&self, user: &BareJid) -> bool {
        self.inner.read().user.as_ref() == Some(user)
    }

    pub fn resource(&self) -> Option<String> {
        self.inner.read().resource.clone()
    }

    pub fn is_resource_set(&self) -> bool {
        self.inner.read().resource.is_some()
    }

    /// Only called while the owning session's resource lock is held.
    pub(crate) fn set_resource(&self, resource: String) {
        self.inner.write().resource = Some(resource);
    }

    /// Full JID once a resource is bound, bare JID before that.
    pub fn jid(&self) -> Option<Jid> {
        let inner = self.inner.read();
        let user = inner.user.as_ref()?;
        match inner.resource.as_deref() {
            Some(resource) => user.with_resource_str(resource).ok().map(Jid::from),
            None => Some(Jid::from(user.clone())),
        }
    }

    /// Full JID, if a resource is bound.
    pub fn full_jid(&self) -> Option<FullJid> {
        let inner = self.inner.read();
        let user = inner.user.as_ref()?;
        let resource = inner.resource.as_deref()?;
        user.with_resource_str(resource).ok()
    }

    pub fn priority(&self) -> i8 {
        self.inner.read().priority
    }

    /// Store the last presence broadcast and take its priority.
    pub fn set_presence(&self, presence: &Element) -> i8 {
        let priority = presence
            .get_child("priority", ns::CLIENT)
            .and_then(|el| el.text().trim().parse::<i8>().ok())
            .unwrap_or(0);
        let mut inner = self.inner.write();
        inner.priority = priority;
        inner.presence = Some(presence.clone());
        priority
    }

    /// Last presence broadcast by this resource.
    pub fn presence(&self) -> Option<Element> {
        self.inner.read().presence.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.read().session_id.clone()
    }

    pub(crate) fn set_session_id(&self, session_id: Option<String>) {
        self.inner.write().session_id = session_id;
    }

    /// Default `xml:lang` of the stream.
    pub fn lang(&self) -> Option<String> {
        self.inner.read().lang.clone()
    }

    pub(crate) fn set_lang(&self, lang: Option<String>) {
        self.inner.write().lang = lang;
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_accessed(&self) -> Instant {
        self.inner.read().last_accessed
    }

    /// Mark the connection active now.
    pub fn touch(&self) {
        self.inner.write().last_accessed = Instant::now();
    }

    /// Count a packet received from this stream.
    pub fn inc_packets(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Stanza id for packets the session manager originates on this stream.
    pub fn next_stanza_id(&self) -> String {
        let seq = self.stanza_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("sm-{seq}")
    }

    /// Store a value in the connection's scoped storage.
    pub fn put_data<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.storage.lock().insert(key.into(), Arc::new(value));
    }

    /// Fetch a value of type `T` from scoped storage.
    pub fn get_data<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.storage.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Remove a value of type `T` from scoped storage and return it.
    pub fn take_data<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let mut storage = self.storage.lock();
        if !storage.get(key).is_some_and(|v| v.is::<T>()) {
            return None;
        }
        storage.remove(key)?.downcast::<T>().ok()
    }

    pub fn has_data(&self, key: &str) -> bool {
        self.storage.lock().contains_key(key)
    }

    pub fn remove_data(&self, key: &str) -> bool {
        self.storage.lock().remove(key).is_some()
    }

    /// Drop every value in scoped storage.
    pub(crate) fn clear_storage(&self) {
        self.storage.lock().clear();
    }
}

impl fmt::Debug for ResourceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ResourceConnection")
            .field("id", &*self.id.read())
            .field("state", &inner.auth)
            .field("user", &inner.user)
            .field("resource", &inner.resource)
            .field("priority", &inner.priority)
            .finish()
    }
}
