//! Connection lifecycle: open, authorize, bind, close and finalize.
//!
//! ```text
//! STREAM_OPENED ──▶ open_connection ──▶ (auth timer)
//!                        │
//!                   authorize ──▶ register_new_session ──▶ bind_resource
//!                        │
//! STREAM_CLOSED ──▶ close grace timer ─┐
//! STREAM_FINISHED ─────────────────────┴──▶ close_connection ──▶ close_session
//! ```
//!
//! `close_session` is the single finalize step. It runs at most once per
//! connection no matter how many close paths race to it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::connection::{
    ResourceConnection, AUTH_TIMEOUT_KEY, AUTH_TIMER_KEY, ERROR_KEY, SESSION_CLOSE_TIMER_KEY,
};
use crate::context::{PendingCheck, SessionContext, SESSION_CLOSE_POOL, SESSION_OPEN_POOL};
use crate::error::{stream_error_element, stream_errors, Authorization};
use crate::events::SessionEvent;
use crate::metrics;
use crate::packet::{Command, Packet};
use crate::plugin::{Plugin, ProcessContext, Processor};
use crate::session::UserSession;
use crate::timer::TimerHandle;
use crate::types::{AuthState, ConnectionId, StanzaKind, StanzaType};
use crate::XmppError;

/// Session id given to connections created through USER_STATUS.
pub(crate) const USER_STATUS_SESSION_ID: &str = "USER_STATUS";
/// Storage key for the resumption id carried by a stream move.
pub const RESUMPTION_ID_KEY: &str = "resumption-id";

fn cancel_timer(conn: &ResourceConnection, key: &str) {
    if let Some(timer) = conn.take_data::<TimerHandle>(key) {
        timer.cancel();
    }
}

impl SessionContext {
    /// Register a stream reported by the connection manager and arm its
    /// authentication timer.
    #[instrument(skip(self), fields(conn_id = %id))]
    pub(crate) fn open_connection(
        &self,
        id: ConnectionId,
        hostname: Option<&str>,
    ) -> Arc<ResourceConnection> {
        let conn = self.register_connection(id.clone(), hostname);

        let weak = self.weak();
        let timer = self
            .timers
            .schedule("auth-timer", self.config.auth_timeout(), move || async move {
                if let Some(ctx) = weak.upgrade() {
                    ctx.auth_timer_expired(&id);
                }
            });
        conn.put_data(AUTH_TIMER_KEY, timer);

        debug!(domain = %conn.domain(), "Stream opened");
        conn
    }

    fn register_connection(
        &self,
        id: ConnectionId,
        hostname: Option<&str>,
    ) -> Arc<ResourceConnection> {
        let domain = hostname
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.default_domain());
        let conn = Arc::new(ResourceConnection::new(id, domain));
        if let Some(previous) = self.connections.insert(Arc::clone(&conn)) {
            warn!(conn_id = %previous.id(), "Replaced existing connection with the same id");
        }
        conn
    }

    fn auth_timer_expired(&self, id: &ConnectionId) {
        let Some(conn) = self.connections.get(id) else {
            trace!(conn_id = %id, "Auth timer fired for a closed connection");
            return;
        };
        if conn.is_authorized() {
            return;
        }

        info!(conn_id = %id, "Authentication timeout, closing connection");
        conn.put_data(AUTH_TIMEOUT_KEY, true);
        conn.mark_closing();
        self.connections.remove_id_if_same(id, &conn);
        self.stats.inc_auth_timeouts();
        metrics::record_auth_timeout();
        self.send(self.close_command(&conn));
    }

    /// CLOSE command for `conn`, carrying the stream error stored under
    /// [`ERROR_KEY`] if any.
    fn close_command(&self, conn: &ResourceConnection) -> Packet {
        let mut close = Command::Close.packet(
            self.component_id().clone(),
            conn.id().into_jid(),
            StanzaType::Set,
            conn.next_stanza_id(),
        );
        if let Some(condition) = conn.get_data::<String>(ERROR_KEY) {
            close.append_command_data(stream_error_element(&condition));
        }
        close
    }

    /// Mark `conn` authenticated as `user` and attach it to the user's session.
    #[instrument(skip(self, conn), fields(conn_id = %conn.id(), user = %user))]
    pub(crate) async fn authorize(
        &self,
        conn: &Arc<ResourceConnection>,
        user: &BareJid,
        anonymous: bool,
    ) -> Result<(), XmppError> {
        conn.authorize(user.clone(), anonymous)?;
        cancel_timer(conn, AUTH_TIMER_KEY);
        self.register_new_session(user, conn);

        if let Err(e) = self.auth.logged_in(user).await {
            warn!(error = %e, "Failed to record login");
        }
        self.events.publish(SessionEvent::UserConnected {
            jid: user.clone(),
            conn_id: conn.id(),
        });
        info!(anonymous, "User authenticated");
        Ok(())
    }

    pub(crate) async fn login_plain(
        &self,
        conn: &Arc<ResourceConnection>,
        user: &BareJid,
        password: &str,
    ) -> Result<(), XmppError> {
        if !self.auth.plain_auth(user, password).await? {
            debug!(user = %user, "Plain authentication rejected");
            return Err(XmppError::auth_failed(format!("invalid credentials for {user}")));
        }
        self.authorize(conn, user, false).await
    }

    pub(crate) async fn login_other(
        &self,
        conn: &Arc<ResourceConnection>,
        props: &HashMap<String, String>,
    ) -> Result<BareJid, XmppError> {
        let user = self
            .auth
            .other_auth(props)
            .await?
            .ok_or_else(|| XmppError::auth_failed("credentials rejected"))?;
        self.authorize(conn, &user, false).await?;
        Ok(user)
    }

    /// Attach an authorized connection to its user session.
    ///
    /// Older connections of the same account get a liveness check, the
    /// per-account connection limit is enforced, and the connection manager
    /// is told about the login.
    pub(crate) fn register_new_session(&self, user: &BareJid, conn: &Arc<ResourceConnection>) {
        let (session, existed, evicted) = self.sessions.attach(user, conn);
        for old in evicted {
            info!(conn_id = %old.id(), user = %user, "Resource conflict, evicting older connection");
            self.evict(&old, stream_errors::CONFLICT);
        }

        if existed {
            for other in session.active_connections() {
                if !Arc::ptr_eq(&other, conn) {
                    self.check_connection(&other, user);
                }
            }
        }

        self.enforce_connection_limit(&session, conn);
        metrics::record_session_count(self.sessions.len() as i64);

        if !conn.is_tmp_session() && conn.session_id().as_deref() != Some(USER_STATUS_SESSION_ID) {
            let user_jid = user.to_string();
            let login = Command::UserLogin.packet_with_fields(
                self.component_id().clone(),
                conn.id().into_jid(),
                StanzaType::Set,
                conn.next_stanza_id(),
                &[("user-jid", user_jid.as_str())],
            );
            self.send(login);
        }
    }

    /// Ask the connection manager whether `conn` is still alive.
    fn check_connection(&self, conn: &ResourceConnection, user: &BareJid) {
        let check_id = Uuid::new_v4().to_string();
        let conn_id = conn.id();
        let user_jid = user.to_string();

        let weak = self.weak();
        let timer = {
            let check_id = check_id.clone();
            let conn_id = conn_id.clone();
            let user_jid = user_jid.clone();
            self.timers.schedule(
                "connection-check",
                self.config.connection_check_timeout(),
                move || async move {
                    let Some(ctx) = weak.upgrade() else {
                        return;
                    };
                    if ctx.pending_checks.remove(&check_id).is_some() {
                        debug!(conn_id = %conn_id, "Connection check timed out, closing connection");
                        ctx.close_connection(None, &conn_id, Some(&user_jid), false);
                    }
                },
            )
        };

        self.pending_checks.insert(
            check_id.clone(),
            PendingCheck {
                conn_id: conn_id.clone(),
                user: user.clone(),
                timer,
            },
        );

        let check = Command::CheckUserConnection.packet_with_fields(
            self.component_id().clone(),
            conn_id.into_jid(),
            StanzaType::Get,
            check_id,
            &[("user-jid", user_jid.as_str())],
        );
        self.send(check);
    }

    /// Consume the answer to a pending connection check.
    ///
    /// Returns true if `packet` was such an answer. An error answer closes
    /// the checked connection.
    pub(crate) fn take_check_response(&self, packet: &Packet) -> bool {
        if packet.kind() != StanzaKind::Iq
            || !matches!(packet.stanza_type(), Some(StanzaType::Result | StanzaType::Error))
        {
            return false;
        }
        let Some(id) = packet.id() else {
            return false;
        };
        let from = packet.from_address();
        let Some((_, check)) = self
            .pending_checks
            .remove_if(id, |_, check| from.as_ref() == Some(&check.conn_id))
        else {
            return false;
        };

        check.timer.cancel();
        if packet.is_error() {
            debug!(conn_id = %check.conn_id, user = %check.user, "Connection check failed, closing connection");
            let user = check.user.to_string();
            self.close_connection(None, &check.conn_id, Some(&user), false);
        } else {
            trace!(conn_id = %check.conn_id, "Connection check confirmed");
        }
        true
    }

    fn enforce_connection_limit(&self, session: &UserSession, conn: &Arc<ResourceConnection>) {
        let max = self.config.max_user_connections;
        if max == 0 {
            return;
        }

        let mut others: Vec<_> = session
            .active_connections()
            .into_iter()
            .filter(|c| !Arc::ptr_eq(c, conn))
            .collect();
        let excess = (others.len() + 1).saturating_sub(max);
        if excess == 0 {
            return;
        }

        others.sort_by_key(|c| c.created_at());
        for old in others.into_iter().take(excess) {
            info!(
                conn_id = %old.id(),
                user = %session.jid(),
                max,
                "Too many connections for account, evicting oldest"
            );
            self.evict(&old, stream_errors::POLICY_VIOLATION);
        }
    }

    /// Bind `resource` to an authorized connection.
    ///
    /// Another connection holding the same resource is evicted.
    pub(crate) fn bind_resource(
        &self,
        conn: &Arc<ResourceConnection>,
        resource: &str,
    ) -> Result<FullJid, XmppError> {
        let user = match conn.user() {
            Some(user) if conn.is_authorized() => user,
            _ => {
                return Err(XmppError::not_authorized(Some(
                    "Session is not authorized".to_string(),
                )))
            }
        };
        let full = user
            .with_resource_str(resource)
            .map_err(|e| XmppError::jid_malformed(format!("{resource}: {e}")))?;
        let session = self.sessions.get(&user).ok_or(XmppError::SessionNotFound)?;

        for old in session.bind_resource(conn, resource) {
            info!(conn_id = %old.id(), jid = %full, "Resource conflict, evicting older connection");
            self.evict(&old, stream_errors::CONFLICT);
        }

        debug!(conn_id = %conn.id(), jid = %full, "Resource bound");
        self.events.publish(SessionEvent::ResourceBound {
            jid: full.clone(),
            conn_id: conn.id(),
        });
        Ok(full)
    }

    pub(crate) fn set_presence(&self, conn: &ResourceConnection, presence: &Element) -> i8 {
        let priority = conn.set_presence(presence);
        if let Some(jid) = conn.full_jid() {
            self.events
                .publish(SessionEvent::PresenceChanged { jid, priority });
        }
        priority
    }

    /// Detach `conn` from its user session and tell the connection manager
    /// to close it.
    ///
    /// The connection stays registered, closing, until the connection
    /// manager reports the stream closed; that report finalizes it. Has no
    /// effect on a finalized connection.
    pub(crate) fn logout(&self, conn: &Arc<ResourceConnection>) {
        if conn.state() == AuthState::Closed {
            trace!(conn_id = %conn.id(), "Connection already finalized, nothing to log out");
            return;
        }
        conn.mark_closing();
        if let Some(user) = conn.user() {
            if let Some(session) = self.sessions.get(&user) {
                session.remove_connection(conn);
                if self.sessions.remove_if_empty(&session) {
                    debug!(user = %user, "Last connection logged out, user session removed");
                    self.spawn_logout(user);
                }
            }
        }
        self.send(self.close_command(conn));
    }

    /// Close `conn` with a stream error and finalize it without notifying
    /// stop listeners.
    pub(crate) fn evict(&self, conn: &Arc<ResourceConnection>, condition: &str) {
        conn.put_data(ERROR_KEY, condition.to_string());
        self.logout(conn);
        self.close_session(conn, true);
    }

    /// Close the connection `id`.
    ///
    /// With no connection object the registry entry is removed. If none is
    /// found, the connection is looked up in the session of `user`. Without
    /// a `user` it is queued for the stale connection reaper instead.
    #[instrument(skip(self, conn), fields(conn_id = %id))]
    pub(crate) fn close_connection(
        &self,
        conn: Option<Arc<ResourceConnection>>,
        id: &ConnectionId,
        user: Option<&str>,
        close_only: bool,
    ) {
        if let Some(conn) = conn.or_else(|| self.connections.remove(id)) {
            conn.mark_closing();
            self.close_session(&conn, close_only);
            return;
        }

        debug!("Can not find resource connection");
        let Some(user) = user.and_then(|u| Jid::new(u).ok()).map(|j| j.to_bare()) else {
            if self.reaper.queue_for_close(id.clone()) {
                debug!("Queued connection for stale check");
            }
            return;
        };

        let stale = self
            .sessions
            .get(&user)
            .and_then(|session| session.remove_connection_by_id(id).map(|c| (session, c)));
        match stale {
            Some((session, stale)) => {
                debug!(user = %user, "Found connection in user session, removing");
                if self.sessions.remove_if_empty(&session) {
                    self.spawn_logout(user);
                }
                self.close_session(&stale, true);
            }
            None => trace!(user = %user, "Connection not in user session either"),
        }
    }

    /// Finalize `conn`. Runs once per connection; later calls return early.
    pub(crate) fn close_session(&self, conn: &Arc<ResourceConnection>, close_only: bool) {
        if !conn.claim_close() {
            trace!(conn_id = %conn.id(), "Connection already finalized");
            return;
        }
        cancel_timer(conn, AUTH_TIMER_KEY);
        cancel_timer(conn, SESSION_CLOSE_TIMER_KEY);

        if !close_only {
            let dispatch = self.dispatch();
            let mut results = Vec::new();
            for listener in dispatch.pipeline.stop_listeners() {
                listener.stopped(conn, dispatch.settings_for(listener.id()), &mut results);
            }
            self.tag_results(Some(conn), &mut results);
            self.emit(None, Some(conn), results);
        }

        let user = conn.user();
        if let Some(user) = &user {
            if let Some(session) = self.sessions.get(user) {
                session.remove_connection(conn);
                if self.sessions.remove_if_empty(&session) {
                    debug!(user = %user, "Last connection closed, user session removed");
                    self.spawn_logout(user.clone());
                }
            }
        }

        self.connections.remove_if_same(conn);
        conn.finalize();
        conn.clear_storage();

        self.stats.inc_closed_connections();
        metrics::record_connection_closed();
        metrics::record_session_count(self.sessions.len() as i64);
        self.events.publish(SessionEvent::UserDisconnected {
            jid: user,
            conn_id: conn.id(),
        });
        debug!(conn_id = %conn.id(), close_only, "Connection finalized");
    }

    fn spawn_logout(&self, user: BareJid) {
        let auth = Arc::clone(&self.auth);
        tokio::spawn(async move {
            if let Err(e) = auth.logout(&user).await {
                warn!(user = %user, error = %e, "Failed to record logout");
            }
        });
    }

    /// Start the grace period of a closed authorized stream.
    pub(crate) fn arm_close_grace(&self, conn: &ResourceConnection) {
        let weak = self.weak();
        let id = conn.id();
        let session_id = conn.session_id();
        let timer = self
            .timers
            .schedule("stream-close-grace", self.config.close_grace(), move || async move {
                if let Some(ctx) = weak.upgrade() {
                    ctx.close_grace_expired(&id, session_id.as_deref());
                }
            });
        cancel_timer(conn, SESSION_CLOSE_TIMER_KEY);
        conn.put_data(SESSION_CLOSE_TIMER_KEY, timer);
    }

    fn close_grace_expired(&self, id: &ConnectionId, session_id: Option<&str>) {
        let Some(conn) = self.connections.get(id) else {
            trace!(conn_id = %id, "Connection already gone when close grace expired");
            return;
        };
        if session_id.is_some() && conn.session_id().as_deref() != session_id {
            debug!(conn_id = %id, "Connection id reused by a new stream, not closing");
            return;
        }

        debug!(conn_id = %id, "Stream close grace period expired, finalizing");
        self.connections.remove_id_if_same(id, &conn);
        self.close_connection(Some(conn), id, None, false);
    }

    /// Log a user in without SASL, as done for USER_STATUS and pre-bind.
    pub(crate) fn login_user_session(
        &self,
        conn_id: ConnectionId,
        domain: &str,
        user: &BareJid,
        resource: Option<&str>,
        session_id: String,
        tmp: bool,
    ) -> Result<Arc<ResourceConnection>, XmppError> {
        let conn = self.register_connection(conn_id, Some(domain));
        conn.set_tmp_session(tmp);
        conn.set_session_id(Some(session_id));
        conn.authorize(user.clone(), false)?;
        self.register_new_session(user, &conn);

        let resource = resource
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.bind_resource(&conn, &resource)?;
        self.events.publish(SessionEvent::UserConnected {
            jid: user.clone(),
            conn_id: conn.id(),
        });
        info!(conn_id = %conn.id(), user = %user, "User session logged in");
        Ok(conn)
    }

    /// Move the state of connection `old_id` onto the stream of `new_conn`.
    ///
    /// The old connection object is re-keyed under the new id and stays in
    /// its user session throughout; the new connection object is retired.
    #[instrument(skip(self, new_conn, resumption_id), fields(conn_id = %new_conn.id(), old_conn_id = %old_id))]
    pub(crate) fn move_stream(
        &self,
        new_conn: &Arc<ResourceConnection>,
        old_id: &ConnectionId,
        resumption_id: Option<String>,
    ) -> Result<(), XmppError> {
        let old_conn = self
            .connections
            .remove(old_id)
            .ok_or_else(|| XmppError::ConnectionNotFound(old_id.to_string()))?;
        if !old_conn.resume() {
            self.connections.insert(old_conn);
            return Err(XmppError::ConnectionClosing(old_id.to_string()));
        }
        cancel_timer(&old_conn, SESSION_CLOSE_TIMER_KEY);

        let new_id = new_conn.id();
        old_conn.set_id(new_id.clone());
        if let Some(session_id) = new_conn.session_id() {
            old_conn.set_session_id(Some(session_id));
        }
        if let Some(resumption_id) = resumption_id {
            old_conn.put_data(RESUMPTION_ID_KEY, resumption_id);
        }
        self.connections.remove_id_if_same(&new_id, new_conn);
        self.connections.insert(Arc::clone(&old_conn));

        if let Some(user) = old_conn.user() {
            let (session, _, evicted) = self.sessions.attach(&user, &old_conn);
            session.remove_connection(new_conn);
            for other in evicted {
                if !Arc::ptr_eq(&other, new_conn) {
                    self.evict(&other, stream_errors::CONFLICT);
                }
            }
        }

        cancel_timer(new_conn, AUTH_TIMER_KEY);
        new_conn.claim_close();
        new_conn.finalize();
        new_conn.clear_storage();

        let new_conn_jid = new_id.to_string();
        let moved = Command::StreamMoved.packet_with_fields(
            self.component_id().clone(),
            old_id.clone().into_jid(),
            StanzaType::Set,
            "moved",
            &[("cmd", "stream-moved"), ("new-conn-jid", new_conn_jid.as_str())],
        );
        self.send(moved);
        info!("Stream moved to new connection");
        Ok(())
    }

    /// Run one reaper sweep and finalize what it removed.
    pub(crate) fn sweep_stale(&self) -> usize {
        let removed = self.reaper.sweep(&self.sessions, &self.connections);
        if removed.is_empty() {
            return 0;
        }

        let mut logged_out = HashSet::new();
        for conn in &removed {
            if let Some(user) = conn.user() {
                if !self.sessions.contains(&user) && logged_out.insert(user.clone()) {
                    self.spawn_logout(user);
                }
            }
            self.close_session(conn, true);
        }

        let count = removed.len();
        self.stats.add_stale_removed(count as u64);
        metrics::record_stale_removed(count as u64);
        info!(removed = count, "Removed stale connections");
        count
    }
}

/// Handles STREAM_OPENED on the session-open pool.
pub(crate) struct SessionOpenProc;

impl Plugin for SessionOpenProc {
    fn id(&self) -> &str {
        SESSION_OPEN_POOL
    }
}

#[async_trait]
impl Processor for SessionOpenProc {
    fn can_handle(&self, _packet: &Packet, _conn: Option<&ResourceConnection>) -> Option<Authorization> {
        None
    }

    async fn process(
        &self,
        packet: &Packet,
        conn: Option<&Arc<ResourceConnection>>,
        ctx: &ProcessContext<'_>,
        results: &mut Vec<Packet>,
    ) -> Result<(), XmppError> {
        let conn = match conn {
            Some(conn) => Arc::clone(conn),
            None => {
                let id = packet
                    .from_address()
                    .ok_or_else(|| XmppError::bad_request(Some("Missing connection id".to_string())))?;
                let hostname = packet.command_field("hostname");
                ctx.sm.open_connection(id, hostname.as_deref())
            }
        };
        conn.set_session_id(packet.command_field("session-id"));
        conn.set_lang(packet.command_field("xml:lang"));
        results.push(packet.ok_result(None));
        Ok(())
    }
}

/// Runs the finalize task of closed streams on the session-close pool.
pub(crate) struct SessionCloseProc;

impl Plugin for SessionCloseProc {
    fn id(&self) -> &str {
        SESSION_CLOSE_POOL
    }
}

#[async_trait]
impl Processor for SessionCloseProc {
    fn can_handle(&self, _packet: &Packet, _conn: Option<&ResourceConnection>) -> Option<Authorization> {
        None
    }

    async fn process(
        &self,
        packet: &Packet,
        conn: Option<&Arc<ResourceConnection>>,
        ctx: &ProcessContext<'_>,
        _results: &mut Vec<Packet>,
    ) -> Result<(), XmppError> {
        let Some(id) = packet.from_address() else {
            warn!(packet = %packet, "Close command without connection id");
            return Ok(());
        };
        let user = packet.command_field("user-jid");
        ctx.sm
            .close_connection(conn.cloned(), &id, user.as_deref(), false);
        Ok(())
    }
}
