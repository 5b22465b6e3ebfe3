//! Internal commands exchanged with the connection manager.
//!
//! Commands are iq stanzas carrying a `command` element whose `node` names
//! the operation. They are handled here instead of going through the plugin
//! pipeline. Work that may take time (opening and finalizing streams,
//! ad-hoc commands) is queued on internal pools; everything else is done
//! inline.

use std::collections::VecDeque;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jid::Jid;
use minidom::Element;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::connection::{
    ResourceConnection, LOCAL_CERTIFICATE_KEY, PEER_CERTIFICATE_KEY, SESSION_CLOSE_TIMER_KEY, SSL_KEY,
    TLS_UNIQUE_ID_KEY,
};
use crate::context::{
    Dispatch, SessionContext, ADHOC_POOL, OVERLOADED_TEXT, SESSION_CLOSE_POOL, SESSION_OPEN_POOL,
};
use crate::error::StanzaErrorCondition;
use crate::lifecycle::USER_STATUS_SESSION_ID;
use crate::packet::{into_client_ns, ns, Command, Packet};
use crate::permission::Permission;
use crate::timer::TimerHandle;
use crate::types::{ConnectionId, StanzaType};
use crate::worker::Task;
use crate::XmppError;

impl SessionContext {
    /// Handle `packet` if it is a command addressed to the session manager.
    ///
    /// Returns false if the packet should go through normal processing.
    /// Packets the command produces for the session manager itself are
    /// pushed to `reinject`.
    #[instrument(skip_all, fields(command = ?packet.command(), conn_id = ?packet.from_address()))]
    pub(crate) fn process_command(&self, packet: &Packet, reinject: &mut VecDeque<Packet>) -> bool {
        let Some(command) = packet.command() else {
            return false;
        };
        let addressed = packet
            .stanza_to()
            .is_some_and(|to| self.is_component(to) || self.is_local_domain_jid(to));
        if !addressed {
            return false;
        }

        if matches!(packet.stanza_type(), Some(StanzaType::Result | StanzaType::Error)) {
            trace!(packet = %packet, "Consumed command response");
            return true;
        }

        let conn = packet.from_address().and_then(|id| self.connections.get(&id));
        let dispatch = self.dispatch();

        match command {
            Command::Close => {
                warn!(packet = %packet, "Unexpected CLOSE command received");
            }
            Command::StreamOpened => {
                let task = Task::Processor(Arc::clone(&self.internal.session_open));
                if !self.enqueue(&dispatch, SESSION_OPEN_POOL, task, packet.clone(), conn) {
                    self.reply_error(
                        packet,
                        StanzaErrorCondition::ResourceConstraint,
                        Some(OVERLOADED_TEXT),
                    );
                }
            }
            Command::GetFeatures => {
                if packet.stanza_type() == Some(StanzaType::Get) {
                    self.stream_features(packet, &dispatch);
                }
            }
            Command::StreamClosed => self.stream_closed(packet, conn, &dispatch),
            Command::StreamClosedUpdate => self.stream_closed_update(packet, conn, &dispatch),
            Command::StreamFinished => self.stream_finished(packet, conn, &dispatch),
            Command::UserStatus => self.user_status(packet, reinject),
            Command::TlsHandshakeComplete => self.tls_handshake_complete(packet, conn.as_ref()),
            Command::StreamMoved => self.stream_moved(packet, conn.as_ref()),
            Command::BroadcastToOnline => self.broadcast_to_online(packet),
            Command::UserLogin | Command::CheckUserConnection | Command::Other => {
                return self.adhoc_command(packet, conn, &dispatch);
            }
        }
        true
    }

    fn stream_features(&self, packet: &Packet, dispatch: &Dispatch) {
        let ssl = packet.id().is_some_and(|id| id.starts_with("ssl_"));
        let conn = packet
            .stanza_from()
            .and_then(|from| self.connections.get(&ConnectionId::new(from.clone())));
        if ssl {
            if let Some(conn) = &conn {
                conn.put_data(SSL_KEY, true);
            }
        }

        let features: Vec<Element> = dispatch
            .pipeline
            .processors()
            .iter()
            .flat_map(|p| p.stream_features(conn.as_deref()))
            .collect();
        trace!(features = features.len(), ssl, "Collected stream features");
        self.send(packet.command_result(features));
    }

    fn stream_closed(
        &self,
        packet: &Packet,
        conn: Option<Arc<ResourceConnection>>,
        dispatch: &Dispatch,
    ) {
        self.send(packet.ok_result(None));

        let Some(conn) = conn else {
            self.enqueue_close(packet, None, dispatch);
            return;
        };

        let authorized = conn.is_authorized();
        if !authorized {
            self.connections.remove_id_if_same(&conn.id(), &conn);
        }
        if let Some(session) = conn.user().and_then(|user| self.sessions.get(&user)) {
            session.remove_connection(&conn);
        }

        if authorized {
            conn.mark_closing();
            self.arm_close_grace(&conn);
            debug!(conn_id = %conn.id(), "Stream closed, waiting for it to finish");
        } else {
            self.enqueue_close(packet, Some(conn), dispatch);
        }
    }

    fn stream_closed_update(
        &self,
        packet: &Packet,
        conn: Option<Arc<ResourceConnection>>,
        dispatch: &Dispatch,
    ) {
        match conn {
            Some(conn) => self.enqueue_close(packet, Some(conn), dispatch),
            None => {
                let (Some(from), Some(id)) = (packet.stanza_from(), packet.packet_from()) else {
                    debug!(packet = %packet, "Close update without addresses");
                    return;
                };
                let user = from.to_bare().to_string();
                self.close_connection(None, id, Some(&user), true);
            }
        }
    }

    fn stream_finished(
        &self,
        packet: &Packet,
        conn: Option<Arc<ResourceConnection>>,
        dispatch: &Dispatch,
    ) {
        if let Some(conn) = &conn {
            if let Some(timer) = conn.take_data::<TimerHandle>(SESSION_CLOSE_TIMER_KEY) {
                timer.cancel();
            }
            self.connections.remove_id_if_same(&conn.id(), conn);
        }
        self.enqueue_close(packet, conn, dispatch);
    }

    /// Queue the finalize task; run it inline if the pool is full.
    fn enqueue_close(
        &self,
        packet: &Packet,
        conn: Option<Arc<ResourceConnection>>,
        dispatch: &Dispatch,
    ) {
        let task = Task::Processor(Arc::clone(&self.internal.session_close));
        if self.enqueue(dispatch, SESSION_CLOSE_POOL, task, packet.clone(), conn.clone()) {
            return;
        }
        if let Some(id) = packet.from_address() {
            let user = packet.command_field("user-jid");
            self.close_connection(conn, &id, user.as_deref(), false);
        }
    }

    fn user_status(&self, packet: &Packet, reinject: &mut VecDeque<Packet>) {
        if let Err(e) = self.try_user_status(packet, reinject) {
            warn!(packet = %packet, error = %e, "USER_STATUS command failed");
            let text = format!("Unexpected error occured during the request: {e}");
            self.reply_error(packet, StanzaErrorCondition::UndefinedCondition, Some(&text));
        }
    }

    fn try_user_status(
        &self,
        packet: &Packet,
        reinject: &mut VecDeque<Packet>,
    ) -> Result<(), XmppError> {
        let from = packet
            .stanza_from()
            .ok_or_else(|| XmppError::bad_request(Some("Missing sender address".to_string())))?;
        let prebind = packet
            .command_field("prebind")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        if !prebind && !self.policy.is_trusted(from) {
            self.reply_error(
                packet,
                StanzaErrorCondition::Forbidden,
                Some("Only trusted entity can do it."),
            );
            return Ok(());
        }

        let available = !packet
            .command_field("available")
            .is_some_and(|v| v.eq_ignore_ascii_case("false"));
        let jid_field = packet
            .command_field("jid")
            .ok_or_else(|| XmppError::bad_request(Some("Missing jid field".to_string())))?;
        let jid = Jid::new(&jid_field)
            .map_err(|e| XmppError::jid_malformed(format!("{jid_field}: {e}")))?;
        let user = jid.to_bare();
        let resource = jid.resource().map(|r| r.as_str());
        let domain = jid.domain().as_str();
        let conn_id = ConnectionId::new(from.clone());

        if prebind {
            let session_id = packet
                .command_field("session-id")
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            self.login_user_session(conn_id, domain, &user, resource, session_id, false)?;
            self.send(packet.ok_result(None));
            return Ok(());
        }

        if !available {
            match self.connections.remove(&conn_id) {
                Some(conn) => {
                    debug!(conn_id = %conn_id, user = %user, "Removing user resource on request");
                    self.close_session(&conn, false);
                    self.send(packet.ok_result(None));
                }
                None => self.reply_error(
                    packet,
                    StanzaErrorCondition::ItemNotFound,
                    Some("The user resource you want to remove does not exist."),
                ),
            }
            return Ok(());
        }

        let mut presence = packet
            .command_child("presence")
            .map(|p| into_client_ns(p, None));
        if self.connections.contains(&conn_id) {
            debug!(conn_id = %conn_id, "User resource already available");
        } else {
            self.login_user_session(
                conn_id.clone(),
                domain,
                &user,
                resource,
                USER_STATUS_SESSION_ID.to_string(),
                false,
            )?;
            if presence.is_none() {
                presence = Some(
                    Element::builder("presence", ns::CLIENT)
                        .append(Element::builder("priority", ns::CLIENT).append("-1".to_string()))
                        .build(),
                );
            }
        }
        self.send(packet.ok_result(None));

        if let Some(presence) = presence {
            let presence = Packet::new(presence)?
                .with_packet_from(conn_id)
                .with_packet_to(self.component_conn_id());
            reinject.push_back(presence);
        }
        Ok(())
    }

    fn tls_handshake_complete(&self, packet: &Packet, conn: Option<&Arc<ResourceConnection>>) {
        let Some(conn) = conn else {
            debug!(packet = %packet, "TLS handshake report for unknown connection");
            return;
        };
        let fields = [
            ("tls-unique-id", TLS_UNIQUE_ID_KEY),
            ("peer-certificate", PEER_CERTIFICATE_KEY),
            ("local-certificate", LOCAL_CERTIFICATE_KEY),
        ];
        for (field, key) in fields {
            let Some(value) = packet.command_field(field) else {
                continue;
            };
            match STANDARD.decode(value.trim()) {
                Ok(bytes) => conn.put_data(key, bytes),
                Err(e) => debug!(field, error = %e, "Invalid base64 in TLS handshake field"),
            }
        }
    }

    fn stream_moved(&self, packet: &Packet, conn: Option<&Arc<ResourceConnection>>) {
        let Some(conn) = conn else {
            warn!(packet = %packet, "Stream move for unknown connection");
            return;
        };
        let Some(old) = packet.command_field("old-conn-jid") else {
            warn!(packet = %packet, "Stream move without old connection id");
            return;
        };
        let moved = ConnectionId::parse(&old)
            .and_then(|old_id| self.move_stream(conn, &old_id, packet.command_field("resumption-id")));
        if let Err(e) = moved {
            warn!(conn_id = %conn.id(), old_conn_id = %old, error = %e, "Failed to move stream");
        }
    }

    fn broadcast_to_online(&self, packet: &Packet) {
        let Some(payload) = packet
            .element()
            .children()
            .find(|child| child.ns() == ns::BROADCAST)
        else {
            debug!(packet = %packet, "Broadcast command without payload");
            return;
        };

        let sessions = match packet.command_field("to") {
            Some(to) => match Jid::new(&to) {
                Ok(to) => self.sessions.get(&to.to_bare()).into_iter().collect::<Vec<_>>(),
                Err(e) => {
                    debug!(to = %to, error = %e, "Invalid broadcast target");
                    return;
                }
            },
            None => self.sessions.sessions(),
        };

        let mut delivered = 0usize;
        for conn in sessions.iter().flat_map(|s| s.active_connections()) {
            let Some(jid) = conn.full_jid() else {
                continue;
            };
            let element = into_client_ns(payload, Some(&Jid::from(jid)));
            match Packet::new(element) {
                Ok(p) => {
                    self.send(
                        p.with_packet_from(self.component_conn_id())
                            .with_packet_to(conn.id()),
                    );
                    delivered += 1;
                }
                Err(e) => warn!(error = %e, "Failed to build broadcast packet"),
            }
        }
        debug!(delivered, "Broadcast delivered to online connections");
    }

    fn adhoc_command(
        &self,
        packet: &Packet,
        conn: Option<Arc<ResourceConnection>>,
        dispatch: &Dispatch,
    ) -> bool {
        let node = packet
            .element()
            .get_child("command", ns::COMMANDS)
            .and_then(|c| c.attr("node"))
            .unwrap_or_default();
        let to_component = packet.stanza_to().is_some_and(|to| self.is_component(to));

        let Some(command) = dispatch.pipeline.command(node) else {
            if !to_component {
                return false;
            }
            let from_component = packet
                .packet_from()
                .is_some_and(|from| self.is_component(from.as_jid()));
            if from_component {
                self.reply_error(
                    packet,
                    StanzaErrorCondition::FeatureNotImplemented,
                    Some("There is no implementation for such command on the server."),
                );
            } else {
                self.reply_error(packet, StanzaErrorCondition::ItemNotFound, None);
            }
            return true;
        };

        let permission = match &conn {
            Some(conn) => self.permission_for(Some(conn)),
            None => packet
                .stanza_from()
                .map_or(Permission::None, |from| self.policy.permission_for_jid(from)),
        };
        if permission < command.required_permission() {
            debug!(node, %permission, "Ad-hoc command refused");
            self.reply_error(
                packet,
                StanzaErrorCondition::NotAuthorized,
                Some("You are not authorized for this action."),
            );
            return true;
        }

        let mut queued = packet.clone();
        queued.set_permission(permission);
        let task = Task::Command(Arc::clone(command));
        if !self.enqueue(dispatch, ADHOC_POOL, task, queued, conn) {
            self.reply_error(
                packet,
                StanzaErrorCondition::ResourceConstraint,
                Some(OVERLOADED_TEXT),
            );
        }
        true
    }
}
