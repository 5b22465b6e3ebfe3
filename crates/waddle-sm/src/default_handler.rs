//! Built-in handling every packet gets before and after plugin dispatch.
//!
//! The preprocess step runs inline on the router: it counts packets, keeps
//! unauthenticated streams from sending messages or presences, and
//! stamps the connection's JID on outgoing stanzas. The delivery step runs
//! on the `default-handler` pool for packets no plugin claimed.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::connection::ResourceConnection;
use crate::context::{SessionContext, DEFAULT_HANDLER_POOL};
use crate::error::{Authorization, StanzaErrorCondition};
use crate::packet::{ns, Packet};
use crate::plugin::{Plugin, ProcessContext, Processor};
use crate::types::{StanzaKind, StanzaType};
use crate::XmppError;

const AUTH_FIRST: &str =
    "You must authenticate session first, before you can send any message or presence packet.";
const BIND_FIRST: &str =
    "You must bind the resource first: http://www.xmpp.org/rfcs/rfc3920.html#bind";

/// Fast-path check run before any plugin.
///
/// Returns true if the packet was fully handled here; any replies are
/// pushed to `results`.
pub(crate) fn preprocess(
    sm: &SessionContext,
    packet: &mut Packet,
    conn: Option<&Arc<ResourceConnection>>,
    results: &mut Vec<Packet>,
) -> bool {
    if let Some(conn) = conn {
        conn.inc_packets();
        if let Some(session) = conn.user().and_then(|user| sm.sessions.get(&user)) {
            session.inc_packets();
        }
    }

    if packet.name() == "features" && packet.element().ns() == ns::STREAM && packet.is_error() {
        trace!(packet = %packet, "Ignoring stream features error");
        return true;
    }

    let Some(conn) = conn else {
        return false;
    };
    if packet.packet_from() != Some(&conn.id()) {
        return false;
    }

    if !conn.is_authorized() {
        if matches!(packet.kind(), StanzaKind::Message | StanzaKind::Presence) {
            debug!(
                conn_id = %conn.id(),
                session_id = ?conn.session_id(),
                "Packet received before the session has been authenticated"
            );
            results.extend(sm.error_reply(packet, StanzaErrorCondition::NotAuthorized, Some(AUTH_FIRST)));
            return true;
        }
        return false;
    }

    let bind_or_compress = (packet.kind() == StanzaKind::Iq && packet.has_child("bind", ns::BIND))
        || (packet.name() == "compress" && packet.element().ns() == ns::COMPRESS);
    if !conn.is_resource_set() && !bind_or_compress {
        debug!(conn_id = %conn.id(), "Packet received before a resource was bound");
        results.extend(sm.error_reply(packet, StanzaErrorCondition::NotAuthorized, Some(BIND_FIRST)));
        return true;
    }

    match conn.jid() {
        Some(jid) => {
            let correct = packet
                .stanza_from()
                .is_some_and(|from| from.to_bare() == jid.to_bare());
            if !correct {
                let to = packet.stanza_to().cloned();
                packet.init_vars(Some(jid), to);
            }
        }
        None => warn!(conn_id = %conn.id(), "Session is authenticated but has no JID"),
    }
    false
}

/// Local delivery for packets no plugin claimed.
pub(crate) struct DefaultHandlerProc;

impl Plugin for DefaultHandlerProc {
    fn id(&self) -> &str {
        DEFAULT_HANDLER_POOL
    }
}

#[async_trait]
impl Processor for DefaultHandlerProc {
    fn can_handle(&self, packet: &Packet, conn: Option<&ResourceConnection>) -> Option<Authorization> {
        conn?;
        if packet.stanza_to().is_none() {
            let iq_result =
                packet.kind() == StanzaKind::Iq && packet.stanza_type() == Some(StanzaType::Result);
            return iq_result.then_some(Authorization::Authorized);
        }
        Some(Authorization::Authorized)
    }

    async fn process(
        &self,
        packet: &Packet,
        conn: Option<&Arc<ResourceConnection>>,
        ctx: &ProcessContext<'_>,
        results: &mut Vec<Packet>,
    ) -> Result<(), XmppError> {
        let Some(conn) = conn else {
            return Ok(());
        };
        let Some(to) = packet.stanza_to() else {
            trace!(packet = %packet, "Dropping iq result addressed to the server");
            return Ok(());
        };

        if conn.is_user_id(&to.to_bare()) {
            match ctx.resource_connection(to) {
                Some(target) => {
                    let mut result = packet.copy_element_only();
                    result.set_packet_from(packet.to_address());
                    result.set_packet_to(Some(target.id()));
                    results.push(result);
                }
                None => warn!(
                    packet = %packet,
                    "Packet to the server which hasn't been properly processed"
                ),
            }
            return Ok(());
        }

        let from_user = packet
            .stanza_from()
            .is_some_and(|from| conn.is_user_id(&from.to_bare()));
        if from_user {
            results.push(packet.copy_element_only());
        }
        Ok(())
    }
}
