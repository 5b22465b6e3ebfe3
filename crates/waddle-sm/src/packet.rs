//! Addressable packets flowing through the session manager.
//!
//! A [`Packet`] wraps a parsed stanza element together with two address
//! pairs:
//!
//! - `stanza_from`/`stanza_to`: the `from`/`to` attributes of the element
//! - `packet_from`/`packet_to`: internal routing addresses, usually the
//!   connection id of the originating stream and the session manager's own
//!   component address
//!
//! Packets also carry the permission tier computed by the router and the
//! bookkeeping of which processors claimed, skipped or refused them.

use std::fmt;

use jid::Jid;
use minidom::Element;

use crate::error::{StanzaErrorCondition, StanzaErrorType};
use crate::permission::Permission;
use crate::types::{ConnectionId, StanzaKind, StanzaType};
use crate::XmppError;

/// XML namespaces used by the session manager.
pub mod ns {
    /// Client stanzas
    pub const CLIENT: &str = "jabber:client";
    /// Stream header and features
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stanza error conditions
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Stream error conditions
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// Ad-hoc commands (XEP-0050), also used for internal commands
    pub const COMMANDS: &str = "http://jabber.org/protocol/commands";
    /// Data forms (XEP-0004)
    pub const DATA: &str = "jabber:x:data";
    /// Resource binding
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Stream compression (XEP-0138)
    pub const COMPRESS: &str = "http://jabber.org/protocol/compress";
    /// Payload wrapper of broadcast-to-online commands
    pub const BROADCAST: &str = "http://tigase.org/protocol/broadcast";
}

/// Internal lifecycle commands exchanged with the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    StreamOpened,
    TlsHandshakeComplete,
    UserLogin,
    StreamClosed,
    StreamClosedUpdate,
    StreamFinished,
    CheckUserConnection,
    GetFeatures,
    Close,
    UserStatus,
    BroadcastToOnline,
    StreamMoved,
    /// Any other node, usually an ad-hoc command
    Other,
}

impl Command {
    /// Node attribute used on the wire.
    pub fn node(&self) -> &'static str {
        match self {
            Command::StreamOpened => "STREAM_OPENED",
            Command::TlsHandshakeComplete => "TLS_HANDSHAKE_COMPLETE",
            Command::UserLogin => "USER_LOGIN",
            Command::StreamClosed => "STREAM_CLOSED",
            Command::StreamClosedUpdate => "STREAM_CLOSED_UPDATE",
            Command::StreamFinished => "STREAM_FINISHED",
            Command::CheckUserConnection => "CHECK_USER_CONNECTION",
            Command::GetFeatures => "GETFEATURES",
            Command::Close => "CLOSE",
            Command::UserStatus => "USER_STATUS",
            Command::BroadcastToOnline => "BROADCAST_TO_ONLINE",
            Command::StreamMoved => "STREAM_MOVED",
            Command::Other => "OTHER",
        }
    }

    /// Map a node attribute to a command; unknown nodes are [`Command::Other`].
    pub fn from_node(node: &str) -> Self {
        match node {
            "STREAM_OPENED" => Command::StreamOpened,
            "TLS_HANDSHAKE_COMPLETE" => Command::TlsHandshakeComplete,
            "USER_LOGIN" => Command::UserLogin,
            "STREAM_CLOSED" => Command::StreamClosed,
            "STREAM_CLOSED_UPDATE" => Command::StreamClosedUpdate,
            "STREAM_FINISHED" => Command::StreamFinished,
            "CHECK_USER_CONNECTION" => Command::CheckUserConnection,
            "GETFEATURES" => Command::GetFeatures,
            "CLOSE" => Command::Close,
            "USER_STATUS" => Command::UserStatus,
            "BROADCAST_TO_ONLINE" => Command::BroadcastToOnline,
            "STREAM_MOVED" => Command::StreamMoved,
            _ => Command::Other,
        }
    }

    /// Build a command packet addressed from `from` to `to`.
    pub fn packet(
        self,
        from: Jid,
        to: Jid,
        stanza_type: StanzaType,
        id: impl Into<String>,
    ) -> Packet {
        self.packet_with_fields(from, to, stanza_type, id, &[])
    }

    /// Build a command packet carrying submitted data form fields.
    pub fn packet_with_fields(
        self,
        from: Jid,
        to: Jid,
        stanza_type: StanzaType,
        id: impl Into<String>,
        fields: &[(&str, &str)],
    ) -> Packet {
        let mut form = Element::builder("x", ns::DATA).attr("type", "submit");
        for (var, value) in fields {
            form = form.append(form_field(var, value));
        }

        let element = Element::builder("iq", ns::CLIENT)
            .attr("type", stanza_type.as_str())
            .attr("id", id.into())
            .attr("from", from.to_string())
            .attr("to", to.to_string())
            .append(
                Element::builder("command", ns::COMMANDS)
                    .attr("node", self.node())
                    .append(form),
            )
            .build();

        let mut packet = Packet::with_addresses(element, Some(from.clone()), Some(to.clone()));
        packet.packet_from = Some(ConnectionId::new(from));
        packet.packet_to = Some(ConnectionId::new(to));
        packet
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.node())
    }
}

fn form_field(var: &str, value: &str) -> Element {
    Element::builder("field", ns::DATA)
        .attr("var", var)
        .append(Element::builder("value", ns::DATA).append(value.to_string()))
        .build()
}

/// A stanza plus routing metadata.
#[derive(Debug, Clone)]
pub struct Packet {
    element: Element,
    kind: StanzaKind,
    stanza_type: Option<StanzaType>,
    stanza_from: Option<Jid>,
    stanza_to: Option<Jid>,
    packet_from: Option<ConnectionId>,
    packet_to: Option<ConnectionId>,
    command: Option<Command>,
    permission: Permission,
    processed_by: Vec<String>,
    skipped_by: Vec<String>,
    denied: Option<StanzaErrorCondition>,
}

impl Packet {
    /// Wrap a parsed element, validating its `from`/`to` attributes.
    pub fn new(element: Element) -> Result<Self, XmppError> {
        let from = parse_jid_attr(&element, "from")?;
        let to = parse_jid_attr(&element, "to")?;
        Ok(Self::with_addresses(element, from, to))
    }

    fn with_addresses(element: Element, stanza_from: Option<Jid>, stanza_to: Option<Jid>) -> Self {
        let kind = StanzaKind::from_name(element.name());
        let stanza_type = element.attr("type").and_then(StanzaType::parse);
        let command = match kind {
            StanzaKind::Iq => element
                .get_child("command", ns::COMMANDS)
                .map(|c| Command::from_node(c.attr("node").unwrap_or_default())),
            _ => None,
        };

        Self {
            element,
            kind,
            stanza_type,
            stanza_from,
            stanza_to,
            packet_from: None,
            packet_to: None,
            command,
            permission: Permission::None,
            processed_by: Vec::new(),
            skipped_by: Vec::new(),
            denied: None,
        }
    }

    /// Set the routing source address.
    pub fn with_packet_from(mut self, id: ConnectionId) -> Self {
        self.packet_from = Some(id);
        self
    }

    /// Set the routing destination address.
    pub fn with_packet_to(mut self, id: ConnectionId) -> Self {
        self.packet_to = Some(id);
        self
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    /// Element name of the stanza.
    pub fn name(&self) -> &str {
        self.element.name()
    }

    pub fn stanza_type(&self) -> Option<StanzaType> {
        self.stanza_type
    }

    pub fn is_error(&self) -> bool {
        self.stanza_type == Some(StanzaType::Error)
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    pub fn stanza_from(&self) -> Option<&Jid> {
        self.stanza_from.as_ref()
    }

    pub fn stanza_to(&self) -> Option<&Jid> {
        self.stanza_to.as_ref()
    }

    pub fn packet_from(&self) -> Option<&ConnectionId> {
        self.packet_from.as_ref()
    }

    pub fn packet_to(&self) -> Option<&ConnectionId> {
        self.packet_to.as_ref()
    }

    pub fn set_packet_from(&mut self, id: Option<ConnectionId>) {
        self.packet_from = id;
    }

    pub fn set_packet_to(&mut self, id: Option<ConnectionId>) {
        self.packet_to = id;
    }

    /// Routing source, falling back to the stanza `from`.
    pub fn from_address(&self) -> Option<ConnectionId> {
        self.packet_from
            .clone()
            .or_else(|| self.stanza_from.clone().map(ConnectionId::new))
    }

    /// Routing destination, falling back to the stanza `to`.
    pub fn to_address(&self) -> Option<ConnectionId> {
        self.packet_to
            .clone()
            .or_else(|| self.stanza_to.clone().map(ConnectionId::new))
    }

    pub fn command(&self) -> Option<Command> {
        self.command
    }

    pub fn is_command(&self) -> bool {
        self.command.is_some()
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn set_permission(&mut self, permission: Permission) {
        self.permission = permission;
    }

    /// Whether the element has a direct child `name` in namespace `ns`.
    pub fn has_child(&self, name: &str, ns: &str) -> bool {
        self.element.has_child(name, ns)
    }

    /// Record that `id` took responsibility for this packet.
    pub fn processed_by(&mut self, id: impl Into<String>) {
        self.processed_by.push(id.into());
    }

    pub fn was_processed(&self) -> bool {
        !self.processed_by.is_empty()
    }

    pub fn processor_ids(&self) -> &[String] {
        &self.processed_by
    }

    /// Record that `id` wanted the packet but its queue was full.
    pub fn not_processed_by(&mut self, id: impl Into<String>) {
        self.skipped_by.push(id.into());
    }

    pub fn was_skipped(&self) -> bool {
        !self.skipped_by.is_empty()
    }

    pub fn skipped_ids(&self) -> &[String] {
        &self.skipped_by
    }

    /// Record a refusal from a processor's `can_handle`. The first one wins.
    pub fn deny(&mut self, condition: StanzaErrorCondition) {
        self.denied.get_or_insert(condition);
    }

    pub fn denied(&self) -> Option<StanzaErrorCondition> {
        self.denied
    }

    /// Replace the stanza addresses, rewriting the element attributes.
    pub fn init_vars(&mut self, from: Option<Jid>, to: Option<Jid>) {
        self.element = readdress(
            &self.element,
            from.as_ref(),
            to.as_ref(),
            self.element.attr("type"),
            true,
        );
        self.stanza_from = from;
        self.stanza_to = to;
    }

    /// Copy of the stanza without routing addresses or processing state.
    pub fn copy_element_only(&self) -> Packet {
        let mut copy = Packet::with_addresses(
            self.element.clone(),
            self.stanza_from.clone(),
            self.stanza_to.clone(),
        );
        copy.permission = self.permission;
        copy
    }

    /// Build the error reply for this packet.
    ///
    /// The original children are kept, addresses are swapped in both the
    /// stanza and the routing pair. Fails for packets that are already
    /// errors, as replying to those would loop.
    pub fn error_response(
        &self,
        condition: StanzaErrorCondition,
        text: Option<&str>,
    ) -> Result<Packet, XmppError> {
        self.error_response_with_type(condition, condition.default_type(), text)
    }

    /// Like [`error_response`](Self::error_response) with an explicit error type.
    pub fn error_response_with_type(
        &self,
        condition: StanzaErrorCondition,
        error_type: StanzaErrorType,
        text: Option<&str>,
    ) -> Result<Packet, XmppError> {
        if self.is_error() {
            return Err(XmppError::PacketErrorType);
        }

        let mut element = readdress(
            &self.element,
            self.stanza_to.as_ref(),
            self.stanza_from.as_ref(),
            Some(StanzaType::Error.as_str()),
            true,
        );
        element.append_child(condition.to_element(error_type, text));

        Ok(self.reply(element))
    }

    /// Empty `result` reply, optionally carrying a payload.
    pub fn ok_result(&self, payload: Option<Element>) -> Packet {
        let mut element = readdress(
            &self.element,
            self.stanza_to.as_ref(),
            self.stanza_from.as_ref(),
            Some(StanzaType::Result.as_str()),
            false,
        );
        if let Some(payload) = payload {
            element.append_child(payload);
        }
        self.reply(element)
    }

    /// Completed command result carrying `payload` inside the command element.
    pub fn command_result(&self, payload: Vec<Element>) -> Packet {
        let node = self.command.map(|c| c.node()).unwrap_or(Command::Other.node());
        let mut command = Element::builder("command", ns::COMMANDS)
            .attr("node", node)
            .attr("status", "completed")
            .build();
        for child in payload {
            command.append_child(child);
        }
        self.ok_result(Some(command))
    }

    fn reply(&self, element: Element) -> Packet {
        let mut reply = Packet::with_addresses(
            element,
            self.stanza_to.clone(),
            self.stanza_from.clone(),
        );
        reply.packet_from = self.to_address();
        reply.packet_to = self.from_address();
        reply.permission = self.permission;
        reply
    }

    /// Value of a submitted data form field of a command packet.
    pub fn command_field(&self, var: &str) -> Option<String> {
        self.element
            .get_child("command", ns::COMMANDS)?
            .get_child("x", ns::DATA)?
            .children()
            .find(|f| f.name() == "field" && f.attr("var") == Some(var))?
            .get_child("value", ns::DATA)
            .map(|v| v.text())
    }

    /// Append `data` to the command element of a command packet.
    pub fn append_command_data(&mut self, data: Element) {
        if let Some(command) = self.element.get_child_mut("command", ns::COMMANDS) {
            command.append_child(data);
        }
    }

    /// First child of the command element with the given local name.
    pub fn command_child(&self, name: &str) -> Option<&Element> {
        self.element
            .get_child("command", ns::COMMANDS)?
            .children()
            .find(|c| c.name() == name)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.element.name())?;
        if let Some(t) = self.stanza_type {
            write!(f, " type={t}")?;
        }
        if let Some(id) = self.id() {
            write!(f, " id={id}")?;
        }
        if let Some(command) = self.command {
            write!(f, " command={command}")?;
        }
        if let Some(from) = &self.stanza_from {
            write!(f, " from={from}")?;
        }
        if let Some(to) = &self.stanza_to {
            write!(f, " to={to}")?;
        }
        if let Some(from) = &self.packet_from {
            write!(f, " packet_from={from}")?;
        }
        if let Some(to) = &self.packet_to {
            write!(f, " packet_to={to}")?;
        }
        write!(f, ">")
    }
}

fn parse_jid_attr(element: &Element, attr: &str) -> Result<Option<Jid>, XmppError> {
    match element.attr(attr) {
        None | Some("") => Ok(None),
        Some(value) => Jid::new(value)
            .map(Some)
            .map_err(|e| XmppError::jid_malformed(format!("{attr}='{value}': {e}"))),
    }
}

/// Rebuild `src` with new addressing and type, keeping its id and optionally
/// its children.
fn readdress(
    src: &Element,
    from: Option<&Jid>,
    to: Option<&Jid>,
    stanza_type: Option<&str>,
    keep_children: bool,
) -> Element {
    let mut builder = Element::builder(src.name(), src.ns());
    if let Some(id) = src.attr("id") {
        builder = builder.attr("id", id);
    }
    if let Some(stanza_type) = stanza_type {
        builder = builder.attr("type", stanza_type);
    }
    if let Some(from) = from {
        builder = builder.attr("from", from.to_string());
    }
    if let Some(to) = to {
        builder = builder.attr("to", to.to_string());
    }
    if keep_children {
        for child in src.children() {
            builder = builder.append(child.clone());
        }
    }
    builder.build()
}

/// Copy `src` into the `jabber:client` namespace, optionally readdressed to `to`.
pub(crate) fn into_client_ns(src: &Element, to: Option<&Jid>) -> Element {
    let mut builder = Element::builder(src.name(), ns::CLIENT);
    for attr in ["id", "type", "from"] {
        if let Some(value) = src.attr(attr) {
            builder = builder.attr(attr, value);
        }
    }
    match to {
        Some(to) => builder = builder.attr("to", to.to_string()),
        None => {
            if let Some(value) = src.attr("to") {
                builder = builder.attr("to", value);
            }
        }
    }
    for child in src.children() {
        builder = builder.append(child.clone());
    }
    builder.build()
}
