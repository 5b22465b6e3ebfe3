//! Common types for the session manager.

use std::fmt;
use std::str::FromStr;

use jid::Jid;
use serde::{Deserialize, Serialize};

use crate::XmppError;

/// Address of one transport link, assigned by the connection manager.
///
/// Connection ids are JIDs (`c2s@host/127.0.0.1_5222_peer`) so they can be
/// carried in `from`/`to` attributes of internal command packets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Jid);

impl ConnectionId {
    /// Wrap an already validated JID.
    pub fn new(jid: Jid) -> Self {
        Self(jid)
    }

    /// Parse a connection id from its string form.
    pub fn parse(s: &str) -> Result<Self, XmppError> {
        Jid::new(s)
            .map(Self)
            .map_err(|e| XmppError::jid_malformed(format!("{s}: {e}")))
    }

    /// The id as a JID.
    pub fn as_jid(&self) -> &Jid {
        &self.0
    }

    /// Consume the id, returning the inner JID.
    pub fn into_jid(self) -> Jid {
        self.0
    }
}

impl From<Jid> for ConnectionId {
    fn from(jid: Jid) -> Self {
        Self(jid)
    }
}

impl FromStr for ConnectionId {
    type Err = XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq<Jid> for ConnectionId {
    fn eq(&self, other: &Jid) -> bool {
        &self.0 == other
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a resource connection.
///
/// ```text
/// Init ──auth──▶ Authorized ──stream-closed──▶ Closing ──finalize──▶ Closed
///   └───────────────────── auth timeout / close ──────────────────────▲
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthState {
    /// Stream opened, not yet authenticated
    Init,
    /// Credentials accepted
    Authorized,
    /// Stream closed, waiting for the finalize task or grace timer
    Closing,
    /// Finalized, terminal
    Closed,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthState::Init => write!(f, "init"),
            AuthState::Authorized => write!(f, "authorized"),
            AuthState::Closing => write!(f, "closing"),
            AuthState::Closed => write!(f, "closed"),
        }
    }
}

/// Top level element kind of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    /// Message stanza
    Message,
    /// Presence stanza
    Presence,
    /// IQ (info/query) stanza
    Iq,
    /// Anything else (e.g. `stream:features`)
    Other,
}

impl StanzaKind {
    /// Classify an element name.
    pub fn from_name(name: &str) -> Self {
        match name {
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            "iq" => StanzaKind::Iq,
            _ => StanzaKind::Other,
        }
    }
}

impl fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StanzaKind::Message => write!(f, "message"),
            StanzaKind::Presence => write!(f, "presence"),
            StanzaKind::Iq => write!(f, "iq"),
            StanzaKind::Other => write!(f, "other"),
        }
    }
}

/// Value of a stanza's `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaType {
    Get,
    Set,
    Result,
    Error,
    Chat,
    Normal,
    Groupchat,
    Headline,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
}

impl StanzaType {
    /// Parse a `type` attribute value. Unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "get" => StanzaType::Get,
            "set" => StanzaType::Set,
            "result" => StanzaType::Result,
            "error" => StanzaType::Error,
            "chat" => StanzaType::Chat,
            "normal" => StanzaType::Normal,
            "groupchat" => StanzaType::Groupchat,
            "headline" => StanzaType::Headline,
            "unavailable" => StanzaType::Unavailable,
            "subscribe" => StanzaType::Subscribe,
            "subscribed" => StanzaType::Subscribed,
            "unsubscribe" => StanzaType::Unsubscribe,
            "unsubscribed" => StanzaType::Unsubscribed,
            "probe" => StanzaType::Probe,
            _ => return None,
        })
    }

    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaType::Get => "get",
            StanzaType::Set => "set",
            StanzaType::Result => "result",
            StanzaType::Error => "error",
            StanzaType::Chat => "chat",
            StanzaType::Normal => "normal",
            StanzaType::Groupchat => "groupchat",
            StanzaType::Headline => "headline",
            StanzaType::Unavailable => "unavailable",
            StanzaType::Subscribe => "subscribe",
            StanzaType::Subscribed => "subscribed",
            StanzaType::Unsubscribe => "unsubscribe",
            StanzaType::Unsubscribed => "unsubscribed",
            StanzaType::Probe => "probe",
        }
    }
}

impl fmt::Display for StanzaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
