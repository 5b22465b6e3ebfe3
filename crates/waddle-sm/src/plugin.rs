//! Plugin contract.
//!
//! A plugin takes one or more roles in the pipeline:
//!
//! - [`Preprocessor`]: runs synchronously before dispatch and may veto it
//! - [`Processor`]: claims packets through `can_handle` and processes them
//!   on its own worker pool
//! - [`Postprocessor`]: runs synchronously after dispatch
//! - [`OutputFilter`]: inspects or drops every outbound packet
//! - [`StopListener`]: notified when a connection is finalized
//!
//! Roles are registered explicitly on a [`PluginPipeline`](crate::PluginPipeline);
//! a plugin implementing several roles is registered once per role.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use jid::{BareJid, FullJid, Jid};
use minidom::Element;

use crate::config::Concurrency;
use crate::connection::ResourceConnection;
use crate::context::SessionContext;
use crate::error::Authorization;
use crate::packet::Packet;
use crate::permission::Permission;
use crate::repository::UserRepository;
use crate::session::UserSession;
use crate::XmppError;

/// Settings handed to a plugin on every call.
pub type PluginSettings = toml::Table;

/// Identity shared by every plugin role.
pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;
}

pub trait Preprocessor: Plugin {
    /// Inspect a packet before dispatch. Returning true stops processing.
    fn preprocess(
        &self,
        packet: &Packet,
        conn: Option<&Arc<ResourceConnection>>,
        settings: &PluginSettings,
        results: &mut Vec<Packet>,
    ) -> bool;
}

#[async_trait]
pub trait Processor: Plugin {
    /// Decide whether this processor takes the packet.
    ///
    /// `None` means not interested. `Some(Authorized)` queues the packet on
    /// the processor's pool; `Some(Denied(condition))` refuses it, which is
    /// reported to the sender if nothing else handles the packet.
    fn can_handle(&self, packet: &Packet, conn: Option<&ResourceConnection>)
        -> Option<Authorization>;

    /// Process a packet on a worker. Runs off the router path, so it may
    /// await repository calls.
    async fn process(
        &self,
        packet: &Packet,
        conn: Option<&Arc<ResourceConnection>>,
        ctx: &ProcessContext<'_>,
        results: &mut Vec<Packet>,
    ) -> Result<(), XmppError>;

    /// Queue layout this processor asks for. Configuration may override it.
    fn concurrency(&self) -> Option<Concurrency> {
        None
    }

    /// Stream features advertised to a connection.
    fn stream_features(&self, _conn: Option<&ResourceConnection>) -> Vec<Element> {
        Vec::new()
    }
}

pub trait Postprocessor: Plugin {
    fn postprocess(
        &self,
        packet: &Packet,
        conn: Option<&Arc<ResourceConnection>>,
        settings: &PluginSettings,
        results: &mut Vec<Packet>,
    );
}

pub trait OutputFilter: Plugin {
    /// Edit the outbound `results` produced for `packet`. Removing an entry
    /// drops it.
    fn filter(
        &self,
        packet: Option<&Packet>,
        conn: Option<&Arc<ResourceConnection>>,
        results: &mut Vec<Packet>,
    );
}

pub trait StopListener: Plugin {
    fn stopped(
        &self,
        conn: &Arc<ResourceConnection>,
        settings: &PluginSettings,
        results: &mut Vec<Packet>,
    );
}

/// Administrative command reachable through the ad-hoc command node.
#[async_trait]
pub trait AdHocCommand: Send + Sync {
    /// Command node, e.g. `http://jabber.org/protocol/admin#get-online-users-num`.
    fn node(&self) -> &str;

    /// Minimum permission tier of the sender.
    fn required_permission(&self) -> Permission {
        Permission::Admin
    }

    async fn execute(
        &self,
        packet: &Packet,
        conn: Option<&Arc<ResourceConnection>>,
        ctx: &ProcessContext<'_>,
        results: &mut Vec<Packet>,
    ) -> Result<(), XmppError>;
}

/// Role a plugin takes in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    Preprocessor,
    Processor,
    Postprocessor,
    OutputFilter,
    StopListener,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Preprocessor => write!(f, "preprocessor"),
            Capability::Processor => write!(f, "processor"),
            Capability::Postprocessor => write!(f, "postprocessor"),
            Capability::OutputFilter => write!(f, "filter"),
            Capability::StopListener => write!(f, "stop-listener"),
        }
    }
}

/// Summary of one registered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub id: String,
    pub capabilities: BTreeSet<Capability>,
    /// Declared by the processor role, if any
    pub concurrency: Option<Concurrency>,
}

/// What a processor or command sees of the session manager while it runs.
pub struct ProcessContext<'a> {
    pub(crate) sm: &'a SessionContext,
    settings: &'a PluginSettings,
}

impl<'a> ProcessContext<'a> {
    pub(crate) fn new(sm: &'a SessionContext, settings: &'a PluginSettings) -> Self {
        Self { sm, settings }
    }

    pub fn settings(&self) -> &PluginSettings {
        self.settings
    }

    /// Per-account key/value storage.
    pub fn user_repository(&self) -> &dyn UserRepository {
        self.sm.user_repo.as_ref()
    }

    /// Address of the session manager.
    pub fn component_id(&self) -> &Jid {
        self.sm.component_id()
    }

    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.sm.is_local_domain(domain)
    }

    /// Connection a stanza addressed to `jid` would be delivered to.
    pub fn resource_connection(&self, jid: &Jid) -> Option<Arc<ResourceConnection>> {
        self.sm.resource_connection(jid)
    }

    pub fn user_session(&self, jid: &BareJid) -> Option<Arc<UserSession>> {
        self.sm.sessions.get(jid)
    }

    /// Check a username/password pair and authorize the connection.
    pub async fn login_plain(
        &self,
        conn: &Arc<ResourceConnection>,
        user: &BareJid,
        password: &str,
    ) -> Result<(), XmppError> {
        self.sm.login_plain(conn, user, password).await
    }

    /// Check mechanism specific credentials and authorize the connection.
    pub async fn login_other(
        &self,
        conn: &Arc<ResourceConnection>,
        props: &std::collections::HashMap<String, String>,
    ) -> Result<BareJid, XmppError> {
        self.sm.login_other(conn, props).await
    }

    /// Authorize a connection whose credentials were checked elsewhere.
    pub async fn authorize(
        &self,
        conn: &Arc<ResourceConnection>,
        user: &BareJid,
        anonymous: bool,
    ) -> Result<(), XmppError> {
        self.sm.authorize(conn, user, anonymous).await
    }

    pub fn bind_resource(
        &self,
        conn: &Arc<ResourceConnection>,
        resource: &str,
    ) -> Result<FullJid, XmppError> {
        self.sm.bind_resource(conn, resource)
    }

    /// Record the connection's presence broadcast.
    pub fn set_presence(&self, conn: &Arc<ResourceConnection>, presence: &Element) -> i8 {
        self.sm.set_presence(conn, presence)
    }

    /// Log the connection out and ask the connection manager to close it.
    pub fn logout(&self, conn: &Arc<ResourceConnection>) {
        self.sm.logout(conn)
    }
}
