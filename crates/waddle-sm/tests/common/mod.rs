//! Test utilities for session manager integration tests.
//!
//! Provides in-memory repositories, a harness that drives a router the way
//! a connection manager would, and helpers for waiting on outbound packets.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jid::{BareJid, Jid};
use minidom::Element;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use waddle_sm::{
    ns, AuthRepository, Command, ConnectionId, Packet, PluginPipeline, ResourceConnection,
    SessionManagerConfig, StanzaRouter, StanzaType, UserRepository, XmppError,
};

/// Default timeout for waiting on outbound packets.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Address of the session manager in the default configuration.
pub const SM_JID: &str = "sess-man@localhost";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// Auth repository accepting any password equal to the account's local part.
#[derive(Default)]
pub struct MemoryAuth {
    pub logins: Mutex<Vec<BareJid>>,
    pub logouts: Mutex<Vec<BareJid>>,
}

impl MemoryAuth {
    pub fn logouts(&self) -> Vec<BareJid> {
        self.logouts.lock().clone()
    }
}

#[async_trait]
impl AuthRepository for MemoryAuth {
    async fn plain_auth(&self, user: &BareJid, password: &str) -> Result<bool, XmppError> {
        Ok(user.node().is_some_and(|node| node.as_str() == password))
    }

    async fn other_auth(
        &self,
        props: &HashMap<String, String>,
    ) -> Result<Option<BareJid>, XmppError> {
        Ok(props.get("user").and_then(|u| u.parse().ok()))
    }

    async fn logout(&self, user: &BareJid) -> Result<(), XmppError> {
        self.logouts.lock().push(user.clone());
        Ok(())
    }

    async fn logged_in(&self, user: &BareJid) -> Result<(), XmppError> {
        self.logins.lock().push(user.clone());
        Ok(())
    }

    async fn active_users_count_in(&self, _period: Duration) -> Result<usize, XmppError> {
        Ok(self.logins.lock().len())
    }
}

/// Key/value store kept in a map.
#[derive(Default)]
pub struct MemoryUserRepo {
    data: Mutex<HashMap<(BareJid, Option<String>, String), String>>,
}

#[async_trait]
impl UserRepository for MemoryUserRepo {
    async fn get_data(
        &self,
        user: &BareJid,
        subnode: Option<&str>,
        key: &str,
    ) -> Result<Option<String>, XmppError> {
        let k = (user.clone(), subnode.map(str::to_string), key.to_string());
        Ok(self.data.lock().get(&k).cloned())
    }

    async fn set_data(
        &self,
        user: &BareJid,
        subnode: Option<&str>,
        key: &str,
        value: &str,
    ) -> Result<(), XmppError> {
        let k = (user.clone(), subnode.map(str::to_string), key.to_string());
        self.data.lock().insert(k, value.to_string());
        Ok(())
    }

    async fn remove_data(
        &self,
        user: &BareJid,
        subnode: Option<&str>,
        key: &str,
    ) -> Result<(), XmppError> {
        let k = (user.clone(), subnode.map(str::to_string), key.to_string());
        self.data.lock().remove(&k);
        Ok(())
    }
}

/// A router plus the receiving end of its outbound channel.
pub struct TestHarness {
    pub router: StanzaRouter,
    pub outbound: mpsc::Receiver<Packet>,
    pub auth: Arc<MemoryAuth>,
}

impl TestHarness {
    pub fn new(config: SessionManagerConfig, pipeline: PluginPipeline) -> Self {
        init_tracing();
        let auth = Arc::new(MemoryAuth::default());
        let (router, outbound) = StanzaRouter::builder(config)
            .pipeline(pipeline)
            .auth_repository(auth.clone())
            .user_repository(Arc::new(MemoryUserRepo::default()))
            .build_with_channel()
            .expect("router should build");
        Self {
            router,
            outbound,
            auth,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SessionManagerConfig::default(), PluginPipeline::new())
    }

    /// Report a new stream and wait until the session manager confirms it.
    pub async fn open_stream(&mut self, id: &str) -> Arc<ResourceConnection> {
        let conn_id = conn_id(id);
        let open = Command::StreamOpened.packet_with_fields(
            conn_id.as_jid().clone(),
            sm_jid(),
            StanzaType::Set,
            format!("open-{id}"),
            &[("hostname", "localhost"), ("session-id", id)],
        );
        self.router.process(open);

        let reply_to = conn_id.clone();
        self.wait_for(|p| {
            p.stanza_type() == Some(StanzaType::Result) && p.packet_to() == Some(&reply_to)
        })
        .await;
        self.router
            .connection(&conn_id)
            .expect("connection should be registered")
    }

    /// Open, authorize and bind a connection.
    pub async fn login(&mut self, id: &str, user: &str, resource: &str) -> Arc<ResourceConnection> {
        let conn = self.open_stream(id).await;
        let user: BareJid = user.parse().expect("valid bare jid");
        self.router
            .authorize(&conn, &user, false)
            .await
            .expect("authorize");
        self.router
            .bind_resource(&conn, resource)
            .expect("bind resource");
        conn
    }

    /// Send a stanza as if it arrived on connection `id`.
    pub fn send_from(&self, id: &str, element: Element) -> waddle_sm::RoutingResult {
        let packet = Packet::new(element)
            .expect("valid stanza")
            .with_packet_from(conn_id(id));
        self.router.process(packet)
    }

    /// Receive outbound packets until one matches `pred`.
    pub async fn wait_for<F>(&mut self, pred: F) -> Packet
    where
        F: Fn(&Packet) -> bool,
    {
        self.wait_for_within(DEFAULT_TIMEOUT, pred).await
    }

    pub async fn wait_for_within<F>(&mut self, limit: Duration, pred: F) -> Packet
    where
        F: Fn(&Packet) -> bool,
    {
        let outbound = &mut self.outbound;
        timeout(limit, async {
            loop {
                let packet = outbound.recv().await.expect("outbound channel open");
                if pred(&packet) {
                    return packet;
                }
            }
        })
        .await
        .expect("timed out waiting for outbound packet")
    }

    /// Drain every packet currently queued on the outbound channel.
    pub fn drain(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(packet) = self.outbound.try_recv() {
            packets.push(packet);
        }
        packets
    }
}

pub fn conn_id(id: &str) -> ConnectionId {
    ConnectionId::parse(&format!("c2s@localhost/{id}")).expect("valid connection id")
}

pub fn sm_jid() -> Jid {
    SM_JID.parse().expect("valid component jid")
}

/// Command packet sent by the connection manager for stream `id`.
pub fn command(id: &str, command: Command, fields: &[(&str, &str)]) -> Packet {
    command.packet_with_fields(
        conn_id(id).into_jid(),
        sm_jid(),
        StanzaType::Set,
        format!("{}-{id}", command.node().to_lowercase()),
        fields,
    )
}

pub fn message(to: &str, body: &str) -> Element {
    Element::builder("message", ns::CLIENT)
        .attr("to", to)
        .attr("type", "chat")
        .append(Element::builder("body", ns::CLIENT).append(body.to_string()))
        .build()
}

pub fn presence(priority: i8) -> Element {
    Element::builder("presence", ns::CLIENT)
        .append(Element::builder("priority", ns::CLIENT).append(priority.to_string()))
        .build()
}

pub fn iq(to: &str, id: &str, query_ns: &str) -> Element {
    Element::builder("iq", ns::CLIENT)
        .attr("to", to)
        .attr("type", "get")
        .attr("id", id)
        .append(Element::builder("query", query_ns).build())
        .build()
}

/// Name of the stanza error condition carried by `packet`, if any.
pub fn error_condition(packet: &Packet) -> Option<String> {
    packet
        .element()
        .get_child("error", ns::CLIENT)?
        .children()
        .find(|c| c.ns() == ns::STANZAS && c.name() != "text")
        .map(|c| c.name().to_string())
}

/// Whether `packet` is the given internal command.
pub fn is_command(packet: &Packet, command: Command) -> bool {
    packet.command() == Some(command)
}
