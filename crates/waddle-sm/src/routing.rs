//! Packet routing through the session manager.
//!
//! This module provides the [`StanzaRouter`], the entry point for every
//! packet the connection manager hands to the session manager.
//!
//! # Routing Logic
//!
//! For each packet, the router:
//! 1. Consumes responses to liveness checks and internal commands
//! 2. Finds the connection the packet belongs to, by `packet_from` or by
//!    the resource its stanza is addressed to
//! 3. Drops broken packets and handles messages addressed to a local domain
//! 4. Runs the built-in checks, then the preprocessors
//! 5. Offers the packet to every processor that accepts it, each on its
//!    own worker pool
//! 6. Runs the postprocessors and, if nobody claimed the packet, local
//!    default delivery
//! 7. Answers packets nothing handled with a stanza error
//!
//! # Example
//!
//! ```ignore
//! use waddle_sm::{PluginPipeline, SessionManagerConfig, StanzaRouter};
//!
//! let (router, mut outbound) = StanzaRouter::builder(SessionManagerConfig::default())
//!     .pipeline(PluginPipeline::new().with_processor(Arc::new(MyPlugin)))
//!     .auth_repository(auth)
//!     .user_repository(users)
//!     .build_with_channel()?;
//!
//! router.process(packet);
//! while let Some(packet) = outbound.recv().await {
//!     transport.deliver(packet).await;
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::SessionManagerConfig;
use crate::connection::ResourceConnection;
use crate::context::{
    Collaborators, Dispatch, SessionContext, DEFAULT_HANDLER_POOL, OVERLOADED_TEXT,
};
use crate::default_handler;
use crate::error::{Authorization, StanzaErrorCondition};
use crate::events::{BroadcastEventBus, EventBus, SessionEvent};
use crate::metrics;
use crate::outbound::{ChannelSink, OutboundSink};
use crate::packet::{Command, Packet};
use crate::pipeline::PluginPipeline;
use crate::plugin::PluginDescriptor;
use crate::repository::{AuthRepository, UserRepository};
use crate::session::UserSession;
use crate::stats::StatsSnapshot;
use crate::types::{ConnectionId, StanzaKind, StanzaType};
use crate::worker::Task;
use crate::XmppError;

const SERVICE_UNAVAILABLE_TEXT: &str = "Service not available.";
const NOT_IMPLEMENTED_TEXT: &str = "Feature not supported yet.";

/// Result of routing one packet.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingResult {
    /// Packet was an internal command, or a response to one
    Command,
    /// Packet was handled inline without reaching any processor
    Handled,
    /// Packet was dropped without a reply
    Dropped,
    /// Packet was queued on the pools of these processors
    Dispatched {
        /// Ids of the processors that accepted the packet
        processors: Vec<String>,
    },
    /// Packet was answered with a stanza error
    Rejected {
        /// Condition of the error sent back
        condition: StanzaErrorCondition,
    },
}

/// Entry point of the session manager.
///
/// Cheap to clone; all clones share the same registries and pools.
#[derive(Clone)]
pub struct StanzaRouter {
    ctx: Arc<SessionContext>,
}

impl StanzaRouter {
    pub fn builder(config: SessionManagerConfig) -> StanzaRouterBuilder {
        StanzaRouterBuilder::new(config)
    }

    /// Route one packet, and any packet it causes to be reinjected.
    ///
    /// Returns the result of routing `packet` itself. Must be called from
    /// within a tokio runtime.
    pub fn process(&self, packet: Packet) -> RoutingResult {
        if self.ctx.shutdown.is_cancelled() {
            debug!(packet = %packet, "Session manager stopped, dropping packet");
            return RoutingResult::Dropped;
        }

        let mut pending = VecDeque::new();
        let result = self.route_one(packet, &mut pending);
        while let Some(next) = pending.pop_front() {
            let reinjected = self.route_one(next, &mut pending);
            trace!(result = ?reinjected, "Routed reinjected packet");
        }
        result
    }

    #[instrument(skip_all, fields(kind = ?packet.kind(), from = ?packet.packet_from()))]
    fn route_one(&self, packet: Packet, pending: &mut VecDeque<Packet>) -> RoutingResult {
        let ctx = &self.ctx;
        ctx.stats.inc_packets();
        metrics::record_packet(packet.name());

        if ctx.take_check_response(&packet) {
            return RoutingResult::Command;
        }
        if packet.is_command() && ctx.process_command(&packet, pending) {
            return RoutingResult::Command;
        }

        let mut packet = packet;
        let conn = self.connection_for_packet(&packet);
        if conn.is_none() {
            if let Some(result) = self.check_broken(&mut packet) {
                return result;
            }
        }
        if self.admins_or_domains(&mut packet, pending) {
            return RoutingResult::Handled;
        }
        self.route(packet, conn, pending)
    }

    /// Connection the packet came from, or the one it is addressed to.
    fn connection_for_packet(&self, packet: &Packet) -> Option<Arc<ResourceConnection>> {
        if let Some(conn) = packet.packet_from().and_then(|id| self.ctx.connections.get(id)) {
            return Some(conn);
        }
        packet
            .stanza_to()
            .and_then(|to| self.ctx.resource_connection(to))
    }

    /// Checks a packet with no known connection.
    ///
    /// Returns `Some` if the packet must not be routed any further.
    fn check_broken(&self, packet: &mut Packet) -> Option<RoutingResult> {
        let ctx = &self.ctx;
        let from_component = packet
            .packet_from()
            .is_some_and(|from| ctx.is_component(from.as_jid()));
        if from_component && packet.packet_to().is_none() {
            return None;
        }

        let Some(from) = packet.from_address() else {
            debug!(packet = %packet, "Dropping packet without sender address");
            return Some(RoutingResult::Dropped);
        };

        let consistent = packet
            .stanza_from()
            .is_some_and(|stanza_from| from.as_jid() == stanza_from);
        let plain = packet.command().map_or(true, |c| c == Command::Other);
        if consistent || !plain {
            return None;
        }

        if let Some(stanza_from) = packet.stanza_from() {
            if !ctx.is_local_domain(stanza_from.domain().as_str()) {
                trace!(packet = %packet, "Forwarding packet from a remote sender");
                packet.set_packet_from(None);
                packet.set_packet_to(None);
                ctx.send(packet.clone());
                return Some(RoutingResult::Handled);
            }
        }

        if packet.stanza_to().is_some_and(|to| to.resource().is_none()) {
            return None;
        }

        if matches!(packet.kind(), StanzaKind::Iq | StanzaKind::Message) {
            debug!(packet = %packet, "Connection for packet is gone, answering with an error");
            let condition = StanzaErrorCondition::ServiceUnavailable;
            if let Some(mut reply) = ctx.error_reply(packet, condition, Some(SERVICE_UNAVAILABLE_TEXT)) {
                reply.set_packet_to(Some(from));
                ctx.send(reply);
                return Some(RoutingResult::Rejected { condition });
            }
        }
        trace!(packet = %packet, "Dropping packet for a closed connection");
        Some(RoutingResult::Dropped)
    }

    /// Messages and iq results addressed to a local domain itself.
    fn admins_or_domains(&self, packet: &mut Packet, pending: &mut VecDeque<Packet>) -> bool {
        let ctx = &self.ctx;
        if packet.stanza_from().is_none() && packet.packet_from().is_some() {
            return false;
        }
        if !packet.stanza_to().is_some_and(|to| ctx.is_local_domain_jid(to)) {
            return false;
        }

        match packet.kind() {
            StanzaKind::Message => {
                let from = packet.stanza_from().cloned();
                for admin in ctx.policy.admins() {
                    trace!(admin = %admin, "Forwarding message to administrator");
                    let mut copy = packet.copy_element_only();
                    copy.init_vars(from.clone(), Some(Jid::from(admin.clone())));
                    pending.push_back(copy);
                }
                packet.processed_by("admins-or-domains");
                true
            }
            StanzaKind::Iq if packet.stanza_type() == Some(StanzaType::Result) => {
                packet.processed_by("iq-result-to-server");
                true
            }
            _ => false,
        }
    }

    fn route(
        &self,
        mut packet: Packet,
        conn: Option<Arc<ResourceConnection>>,
        pending: &mut VecDeque<Packet>,
    ) -> RoutingResult {
        let ctx = &self.ctx;
        let dispatch = ctx.dispatch();
        let conn_ref = conn.as_ref();
        let mut results = Vec::new();

        packet.set_packet_to(Some(ctx.component_conn_id()));

        if default_handler::preprocess(ctx, &mut packet, conn_ref, &mut results) {
            packet.processed_by("filter-forward");
            ctx.tag_results(conn_ref, &mut results);
            ctx.emit(Some(&packet), conn_ref, results);
            return RoutingResult::Handled;
        }

        let mut stopped = false;
        for pre in dispatch.pipeline.preprocessors() {
            if pre.preprocess(&packet, conn_ref, dispatch.settings_for(pre.id()), &mut results) {
                debug!(plugin = %pre.id(), packet = %packet, "Packet blocked by preprocessor");
                stopped = true;
                break;
            }
        }

        packet.set_permission(ctx.permission_for(conn_ref));

        if !stopped {
            self.walk(&dispatch, &mut packet, conn_ref);

            for post in dispatch.pipeline.postprocessors() {
                post.postprocess(&packet, conn_ref, dispatch.settings_for(post.id()), &mut results);
            }

            let local = packet
                .stanza_to()
                .map_or(true, |to| !ctx.is_local_domain_jid(to));
            let default_handler = &ctx.internal.default_handler;
            // A packet a processor wanted but could not queue is answered
            // with resource-constraint, not delivered around that processor.
            if !packet.was_processed()
                && !packet.was_skipped()
                && local
                && default_handler.can_handle(&packet, conn.as_deref())
                    == Some(Authorization::Authorized)
            {
                let task = Task::Processor(Arc::clone(default_handler));
                if ctx.enqueue(&dispatch, DEFAULT_HANDLER_POOL, task, packet.clone(), conn.clone()) {
                    packet.processed_by(DEFAULT_HANDLER_POOL);
                } else {
                    packet.not_processed_by(DEFAULT_HANDLER_POOL);
                }
            }
        }

        ctx.tag_results(conn_ref, &mut results);
        ctx.emit(Some(&packet), conn_ref, results);

        if packet.was_processed() {
            return RoutingResult::Dispatched {
                processors: packet.processor_ids().to_vec(),
            };
        }
        if self.admins_or_domains(&mut packet, pending) {
            return RoutingResult::Handled;
        }
        self.reject(&packet, conn_ref, stopped)
    }

    /// Offer `packet` to every processor that accepts it.
    fn walk(&self, dispatch: &Dispatch, packet: &mut Packet, conn: Option<&Arc<ResourceConnection>>) {
        for processor in dispatch.pipeline.processors() {
            let id = processor.id();
            match processor.can_handle(packet, conn.map(Arc::as_ref)) {
                Some(Authorization::Authorized) => {
                    let task = Task::Processor(Arc::clone(processor));
                    if self.ctx.enqueue(dispatch, id, task, packet.clone(), conn.cloned()) {
                        packet.processed_by(id);
                    } else {
                        packet.not_processed_by(id);
                    }
                }
                Some(Authorization::Denied(condition)) => {
                    trace!(plugin = %id, condition = condition.as_str(), "Processor denied packet");
                    packet.deny(condition);
                }
                None => {}
            }
        }
    }

    /// Answer a packet nothing handled.
    fn reject(
        &self,
        packet: &Packet,
        conn: Option<&Arc<ResourceConnection>>,
        stopped: bool,
    ) -> RoutingResult {
        let ctx = &self.ctx;
        let has_sender = packet.stanza_from().is_some() || conn.is_some();
        let undeliverable = conn.is_none()
            && packet.stanza_from().is_some()
            && packet.stanza_to().is_some_and(|to| !ctx.is_component(to))
            && matches!(packet.kind(), StanzaKind::Iq | StanzaKind::Message);

        let (condition, text) = if stopped || undeliverable {
            (StanzaErrorCondition::ServiceUnavailable, Some(SERVICE_UNAVAILABLE_TEXT))
        } else if has_sender && packet.was_skipped() {
            (StanzaErrorCondition::ResourceConstraint, Some(OVERLOADED_TEXT))
        } else if let Some(condition) = packet.denied().filter(|_| has_sender) {
            (condition, None)
        } else if has_sender {
            (StanzaErrorCondition::FeatureNotImplemented, Some(NOT_IMPLEMENTED_TEXT))
        } else {
            trace!(packet = %packet, "Dropping packet nobody handled");
            return RoutingResult::Dropped;
        };

        let Some(mut reply) = ctx.error_reply(packet, condition, text) else {
            return RoutingResult::Dropped;
        };
        if let Some(target) = reply.stanza_to().and_then(|to| ctx.resource_connection(to)) {
            reply.set_packet_to(Some(target.id()));
        }
        debug!(condition = condition.as_str(), packet = %packet, "Packet not processed");
        ctx.send(reply);
        RoutingResult::Rejected { condition }
    }

    /// Install a new plugin pipeline. Pools of unchanged processors keep
    /// their queues.
    pub fn reload(&self, pipeline: PluginPipeline) -> Result<(), XmppError> {
        self.ctx.reload(pipeline)
    }

    /// Stop the worker pools, timers and the reaper, and publish
    /// [`SessionEvent::Shutdown`].
    pub fn shutdown(&self) {
        self.ctx.shutdown_now();
    }

    pub fn is_shutdown(&self) -> bool {
        self.ctx.shutdown.is_cancelled()
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.ctx.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        let ctx = &self.ctx;
        let stats = &ctx.stats;
        StatsSnapshot {
            packets: stats.packets(),
            auth_timeouts: stats.auth_timeouts(),
            closed_connections: stats.closed_connections(),
            stale_removed: stats.stale_removed(),
            errors_synthesized: stats.errors_synthesized(),
            open_sessions: ctx.sessions.len(),
            open_connections: ctx.connections.len(),
            max_sessions: ctx.sessions.max_sessions(),
            max_connections: ctx.connections.max_connections(),
            total_connections: ctx.connections.total_connections(),
            pools: ctx.dispatch().scheduler.stats(),
        }
    }

    /// Descriptors of the installed plugins.
    pub fn plugins(&self) -> Vec<PluginDescriptor> {
        self.ctx.dispatch().pipeline.descriptors()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    /// Trust a bare JID or domain. Returns false if it already was.
    pub fn add_trusted(&self, jid: &Jid) -> bool {
        self.ctx.policy.add_trusted(jid)
    }

    pub fn del_trusted(&self, jid: &Jid) -> bool {
        self.ctx.policy.del_trusted(jid)
    }

    pub fn is_trusted(&self, jid: &Jid) -> bool {
        self.ctx.policy.is_trusted(jid)
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<ResourceConnection>> {
        self.ctx.connections.get(id)
    }

    pub fn session(&self, jid: &BareJid) -> Option<Arc<UserSession>> {
        self.ctx.sessions.get(jid)
    }

    /// Connection a stanza addressed to `jid` would be delivered to.
    pub fn resource_connection(&self, jid: &Jid) -> Option<Arc<ResourceConnection>> {
        self.ctx.resource_connection(jid)
    }

    /// Authorize a connection whose credentials were checked elsewhere.
    pub async fn authorize(
        &self,
        conn: &Arc<ResourceConnection>,
        user: &BareJid,
        anonymous: bool,
    ) -> Result<(), XmppError> {
        self.ctx.authorize(conn, user, anonymous).await
    }

    /// Check a username/password pair and authorize the connection.
    pub async fn login_plain(
        &self,
        conn: &Arc<ResourceConnection>,
        user: &BareJid,
        password: &str,
    ) -> Result<(), XmppError> {
        self.ctx.login_plain(conn, user, password).await
    }

    pub async fn login_other(
        &self,
        conn: &Arc<ResourceConnection>,
        props: &HashMap<String, String>,
    ) -> Result<BareJid, XmppError> {
        self.ctx.login_other(conn, props).await
    }

    pub fn bind_resource(
        &self,
        conn: &Arc<ResourceConnection>,
        resource: &str,
    ) -> Result<FullJid, XmppError> {
        self.ctx.bind_resource(conn, resource)
    }

    /// Record a presence broadcast, returning its priority.
    pub fn set_presence(&self, conn: &Arc<ResourceConnection>, presence: &Element) -> i8 {
        self.ctx.set_presence(conn, presence)
    }

    /// Log a connection out and ask the connection manager to close it.
    pub fn logout(&self, conn: &Arc<ResourceConnection>) {
        self.ctx.logout(conn)
    }

    /// Mark a connection as suspected stale. It is removed by the next
    /// sweep if it is still attached to a session.
    pub fn queue_stale(&self, id: ConnectionId) -> bool {
        self.ctx.reaper.queue_for_close(id)
    }

    /// Run a reaper sweep now, returning the number of connections removed.
    pub fn sweep_stale(&self) -> usize {
        self.ctx.sweep_stale()
    }

    /// Number of accounts active within `period`.
    pub async fn active_users(&self, period: Duration) -> Result<usize, XmppError> {
        self.ctx.auth.active_users_count_in(period).await
    }
}

impl std::fmt::Debug for StanzaRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StanzaRouter").field("ctx", &self.ctx).finish()
    }
}

impl SessionContext {
    pub(crate) fn shutdown_now(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(
            connections = self.connections.len(),
            sessions = self.sessions.len(),
            "Shutting down session manager"
        );
        self.shutdown.cancel();
        self.timers.shutdown();
        self.dispatch().scheduler.shutdown();
        self.events.publish(SessionEvent::Shutdown);
    }
}

/// Builder for [`StanzaRouter`].
pub struct StanzaRouterBuilder {
    config: SessionManagerConfig,
    pipeline: PluginPipeline,
    auth: Option<Arc<dyn AuthRepository>>,
    user_repo: Option<Arc<dyn UserRepository>>,
    events: Option<Arc<dyn EventBus>>,
}

impl StanzaRouterBuilder {
    pub fn new(config: SessionManagerConfig) -> Self {
        Self {
            config,
            pipeline: PluginPipeline::new(),
            auth: None,
            user_repo: None,
            events: None,
        }
    }

    pub fn pipeline(mut self, pipeline: PluginPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn auth_repository(mut self, auth: Arc<dyn AuthRepository>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn user_repository(mut self, user_repo: Arc<dyn UserRepository>) -> Self {
        self.user_repo = Some(user_repo);
        self
    }

    /// Event bus to publish on. Defaults to a [`BroadcastEventBus`].
    pub fn event_bus(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build a router that emits into a new [`ChannelSink`], returning the
    /// receiving end with it.
    pub fn build_with_channel(
        self,
    ) -> Result<(StanzaRouter, tokio::sync::mpsc::Receiver<Packet>), XmppError> {
        let (sink, receiver) = ChannelSink::new(self.config.sink_capacity);
        let router = self.build(Arc::new(sink))?;
        Ok((router, receiver))
    }

    /// Build a router emitting into `sink`.
    ///
    /// Spawns the reaper and the shutdown listener, so it must be called
    /// from within a tokio runtime.
    pub fn build(self, sink: Arc<dyn OutboundSink>) -> Result<StanzaRouter, XmppError> {
        let auth = self
            .auth
            .ok_or_else(|| XmppError::config("an auth repository is required"))?;
        let user_repo = self
            .user_repo
            .ok_or_else(|| XmppError::config("a user repository is required"))?;
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(BroadcastEventBus::default()));

        let ctx = SessionContext::new(
            self.config,
            self.pipeline,
            Collaborators {
                auth,
                user_repo,
                events,
                sink,
            },
        )?;

        spawn_reaper(&ctx);
        spawn_shutdown_listener(&ctx);

        info!(
            component = %ctx.component_id(),
            domains = ?ctx.config.local_domains,
            plugins = ctx.dispatch().pipeline.descriptors().len(),
            "Session manager started"
        );
        Ok(StanzaRouter { ctx })
    }
}

fn spawn_reaper(ctx: &Arc<SessionContext>) {
    let weak = Arc::downgrade(ctx);
    let token = ctx.shutdown.child_token();
    let period = ctx.config.reaper.interval();

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(ctx) = weak.upgrade() else { break };
                    ctx.sweep_stale();
                }
            }
        }
        debug!("Stale connection reaper stopped");
    });
}

fn spawn_shutdown_listener(ctx: &Arc<SessionContext>) {
    let weak = Arc::downgrade(ctx);
    let token = ctx.shutdown.child_token();
    let mut events = ctx.events.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(SessionEvent::Shutdown) => {
                        if let Some(ctx) = weak.upgrade() {
                            ctx.shutdown_now();
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Shutdown listener lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}
