//! Shared state of one session manager instance.
//!
//! [`SessionContext`] owns the registries, the collaborators and the
//! currently installed [`Dispatch`] (plugin pipeline plus worker pools).
//! The router, the worker pools and the timers all reach it through an
//! `Arc`, or a `Weak` for work that must not keep it alive.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Instant;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use jid::{BareJid, Jid};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::{Concurrency, SessionManagerConfig};
use crate::connection::ResourceConnection;
use crate::default_handler::DefaultHandlerProc;
use crate::error::StanzaErrorCondition;
use crate::events::EventBus;
use crate::lifecycle::{SessionCloseProc, SessionOpenProc};
use crate::metrics;
use crate::outbound::{OutboundSink, SendResult};
use crate::packet::Packet;
use crate::permission::{AccessPolicy, Permission};
use crate::pipeline::PluginPipeline;
use crate::plugin::{PluginSettings, ProcessContext, Processor};
use crate::reaper::StaleConnectionReaper;
use crate::registry::{ConnectionRegistry, SessionRegistry};
use crate::repository::{AuthRepository, UserRepository};
use crate::stats::SessionManagerStats;
use crate::timer::{TimerHandle, TimerService};
use crate::types::ConnectionId;
use crate::worker::{ItemExecutor, QueueItem, Scheduler, Task, DEFAULT_POOL};
use crate::XmppError;

/// Pool running the stream-open handler.
pub(crate) const SESSION_OPEN_POOL: &str = "session-open";
/// Pool running the finalize task of closed streams.
pub(crate) const SESSION_CLOSE_POOL: &str = "session-close";
/// Pool running local default delivery.
pub(crate) const DEFAULT_HANDLER_POOL: &str = "default-handler";
/// Pool running registered ad-hoc commands.
pub(crate) const ADHOC_POOL: &str = "adhoc-commands";

/// Text of resource-constraint errors for full queues.
pub(crate) const OVERLOADED_TEXT: &str =
    "Server subsystem overloaded, service temporarily unavailable.";

/// Ids plugins may not use, as they name internal pools.
pub(crate) const RESERVED_IDS: [&str; 5] = [
    SESSION_OPEN_POOL,
    SESSION_CLOSE_POOL,
    DEFAULT_HANDLER_POOL,
    ADHOC_POOL,
    DEFAULT_POOL,
];

/// Pipeline and pools installed together, swapped as a unit on reload.
pub(crate) struct Dispatch {
    pub(crate) pipeline: PluginPipeline,
    pub(crate) scheduler: Scheduler,
    settings: HashMap<String, PluginSettings>,
    default_settings: PluginSettings,
}

impl Dispatch {
    fn build(
        config: &SessionManagerConfig,
        pipeline: PluginPipeline,
        previous: Option<&Dispatch>,
        executor: Weak<dyn ItemExecutor>,
        parent: &CancellationToken,
    ) -> Self {
        let table = pool_table(config, &pipeline);
        let default = config.default_concurrency;
        let scheduler = match previous {
            Some(previous) => previous.scheduler.rebuild(&table, default, executor, parent),
            None => Scheduler::build(&table, default, executor, parent),
        };

        let settings = pipeline
            .descriptors()
            .into_iter()
            .map(|d| {
                let settings = config.settings_for(&d.id);
                (d.id, settings)
            })
            .collect();

        Self {
            pipeline,
            scheduler,
            settings,
            default_settings: config.settings_for(DEFAULT_POOL),
        }
    }

    /// Settings of plugin `id`.
    pub(crate) fn settings_for(&self, id: &str) -> &PluginSettings {
        self.settings.get(id).unwrap_or(&self.default_settings)
    }
}

fn pool_table(config: &SessionManagerConfig, pipeline: &PluginPipeline) -> Vec<(String, Concurrency)> {
    let default = config.default_concurrency;
    let internal = [
        (SESSION_OPEN_POOL, default.scaled(2)),
        (SESSION_CLOSE_POOL, default.scaled(4)),
        (DEFAULT_HANDLER_POOL, default.scaled(4)),
        (ADHOC_POOL, default),
    ];

    let mut table: Vec<(String, Concurrency)> = internal
        .into_iter()
        .map(|(id, c)| (id.to_string(), config.concurrency_for(id, Some(c))))
        .collect();
    for processor in pipeline.processors() {
        let id = processor.id();
        table.push((id.to_string(), config.concurrency_for(id, processor.concurrency())));
    }
    table
}

/// Collaborators supplied by the embedding application.
pub(crate) struct Collaborators {
    pub auth: Arc<dyn AuthRepository>,
    pub user_repo: Arc<dyn UserRepository>,
    pub events: Arc<dyn EventBus>,
    pub sink: Arc<dyn OutboundSink>,
}

/// A liveness check sent to an older connection of a user.
pub(crate) struct PendingCheck {
    pub conn_id: ConnectionId,
    pub user: BareJid,
    pub timer: TimerHandle,
}

pub(crate) struct InternalProcessors {
    pub session_open: Arc<dyn Processor>,
    pub session_close: Arc<dyn Processor>,
    pub default_handler: Arc<dyn Processor>,
}

pub(crate) struct SessionContext {
    pub(crate) config: SessionManagerConfig,
    component_id: Jid,
    local_domains: HashSet<String>,
    pub(crate) policy: AccessPolicy,
    pub(crate) connections: ConnectionRegistry,
    pub(crate) sessions: SessionRegistry,
    pub(crate) auth: Arc<dyn AuthRepository>,
    pub(crate) user_repo: Arc<dyn UserRepository>,
    pub(crate) events: Arc<dyn EventBus>,
    sink: Arc<dyn OutboundSink>,
    pub(crate) timers: TimerService,
    dispatch: ArcSwap<Dispatch>,
    reload_lock: Mutex<()>,
    pub(crate) reaper: StaleConnectionReaper,
    pub(crate) stats: SessionManagerStats,
    pub(crate) shutdown: CancellationToken,
    pub(crate) pending_checks: DashMap<String, PendingCheck>,
    pub(crate) internal: InternalProcessors,
    weak_self: Weak<SessionContext>,
}

impl SessionContext {
    pub(crate) fn new(
        config: SessionManagerConfig,
        pipeline: PluginPipeline,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>, XmppError> {
        config.validate()?;
        pipeline.validate(&RESERVED_IDS)?;
        let component_id = config.component_jid()?;
        let admins = config.admin_jids()?;
        let shutdown = CancellationToken::new();

        Ok(Arc::new_cyclic(|weak: &Weak<SessionContext>| {
            let executor: Weak<dyn ItemExecutor> = weak.clone();
            let dispatch = Dispatch::build(&config, pipeline, None, executor, &shutdown);

            Self {
                component_id,
                local_domains: config.local_domains.iter().cloned().collect(),
                policy: AccessPolicy::new(admins, config.trusted.iter().cloned()),
                connections: ConnectionRegistry::new(),
                sessions: SessionRegistry::new(),
                auth: collaborators.auth,
                user_repo: collaborators.user_repo,
                events: collaborators.events,
                sink: collaborators.sink,
                timers: TimerService::new(shutdown.child_token()),
                dispatch: ArcSwap::from_pointee(dispatch),
                reload_lock: Mutex::new(()),
                reaper: StaleConnectionReaper::new(config.reaper.max_queue_size),
                stats: SessionManagerStats::new(),
                shutdown,
                pending_checks: DashMap::new(),
                internal: InternalProcessors {
                    session_open: Arc::new(SessionOpenProc),
                    session_close: Arc::new(SessionCloseProc),
                    default_handler: Arc::new(DefaultHandlerProc),
                },
                weak_self: weak.clone(),
                config,
            }
        }))
    }

    pub(crate) fn weak(&self) -> Weak<SessionContext> {
        self.weak_self.clone()
    }

    pub(crate) fn component_id(&self) -> &Jid {
        &self.component_id
    }

    /// The session manager's own address as a routing address.
    pub(crate) fn component_conn_id(&self) -> ConnectionId {
        ConnectionId::new(self.component_id.clone())
    }

    pub(crate) fn is_component(&self, jid: &Jid) -> bool {
        jid == &self.component_id
    }

    pub(crate) fn is_local_domain(&self, domain: &str) -> bool {
        self.local_domains.contains(domain)
    }

    /// Whether `jid` is a bare domain served locally.
    pub(crate) fn is_local_domain_jid(&self, jid: &Jid) -> bool {
        jid.node().is_none() && jid.resource().is_none() && self.is_local_domain(jid.domain().as_str())
    }

    /// Domain used for streams that did not announce a host name.
    pub(crate) fn default_domain(&self) -> &str {
        self.config
            .local_domains
            .first()
            .map(String::as_str)
            .unwrap_or_else(|| self.component_id.domain().as_str())
    }

    /// Connection a stanza addressed to `jid` should be delivered to.
    pub(crate) fn resource_connection(&self, jid: &Jid) -> Option<Arc<ResourceConnection>> {
        self.sessions.get(&jid.to_bare())?.resource_connection(jid)
    }

    pub(crate) fn permission_for(&self, conn: Option<&Arc<ResourceConnection>>) -> Permission {
        self.policy.permission_for(conn.map(Arc::as_ref))
    }

    /// Currently installed pipeline and pools.
    pub(crate) fn dispatch(&self) -> Arc<Dispatch> {
        self.dispatch.load_full()
    }

    /// Install a new pipeline, reusing unchanged pools.
    pub(crate) fn reload(&self, pipeline: PluginPipeline) -> Result<(), XmppError> {
        pipeline.validate(&RESERVED_IDS)?;
        let _guard = self.reload_lock.lock();
        let current = self.dispatch.load_full();
        let executor: Weak<dyn ItemExecutor> = self.weak_self.clone();
        let next = Dispatch::build(
            &self.config,
            pipeline,
            Some(&current),
            executor,
            &self.shutdown,
        );
        self.dispatch.store(Arc::new(next));
        debug!("Installed new plugin pipeline");
        Ok(())
    }

    /// Queue `packet` for `task` on the pool named `pool`.
    pub(crate) fn enqueue(
        &self,
        dispatch: &Dispatch,
        pool: &str,
        task: Task,
        packet: Packet,
        conn: Option<Arc<ResourceConnection>>,
    ) -> bool {
        let offered = dispatch.scheduler.pool_for(pool).offer(QueueItem { task, packet, conn });
        if !offered {
            metrics::record_queue_skip(pool);
            warn!(pool = %pool, "Worker queue full, packet not queued");
        }
        offered
    }

    /// Apply output filters to `results`, then hand them to the sink.
    pub(crate) fn emit(
        &self,
        packet: Option<&Packet>,
        conn: Option<&Arc<ResourceConnection>>,
        mut results: Vec<Packet>,
    ) {
        if results.is_empty() {
            return;
        }
        let dispatch = self.dispatch.load();
        for filter in dispatch.pipeline.filters() {
            filter.filter(packet, conn, &mut results);
        }
        for result in results {
            self.send_raw(result);
        }
    }

    /// Send one packet through the output filters.
    pub(crate) fn send(&self, packet: Packet) {
        self.emit(None, None, vec![packet]);
    }

    fn send_raw(&self, packet: Packet) {
        match self.sink.send(packet) {
            SendResult::Sent => {}
            SendResult::ChannelFull => warn!("Outbound channel full, dropping packet"),
            SendResult::ChannelClosed => debug!("Outbound channel closed, dropping packet"),
        }
    }

    /// Error reply to `packet`, or `None` if it is itself an error.
    pub(crate) fn error_reply(
        &self,
        packet: &Packet,
        condition: StanzaErrorCondition,
        text: Option<&str>,
    ) -> Option<Packet> {
        match packet.error_response(condition, text) {
            Ok(reply) => {
                self.stats.inc_errors_synthesized();
                metrics::record_error_synthesized(condition.as_str());
                Some(reply)
            }
            Err(_) => {
                trace!(packet = %packet, "Not answering an error with an error");
                None
            }
        }
    }

    /// Send an error reply to `packet`.
    pub(crate) fn reply_error(&self, packet: &Packet, condition: StanzaErrorCondition, text: Option<&str>) {
        if let Some(reply) = self.error_reply(packet, condition, text) {
            self.send(reply);
        }
    }

    /// Stamp every result with the permission of `conn`.
    pub(crate) fn tag_results(&self, conn: Option<&Arc<ResourceConnection>>, results: &mut [Packet]) {
        let permission = self.permission_for(conn);
        for result in results.iter_mut() {
            result.set_permission(permission);
        }
    }
}

#[async_trait]
impl ItemExecutor for SessionContext {
    async fn execute(&self, item: QueueItem) {
        let QueueItem { task, packet, conn } = item;
        let dispatch = self.dispatch.load_full();
        let settings = dispatch.settings_for(task.id());
        let ctx = ProcessContext::new(self, settings);
        let mut results = Vec::new();
        let started = Instant::now();

        let outcome = {
            let run = async {
                match &task {
                    Task::Processor(p) => p.process(&packet, conn.as_ref(), &ctx, &mut results).await,
                    Task::Command(c) => c.execute(&packet, conn.as_ref(), &ctx, &mut results).await,
                }
            };
            std::panic::AssertUnwindSafe(run).catch_unwind().await
        };

        metrics::record_processing_duration(started.elapsed().as_secs_f64() * 1000.0, task.id());

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(XmppError::PacketErrorType)) => {
                debug!(plugin = %task.id(), packet = %packet, "Ignoring packet with error type");
            }
            Ok(Err(e)) => {
                warn!(plugin = %task.id(), packet = %packet, error = %e, "Plugin failed to process packet");
                if packet.from_address().is_some() {
                    let text = e.response_text();
                    if let Some(reply) = self.error_reply(&packet, e.condition(), text.as_deref()) {
                        results.push(reply);
                    }
                }
            }
            Err(_) => {
                error!(plugin = %task.id(), packet = %packet, "Plugin panicked while processing packet");
                if packet.from_address().is_some() {
                    if let Some(reply) =
                        self.error_reply(&packet, StanzaErrorCondition::InternalServerError, None)
                    {
                        results.push(reply);
                    }
                }
            }
        }

        self.tag_results(conn.as_ref(), &mut results);
        self.emit(Some(&packet), conn.as_ref(), results);
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("component_id", &self.component_id)
            .field("connections", &self.connections.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
