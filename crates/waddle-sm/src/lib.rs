//! # waddle-sm
//!
//! XMPP session manager for Waddle Social.
//!
//! This crate tracks every client stream the connection manager reports,
//! ties authenticated streams to per-account sessions and routes each
//! packet through a pluggable processing pipeline. It does not own any
//! sockets: packets come in through [`StanzaRouter::process`] and leave
//! through an [`OutboundSink`].
//!
//! ## Architecture
//!
//! - **Registries**: concurrent maps of connections (by connection id) and
//!   sessions (by bare JID)
//! - **Plugin Pipeline**: preprocessors, processors, postprocessors, output
//!   filters, stop listeners and ad-hoc commands
//! - **Worker Pools**: one pool of bounded queues per processor, keyed so
//!   packets of one connection keep their order
//! - **Command State Machine**: stream open, close, features, moves and
//!   user status commands from the connection manager
//! - **Reaper**: periodic removal of connections reported as stale

pub mod config;
pub mod connection;
pub mod events;
pub mod metrics;
pub mod outbound;
pub mod packet;
pub mod permission;
pub mod pipeline;
pub mod plugin;
pub mod reaper;
pub mod registry;
pub mod repository;
pub mod routing;
pub mod session;
pub mod stats;
pub mod timer;

mod command;
mod context;
mod default_handler;
mod error;
mod lifecycle;
mod types;
mod worker;

use std::sync::Arc;

pub use config::{Concurrency, PluginConfig, ReaperConfig, SessionManagerConfig};
pub use connection::{
    ResourceConnection, AUTH_TIMEOUT_KEY, ERROR_KEY, LOCAL_CERTIFICATE_KEY, PEER_CERTIFICATE_KEY,
    SSL_KEY, TLS_UNIQUE_ID_KEY,
};
pub use error::{stream_errors, Authorization, StanzaErrorCondition, StanzaErrorType, XmppError};
pub use events::{BroadcastEventBus, EventBus, SessionEvent};
pub use lifecycle::RESUMPTION_ID_KEY;
pub use outbound::{ChannelSink, OutboundSink, SendResult};
pub use packet::{ns, Command, Packet};
pub use permission::Permission;
pub use pipeline::PluginPipeline;
pub use plugin::{
    AdHocCommand, Capability, OutputFilter, Plugin, PluginDescriptor, PluginSettings,
    Postprocessor, Preprocessor, ProcessContext, Processor, StopListener,
};
pub use repository::{AuthRepository, UserRepository};
pub use routing::{RoutingResult, StanzaRouter, StanzaRouterBuilder};
pub use session::UserSession;
pub use stats::{PoolStats, StatsSnapshot};
pub use types::*;

/// Start a session manager with the given configuration, pipeline and
/// repositories, emitting into a new channel.
pub fn start(
    config: SessionManagerConfig,
    pipeline: PluginPipeline,
    auth: Arc<dyn AuthRepository>,
    user_repo: Arc<dyn UserRepository>,
) -> Result<(StanzaRouter, tokio::sync::mpsc::Receiver<Packet>), XmppError> {
    StanzaRouter::builder(config)
        .pipeline(pipeline)
        .auth_repository(auth)
        .user_repository(user_repo)
        .build_with_channel()
}
