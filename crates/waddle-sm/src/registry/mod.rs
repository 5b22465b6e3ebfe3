//! Process-wide lookup tables for connections and sessions.
//!
//! ## Architecture
//!
//! ```text
//!   ConnectionRegistry                       SessionRegistry
//!   DashMap<ConnectionId,                    DashMap<BareJid,
//!           Arc<ResourceConnection>>                 Arc<UserSession>>
//!              |                                        |
//!              +------- same Arc ------> UserSession.connections
//! ```
//!
//! A connection appears in the connection registry from stream open until
//! it is finalized. Authorized connections also appear in exactly one
//! user session. Lock order is always registry shard first, then the
//! session's connection mutex.

mod connection_registry;
mod session_registry;

pub use connection_registry::ConnectionRegistry;
pub use session_registry::SessionRegistry;
