//! Session lifecycle events.

use jid::{BareJid, FullJid};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::ConnectionId;

/// Events fired by the session manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A connection authenticated
    UserConnected {
        jid: BareJid,
        conn_id: ConnectionId,
    },
    /// A resource was bound to a connection
    ResourceBound {
        jid: FullJid,
        conn_id: ConnectionId,
    },
    /// A connection broadcast a new presence
    PresenceChanged {
        jid: FullJid,
        priority: i8,
    },
    /// A connection was finalized
    UserDisconnected {
        jid: Option<BareJid>,
        conn_id: ConnectionId,
    },
    /// The session manager is shutting down. Publishing it triggers the
    /// shutdown of every subscribed router.
    Shutdown,
}

/// Publish/subscribe event bus.
///
/// Delivery is fire-and-forget; a slow subscriber may miss events.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: SessionEvent);

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}

/// In-process event bus backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: SessionEvent) {
        // No receivers is not an error.
        let receivers = self.sender.send(event).unwrap_or(0);
        trace!(receivers, "Published session event");
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = BroadcastEventBus::new(8);
        bus.publish(SessionEvent::Shutdown);

        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish(SessionEvent::UserConnected {
            jid: "alice@localhost".parse().unwrap(),
            conn_id: ConnectionId::parse("c2s@localhost/1").unwrap(),
        });

        assert!(matches!(rx1.recv().await.unwrap(), SessionEvent::UserConnected { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), SessionEvent::UserConnected { .. }));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(SessionEvent::Shutdown).unwrap();
        assert_eq!(json["type"], "shutdown");
    }
}
