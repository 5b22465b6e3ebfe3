//! Outbound packet sink.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::packet::Packet;

/// Result of handing a packet to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Packet was queued for delivery
    Sent,
    /// The sink is full (backpressure)
    ChannelFull,
    /// The receiving side is gone
    ChannelClosed,
}

/// Destination for every packet the session manager emits.
///
/// Packets addressed with `packet_to` go to that connection, everything else
/// is routed by its stanza `to`. Implementations must not block.
pub trait OutboundSink: Send + Sync {
    fn send(&self, packet: Packet) -> SendResult;
}

/// Sink backed by a bounded mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<Packet>,
}

impl ChannelSink {
    /// Create a sink together with the receiver the transport layer drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl OutboundSink for ChannelSink {
    fn send(&self, packet: Packet) -> SendResult {
        match self.sender.try_send(packet) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(packet)) => {
                warn!(packet = %packet, "Outbound channel full, applying backpressure");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(packet)) => {
                debug!(packet = %packet, "Outbound channel closed");
                SendResult::ChannelClosed
            }
        }
    }
}
