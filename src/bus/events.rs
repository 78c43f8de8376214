//! Observer-facing events and the statistics snapshot.

use std::collections::HashMap;
use std::time::Duration;

use super::message::{Message, MessageId, Protocol};
use crate::transport::ConnectionState;
use crate::utils::error::TransportError;

/// Broadcast to every receiver returned by `MessageBus::events`.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// An inbound message passed its channel filter.
    Received(Message),
    /// A transport confirmed the write of an outbound message.
    Delivered { id: MessageId, protocol: Protocol },
    Acknowledged(MessageId),
    /// `message` is `None` for connection-level failures.
    Error {
        protocol: Protocol,
        message: Option<MessageId>,
        error: TransportError,
    },
    ConnectionChanged {
        protocol: Protocol,
        state: ConnectionState,
    },
    Reconnecting {
        protocol: Protocol,
        attempt: u32,
        delay: Duration,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusStats {
    pub queued: usize,
    pub in_flight: usize,
    /// Sent ack-required messages still waiting for `acknowledge`, sorted.
    pub awaiting_ack: Vec<MessageId>,
    pub connections: HashMap<Protocol, ConnectionState>,
}

impl BusStats {
    pub fn state(&self, protocol: Protocol) -> ConnectionState {
        self.connections
            .get(&protocol)
            .copied()
            .unwrap_or_default()
    }
}
