//! Wire envelope shared by the WebSocket, TCP, HTTP and serial adapters:
//!
//! ```json
//! {"channel": "alerts", "data": {...}, "priority": 2, "messageId": "<uuid>", "requiresAck": true}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::bus::message::{Message, Priority, Protocol};
use crate::utils::error::TransportError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub channel: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub requires_ack: bool,
}

impl Envelope {
    pub fn from_message(message: &Message) -> Self {
        Self {
            channel: message.channel.clone(),
            data: message.payload.clone(),
            priority: message.priority(),
            message_id: Some(message.id().to_string()),
            requires_ack: message.requires_ack,
        }
    }

    /// Build the inbound `Message` for an envelope received over `protocol`.
    /// A missing id gets a fresh one.
    pub fn into_message(self, protocol: Protocol) -> Message {
        let id = self
            .message_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Message::with_id(id, self.channel, self.data, protocol, self.priority)
            .requiring_ack(self.requires_ack)
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, TransportError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn from_value(value: Value) -> Result<Self, TransportError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Encode `message` into envelope JSON text.
pub fn encode(message: &Message) -> Result<String, TransportError> {
    Envelope::from_message(message).to_json()
}

/// Decode envelope bytes received over `protocol`.
pub fn decode(bytes: &[u8], protocol: Protocol) -> Result<Message, TransportError> {
    Envelope::from_slice(bytes).map(|env| env.into_message(protocol))
}
