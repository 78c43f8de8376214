//! Message definitions for the bus
//!
//! `Message` is the unit the bus queues, hands to transports and fans out to
//! subscribers. Notes on fields:
//! - `id`: globally unique (UUID v4), assigned at publish/decode time and used
//!   as the acknowledgement and persistence key
//! - `channel`: logical route name; subscriptions, filters and routes key on it
//! - `protocol`: the transport an outbound message goes out on, or the one an
//!   inbound message arrived from
//! - `priority`: ordering key; higher values leave the queue first
//! - `requires_ack`: keep the message (and its durable record) until
//!   `acknowledge(id)` is called
//!
//! `id`, `protocol` and `priority` are only readable once the message exists.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type MessageId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    WebSocket,
    Tcp,
    Http,
    Serial,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [
        Protocol::WebSocket,
        Protocol::Tcp,
        Protocol::Http,
        Protocol::Serial,
    ];
}

impl From<Protocol> for u8 {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::WebSocket => 0,
            Protocol::Tcp => 1,
            Protocol::Http => 2,
            Protocol::Serial => 3,
        }
    }
}

impl TryFrom<u8> for Protocol {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Protocol::WebSocket),
            1 => Ok(Protocol::Tcp),
            2 => Ok(Protocol::Http),
            3 => Ok(Protocol::Serial),
            other => Err(format!("unknown protocol {other}")),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::WebSocket => "websocket",
            Protocol::Tcp => "tcp",
            Protocol::Http => "http",
            Protocol::Serial => "serial",
        };
        f.write_str(name)
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "websocket" | "ws" => Ok(Protocol::WebSocket),
            "tcp" => Ok(Protocol::Tcp),
            "http" => Ok(Protocol::Http),
            "serial" => Ok(Protocol::Serial),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

/// Delivery priority. Serialized on the wire as an integer `0..=3`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Highest first, the order the queue drains bands in.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub(crate) fn band(self) -> usize {
        u8::from(self) as usize
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Critical),
            other => Err(format!("priority {other} out of range 0-3")),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" | "0" => Ok(Priority::Low),
            "normal" | "1" => Ok(Priority::Normal),
            "high" | "2" => Ok(Priority::High),
            "critical" | "3" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Send-failure policy applied to messages that do not set their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub max_retries: u32,
    pub timeout: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: MessageId,
    protocol: Protocol,
    priority: Priority,
    pub channel: String,
    pub payload: Value,
    pub requires_ack: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout: Duration,
    /// Milliseconds since UNIX epoch, set when the message is created.
    pub timestamp: i64,
}

impl Message {
    /// Create a message with a freshly generated id.
    pub fn new(
        channel: impl Into<String>,
        payload: Value,
        protocol: Protocol,
        priority: Priority,
    ) -> Self {
        Self::with_id(
            Uuid::new_v4().to_string(),
            channel,
            payload,
            protocol,
            priority,
        )
    }

    /// Create a message that keeps an id assigned elsewhere (a decoded frame
    /// or a recovered durable record).
    pub fn with_id(
        id: impl Into<MessageId>,
        channel: impl Into<String>,
        payload: Value,
        protocol: Protocol,
        priority: Priority,
    ) -> Self {
        let policy = DeliveryPolicy::default();
        Self {
            id: id.into(),
            protocol,
            priority,
            channel: channel.into(),
            payload,
            requires_ack: false,
            retry_count: 0,
            max_retries: policy.max_retries,
            timeout: policy.timeout,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn requiring_ack(mut self, requires_ack: bool) -> Self {
        self.requires_ack = requires_ack;
        self
    }

    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.max_retries = policy.max_retries;
        self.timeout = policy.timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Whether another send attempt is allowed after a failure.
    pub fn retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
