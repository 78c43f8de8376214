//! # astrobus
//!
//! `astrobus` is a prioritized, multi-transport message bus for observatory
//! control software. Messages are published on named channels, queued by
//! priority and delivered over WebSocket, raw TCP, HTTP or a framed serial
//! line. Inbound traffic from any transport is filtered, optionally routed to
//! another transport, and fanned out to local subscribers.
//!
//! ## Core Modules
//!
//! - `bus`: the message model, priority queue, subscription, filter and
//!   route tables, and the `MessageBus` handle with its dispatcher task.
//! - `transport`: the `Transport` trait, the wire envelope, reconnect
//!   handling and the four adapters.
//! - `framing`: serial packetizing, XOR encryption and zlib compression.
//! - `persistence`: sled-backed storage for messages awaiting acknowledgement.
//! - `config`: layered settings from files and environment variables.
//! - `utils`: error types and logging setup.

pub mod bus;
pub mod config;
pub mod framing;
pub mod persistence;
pub mod transport;
pub mod utils;

pub use bus::{BusEvent, BusStats, Message, MessageBus, MessageId, Priority, Protocol};
pub use utils::error::{BusError, TransportError};
