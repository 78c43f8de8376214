//! The `bus` module is the core of `astrobus`.
//!
//! It holds the message model, the priority queue, the subscription, filter
//! and route tables, and the [`MessageBus`] handle. One dispatcher task owns
//! all of that state; handles talk to it through an inbox channel and
//! transports report to it through [`TransportEvent`](crate::transport::TransportEvent)s.

pub mod engine;
pub mod events;
pub mod message;
pub mod queue;
pub mod routing;
pub mod subscription;

pub use engine::MessageBus;
pub use events::{BusEvent, BusStats};
pub use message::{DeliveryPolicy, Message, MessageId, Priority, Protocol};
pub use queue::PriorityMessageQueue;
pub use routing::{Filter, RouteRule, RoutingTable};
pub use subscription::{Handler, SubscriptionId, SubscriptionTable};
