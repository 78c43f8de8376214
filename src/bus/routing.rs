//! Channel filters and route rules.
//!
//! A filter is a predicate over the payload; messages failing it are dropped
//! before they reach the queue (outbound) or subscribers (inbound). A route
//! re-publishes inbound traffic of one channel onto another channel and
//! transport, bridging e.g. a serial device onto a WebSocket peer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::message::Protocol;

pub type Filter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub target_channel: String,
    pub target_protocol: Protocol,
}

#[derive(Default)]
pub struct RoutingTable {
    filters: HashMap<String, Filter>,
    routes: HashMap<String, RouteRule>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the filter for `channel`. `None` clears it.
    pub fn set_filter(&mut self, channel: &str, filter: Option<Filter>) {
        match filter {
            Some(f) => {
                self.filters.insert(channel.to_string(), f);
            }
            None => {
                self.filters.remove(channel);
            }
        }
    }

    /// Replace the route for `source`. `None` clears it.
    pub fn set_route(&mut self, source: &str, rule: Option<RouteRule>) {
        match rule {
            Some(r) => {
                self.routes.insert(source.to_string(), r);
            }
            None => {
                self.routes.remove(source);
            }
        }
    }

    /// True when `channel` has no filter or its filter accepts `payload`.
    pub fn accepts(&self, channel: &str, payload: &Value) -> bool {
        self.filters.get(channel).is_none_or(|f| f(payload))
    }

    pub fn route_for(&self, channel: &str) -> Option<&RouteRule> {
        self.routes.get(channel)
    }
}

impl fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingTable")
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .field("routes", &self.routes)
            .finish()
    }
}
