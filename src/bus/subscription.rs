//! Subscription management
//!
//! A channel holds any number of handlers. Each `subscribe` call gets its own
//! `SubscriptionId`, so the same closure can be registered twice and removed
//! one registration at a time.
//!
//! The table lives inside the dispatcher task and is only changed through the
//! bus inbox, which keeps it consistent with filters and routes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::message::Message;

pub type SubscriptionId = u64;

/// Callback run by the dispatcher for every message distributed on a
/// channel. It must not block. A panic is caught and logged, and the
/// remaining handlers still run.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub handler: Handler,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionTable {
    channels: HashMap<String, Vec<Subscription>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, channel: &str, id: SubscriptionId, handler: Handler) {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push(Subscription { id, handler });
    }

    /// Remove one registration. Unknown ids are ignored.
    pub fn unsubscribe(&mut self, channel: &str, id: SubscriptionId) -> bool {
        let Some(subs) = self.channels.get_mut(channel) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    pub fn handlers(&self, channel: &str) -> &[Subscription] {
        self.channels.get(channel).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count(&self, channel: &str) -> usize {
        self.handlers(channel).len()
    }
}
