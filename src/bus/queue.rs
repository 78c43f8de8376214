//! Priority message queue
//!
//! Four FIFO bands, one per `Priority`, consulted from `Critical` down to
//! `Low`. Messages of equal priority leave in the order they were enqueued;
//! `requeue_front` puts a message back at the head of its own band so a
//! failed send does not lose its place.
//!
//! The queue is plain owned state. The dispatcher task is its only owner, so
//! no locking happens here.

use std::collections::VecDeque;

use super::message::{Message, Priority};
use crate::utils::error::TransportError;

#[derive(Debug, Default)]
pub struct PriorityMessageQueue {
    bands: [VecDeque<Message>; 4],
    capacity: Option<usize>,
}

impl PriorityMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue that rejects `enqueue` once `capacity` messages are waiting.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bands: Default::default(),
            capacity: Some(capacity),
        }
    }

    /// Append `msg` to the back of its priority band.
    pub fn enqueue(&mut self, msg: Message) -> Result<(), TransportError> {
        if let Some(cap) = self.capacity {
            if self.len() >= cap {
                return Err(TransportError::Capacity(format!(
                    "priority queue full ({cap} messages)"
                )));
            }
        }
        self.bands[msg.priority().band()].push_back(msg);
        Ok(())
    }

    /// Put `msg` back at the head of its priority band. Never rejected, the
    /// message already held a slot.
    pub fn requeue_front(&mut self, msg: Message) {
        self.bands[msg.priority().band()].push_front(msg);
    }

    /// Append `msg` to the back of its band without the capacity check, for
    /// messages recovered from the persistence store.
    pub fn requeue_back(&mut self, msg: Message) {
        self.bands[msg.priority().band()].push_back(msg);
    }

    /// Pop the oldest message of the highest non-empty band.
    pub fn dequeue(&mut self) -> Option<Message> {
        Priority::DESCENDING
            .iter()
            .find_map(|p| self.bands[p.band()].pop_front())
    }

    /// Pop the oldest message matching `pred`, highest band first. Messages
    /// ahead of it stay in place.
    pub fn pop_first<F>(&mut self, mut pred: F) -> Option<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        for priority in Priority::DESCENDING {
            let band = &mut self.bands[priority.band()];
            if let Some(pos) = band.iter().position(&mut pred) {
                return band.remove(pos);
            }
        }
        None
    }

    pub fn peek(&self) -> Option<&Message> {
        Priority::DESCENDING
            .iter()
            .find_map(|p| self.bands[p.band()].front())
    }

    pub fn len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.iter().all(VecDeque::is_empty)
    }

    /// Drop every message matching `pred`; returns how many were removed.
    pub fn remove<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&Message) -> bool,
    {
        let before = self.len();
        for band in &mut self.bands {
            band.retain(|m| !pred(m));
        }
        before - self.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.bands.iter().flatten().any(|m| m.id() == id)
    }
}
