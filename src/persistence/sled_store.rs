//! Persistence layer backed by `sled`
//!
//! One tree, `messages`, keyed by message id. Each value is a JSON record with
//! the columns `id, channel, data, protocol, priority, requires_ack` plus the
//! retry policy and a sled-generated sequence number that orders records
//! published with the same priority.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::{Db, Tree};
use tracing::warn;

use crate::bus::message::{DeliveryPolicy, Message, Priority, Protocol};
use crate::utils::error::PersistenceError;

const MESSAGES_TREE: &str = "messages";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    pub channel: String,
    pub data: Value,
    pub protocol: u8,
    pub priority: u8,
    pub requires_ack: bool,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub timestamp: i64,
    pub sequence: u64,
}

impl StoredMessage {
    fn from_message(message: &Message, sequence: u64) -> Self {
        Self {
            id: message.id().to_string(),
            channel: message.channel.clone(),
            data: message.payload.clone(),
            protocol: message.protocol().into(),
            priority: message.priority().into(),
            requires_ack: message.requires_ack,
            max_retries: message.max_retries,
            timeout_ms: message.timeout.as_millis() as u64,
            timestamp: message.timestamp,
            sequence,
        }
    }

    fn into_message(self) -> Result<Message, PersistenceError> {
        let corrupt = |reason: String| PersistenceError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let protocol = Protocol::try_from(self.protocol).map_err(corrupt)?;
        let priority = Priority::try_from(self.priority).map_err(corrupt)?;

        let mut message = Message::with_id(self.id, self.channel, self.data, protocol, priority)
            .requiring_ack(self.requires_ack)
            .with_policy(DeliveryPolicy {
                max_retries: self.max_retries,
                timeout: Duration::from_millis(self.timeout_ms),
            });
        message.timestamp = self.timestamp;
        Ok(message)
    }
}

#[derive(Clone)]
pub struct PersistenceStore {
    db: Db,
    messages: Tree,
}

impl PersistenceStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let db = sled::open(path)?;
        let messages = db.open_tree(MESSAGES_TREE)?;
        Ok(Self { db, messages })
    }

    /// Write `message` and flush it to disk before returning.
    pub fn store(&self, message: &Message) -> Result<(), PersistenceError> {
        let record = StoredMessage::from_message(message, self.db.generate_id()?);
        let bytes = serde_json::to_vec(&record)?;
        self.messages.insert(message.id().as_bytes(), bytes)?;
        self.messages.flush()?;
        Ok(())
    }

    /// Delete the record for `id`. Returns whether one existed.
    ///
    /// Not flushed: a delete lost in a crash only replays an already
    /// delivered message.
    pub fn remove(&self, id: &str) -> Result<bool, PersistenceError> {
        Ok(self.messages.remove(id.as_bytes())?.is_some())
    }

    pub fn contains(&self, id: &str) -> Result<bool, PersistenceError> {
        Ok(self.messages.contains_key(id.as_bytes())?)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Every stored ack-required message, highest priority first and in
    /// publish order within a priority. Unreadable records are skipped.
    pub fn load_pending(&self) -> Result<Vec<Message>, PersistenceError> {
        let mut records = Vec::with_capacity(self.messages.len());
        for entry in self.messages.iter() {
            let (key, value) = entry?;
            match serde_json::from_slice::<StoredMessage>(&value) {
                Ok(record) if record.requires_ack => records.push(record),
                Ok(_) => {}
                Err(e) => warn!(
                    "Skipping unreadable record {}: {e}",
                    String::from_utf8_lossy(&key)
                ),
            }
        }

        records.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.sequence.cmp(&b.sequence))
        });

        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            match record.into_message() {
                Ok(m) => messages.push(m),
                Err(e) => warn!("Skipping record: {e}"),
            }
        }
        Ok(messages)
    }
}

impl std::fmt::Debug for PersistenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceStore")
            .field("db", &"sled::Db")
            .field("records", &self.messages.len())
            .finish()
    }
}
