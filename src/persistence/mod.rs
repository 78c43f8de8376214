//! The `persistence` module keeps ack-required messages on disk until they
//! are acknowledged.
//!
//! `MessageBus::publish` writes the record before the message is queued, so a
//! crash between publish and acknowledgement replays the message on the next
//! start. It uses `sled` as an embedded key-value store.

pub mod sled_store;

pub use sled_store::{PersistenceStore, StoredMessage};

#[cfg(test)]
mod tests;
