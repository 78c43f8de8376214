//! Error types used across `astrobus`.
//!
//! Transport failures are classified into the four kinds the bus reasons
//! about when deciding whether to retry: transport (connect/send/socket),
//! timeout, protocol (malformed frame) and capacity (queue or packet limits).

use std::time::Duration;

use thiserror::Error;

/// Broad classification of a [`TransportError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Protocol,
    Capacity,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("socket error: {0}")]
    Io(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("transport worker is closed")]
    Closed,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Connect(_)
            | TransportError::Send(_)
            | TransportError::Io(_)
            | TransportError::NotConnected
            | TransportError::Closed => ErrorKind::Transport,
            TransportError::Timeout(_) => ErrorKind::Timeout,
            TransportError::Protocol(_) => ErrorKind::Protocol,
            TransportError::Capacity(_) => ErrorKind::Capacity,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Protocol(err.to_string())
    }
}

impl From<FramingError> for TransportError {
    fn from(err: FramingError) -> Self {
        match err {
            FramingError::Capacity(msg) => TransportError::Capacity(msg),
            FramingError::Protocol(msg) => TransportError::Protocol(msg),
            FramingError::Compression(msg) => TransportError::Protocol(msg),
        }
    }
}

/// Failures raised by the serial framing pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame exceeds capacity: {0}")]
    Capacity(String),

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("compression error: {0}")]
    Compression(String),
}

impl From<std::io::Error> for FramingError {
    fn from(err: std::io::Error) -> Self {
        FramingError::Compression(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("durable write failed: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("message bus is shut down")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),
}
