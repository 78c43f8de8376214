//! The `transport` module holds the adapters that move bus messages over the
//! wire: WebSocket, raw TCP, HTTP and a framed serial line.
//!
//! Every adapter implements [`Transport`]. `connect` spawns the adapter's own
//! worker task, which owns the socket, its timers and its reconnect policy.
//! The worker never touches bus state directly; it reports connection changes,
//! decoded inbound messages and send outcomes as [`TransportEvent`]s through
//! the [`TransportEvents`] sender handed to it by the dispatcher.

pub mod http;
pub mod message;
pub mod reconnect;
pub mod serial;
pub mod tcp;
pub mod websocket;

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::message::{Message, MessageId, Protocol};
use crate::utils::error::TransportError;

pub use message::Envelope;
pub use reconnect::{BackoffPolicy, ReconnectSupervisor, SupervisorState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// What a transport worker reports back to the dispatcher.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connecting(Protocol),
    Connected(Protocol),
    Disconnected(Protocol),
    Reconnecting {
        protocol: Protocol,
        attempt: u32,
        delay: Duration,
    },
    Received(Message),
    Sent {
        protocol: Protocol,
        id: MessageId,
    },
    /// The message is handed back. `retriable` is false when the transport
    /// already applied its own retry policy or must not resend.
    SendFailed {
        message: Message,
        error: TransportError,
        retriable: bool,
    },
    Error {
        protocol: Protocol,
        error: TransportError,
    },
}

/// Sender half given to a transport worker. Sends never block; if the
/// dispatcher is gone the event is dropped.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    protocol: Protocol,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEvents {
    pub fn new(protocol: Protocol, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { protocol, tx }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(event);
    }

    pub fn connecting(&self) {
        self.emit(TransportEvent::Connecting(self.protocol));
    }

    pub fn connected(&self) {
        self.emit(TransportEvent::Connected(self.protocol));
    }

    pub fn disconnected(&self) {
        self.emit(TransportEvent::Disconnected(self.protocol));
    }

    pub fn reconnecting(&self, attempt: u32, delay: Duration) {
        self.emit(TransportEvent::Reconnecting {
            protocol: self.protocol,
            attempt,
            delay,
        });
    }

    pub fn received(&self, message: Message) {
        self.emit(TransportEvent::Received(message));
    }

    pub fn sent(&self, id: &str) {
        self.emit(TransportEvent::Sent {
            protocol: self.protocol,
            id: id.to_string(),
        });
    }

    pub fn send_failed(&self, message: Message, error: TransportError, retriable: bool) {
        self.emit(TransportEvent::SendFailed {
            message,
            error,
            retriable,
        });
    }

    pub fn error(&self, error: TransportError) {
        self.emit(TransportEvent::Error {
            protocol: self.protocol,
            error,
        });
    }
}

/// Common surface of every adapter.
pub trait Transport: Send {
    fn protocol(&self) -> Protocol;

    /// Start the worker task. Calling it while already connected restarts the
    /// worker.
    fn connect(&mut self, events: TransportEvents);

    /// Stop the worker and drop the connection.
    fn disconnect(&mut self);

    /// Hand `message` to the worker. The outcome arrives later as
    /// `TransportEvent::Sent` or `TransportEvent::SendFailed`.
    fn send(&self, message: Message) -> Result<(), TransportError>;
}

/// Outbound queue and task handle shared by the concrete adapters.
#[derive(Debug)]
pub(crate) struct Worker {
    outbound: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

impl Worker {
    pub(crate) fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(mpsc::UnboundedReceiver<Message>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (outbound, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx));
        Self { outbound, task }
    }

    pub(crate) fn send(&self, message: Message) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    pub(crate) fn stop(self) {
        self.task.abort();
    }
}

pub(crate) fn send_via(worker: Option<&Worker>, message: Message) -> Result<(), TransportError> {
    match worker {
        Some(w) => w.send(message),
        None => Err(TransportError::NotConnected),
    }
}

/// Close a worker's outbound queue for good and report `held` plus
/// everything still queued as not sent.
pub(crate) fn reject_outbound(
    held: Vec<Message>,
    outbound: &mut mpsc::UnboundedReceiver<Message>,
    events: &TransportEvents,
) {
    outbound.close();
    let mut rejected = held;
    while let Ok(message) = outbound.try_recv() {
        rejected.push(message);
    }
    // newest first: the bus puts each one back at the front of its band
    for message in rejected.into_iter().rev() {
        events.send_failed(message, TransportError::NotConnected, true);
    }
}

#[cfg(test)]
mod websocket_tests;
