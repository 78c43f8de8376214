//! Message bus handle and dispatcher
//!
//! `MessageBus` is a cheap, cloneable handle. Every call turns into a
//! [`Command`] on the dispatcher inbox, so the queue and the subscription,
//! filter and route tables are only ever touched by the dispatcher task.
//!
//! The dispatcher wakes on three things:
//! - a command from a handle
//! - a [`TransportEvent`] from one of the transport workers
//! - the dispatch tick (`bus.dispatch_interval_ms`)
//!
//! A dispatch pass drains the queue in priority order. A message whose
//! transport is not connected, or refuses the hand-off, is put back at the
//! front of its band and blocks the rest of that protocol's traffic for the
//! pass. Other protocols keep flowing.

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::events::{BusEvent, BusStats};
use super::message::{DeliveryPolicy, Message, MessageId, Priority, Protocol};
use super::queue::PriorityMessageQueue;
use super::routing::{Filter, RouteRule, RoutingTable};
use super::subscription::{SubscriptionId, SubscriptionTable};
use crate::config::{BusSettings, HttpSettings, SerialSettings, TcpSettings, WebSocketSettings};
use crate::persistence::PersistenceStore;
use crate::transport::http::HttpTransport;
use crate::transport::serial::SerialTransport;
use crate::transport::tcp::TcpTransport;
use crate::transport::websocket::WebSocketTransport;
use crate::transport::{ConnectionState, Transport, TransportEvent, TransportEvents};
use crate::utils::error::{BusError, TransportError};

enum Command {
    Enqueue(Message),
    Distribute(Message),
    Subscribe {
        channel: String,
        id: SubscriptionId,
        handler: super::subscription::Handler,
    },
    Unsubscribe {
        channel: String,
        id: SubscriptionId,
    },
    SetFilter {
        channel: String,
        filter: Option<Filter>,
    },
    SetRoute {
        source: String,
        rule: Option<RouteRule>,
    },
    Acknowledge(MessageId),
    Attach(Box<dyn Transport>),
    Stats(oneshot::Sender<BusStats>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct MessageBus {
    inbox: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<BusEvent>,
    persistence: Option<PersistenceStore>,
    policy: DeliveryPolicy,
    next_subscription: Arc<AtomicU64>,
}

impl MessageBus {
    /// Start a bus from settings, opening the sled store at
    /// `persistence_path` when one is configured.
    pub fn from_settings(settings: &BusSettings) -> Result<Self, BusError> {
        let persistence = match &settings.persistence_path {
            Some(path) => Some(PersistenceStore::open(path)?),
            None => None,
        };
        Self::start(settings, persistence)
    }

    /// Spawn the dispatcher on the current tokio runtime.
    ///
    /// Ack-required messages left in `persistence` by a previous run are
    /// queued again, highest priority first.
    pub fn start(
        settings: &BusSettings,
        persistence: Option<PersistenceStore>,
    ) -> Result<Self, BusError> {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));

        let queue = match settings.max_queue_len {
            0 => PriorityMessageQueue::new(),
            cap => PriorityMessageQueue::with_capacity(cap),
        };

        let mut dispatcher = Dispatcher {
            queue,
            subscriptions: SubscriptionTable::new(),
            routing: RoutingTable::new(),
            transports: HashMap::new(),
            states: HashMap::new(),
            in_flight: HashMap::new(),
            awaiting_ack: HashSet::new(),
            persistence: persistence.clone(),
            events: events.clone(),
            transport_tx,
            policy: settings.delivery_policy(),
        };

        if let Some(store) = &persistence {
            let recovered = store.load_pending()?;
            if !recovered.is_empty() {
                info!("Recovered {} unacknowledged messages", recovered.len());
            }
            for message in recovered {
                // recovered records already hold a durable slot
                dispatcher.queue.requeue_back(message);
            }
        }

        let interval = settings.dispatch_interval().max(Duration::from_millis(1));
        tokio::spawn(dispatcher.run(inbox_rx, transport_rx, interval));

        Ok(Self {
            inbox,
            events,
            persistence,
            policy: settings.delivery_policy(),
            next_subscription: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Queue a message for delivery and return its id.
    ///
    /// With persistence enabled, an ack-required message is written to disk
    /// before it is queued; a failed write fails the call.
    pub fn publish(
        &self,
        channel: &str,
        payload: Value,
        protocol: Protocol,
        priority: Priority,
        requires_ack: bool,
    ) -> Result<MessageId, BusError> {
        let message = Message::new(channel, payload, protocol, priority)
            .requiring_ack(requires_ack)
            .with_policy(self.policy);
        self.publish_message(message)
    }

    /// Publish a message built by the caller, keeping its id and policy.
    pub fn publish_message(&self, message: Message) -> Result<MessageId, BusError> {
        if self.inbox.is_closed() {
            return Err(BusError::Closed);
        }
        if message.requires_ack {
            if let Some(store) = &self.persistence {
                store.store(&message)?;
            }
        }
        let id = message.id().to_string();
        self.send(Command::Enqueue(message))?;
        Ok(id)
    }

    pub fn subscribe<F>(&self, channel: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let _ = self.send(Command::Subscribe {
            channel: channel.to_string(),
            id,
            handler: Arc::new(handler),
        });
        id
    }

    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) {
        let _ = self.send(Command::Unsubscribe {
            channel: channel.to_string(),
            id,
        });
    }

    /// Only payloads accepted by `filter` pass through `channel`, in either
    /// direction.
    pub fn set_filter<F>(&self, channel: &str, filter: F)
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let _ = self.send(Command::SetFilter {
            channel: channel.to_string(),
            filter: Some(Arc::new(filter)),
        });
    }

    pub fn clear_filter(&self, channel: &str) {
        let _ = self.send(Command::SetFilter {
            channel: channel.to_string(),
            filter: None,
        });
    }

    /// Re-publish inbound traffic of `source` to `target_channel` over
    /// `target_protocol` instead of handing it to local subscribers.
    pub fn set_route(&self, source: &str, target_channel: &str, target_protocol: Protocol) {
        let _ = self.send(Command::SetRoute {
            source: source.to_string(),
            rule: Some(RouteRule {
                target_channel: target_channel.to_string(),
                target_protocol,
            }),
        });
    }

    pub fn clear_route(&self, source: &str) {
        let _ = self.send(Command::SetRoute {
            source: source.to_string(),
            rule: None,
        });
    }

    /// Settle a message. Unknown or already acknowledged ids are ignored.
    pub fn acknowledge(&self, id: &str) {
        let _ = self.send(Command::Acknowledge(id.to_string()));
    }

    /// Run an inbound message through filter, route and subscribers as if a
    /// transport had received it.
    pub fn distribute(&self, message: Message) {
        let _ = self.send(Command::Distribute(message));
    }

    pub fn connect_websocket(&self, settings: WebSocketSettings) {
        self.attach_transport(Box::new(WebSocketTransport::new(settings)));
    }

    pub fn connect_tcp(&self, settings: TcpSettings) {
        self.attach_transport(Box::new(TcpTransport::new(settings)));
    }

    pub fn configure_http(&self, settings: HttpSettings) {
        self.attach_transport(Box::new(HttpTransport::new(settings)));
    }

    pub fn connect_serial(&self, settings: SerialSettings) -> Result<(), BusError> {
        let transport =
            SerialTransport::new(settings).map_err(|e| BusError::Config(e.to_string()))?;
        self.attach_transport(Box::new(transport));
        Ok(())
    }

    /// Register `transport` for its protocol and connect it. A transport
    /// already registered for that protocol is disconnected and replaced.
    pub fn attach_transport(&self, transport: Box<dyn Transport>) {
        let _ = self.send(Command::Attach(transport));
    }

    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    pub async fn stats(&self) -> Result<BusStats, BusError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx))?;
        rx.await.map_err(|_| BusError::Closed)
    }

    /// Disconnect every transport and stop the dispatcher. Unacknowledged
    /// messages stay in the persistence store.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.inbox.is_closed()
    }

    fn send(&self, command: Command) -> Result<(), BusError> {
        self.inbox.send(command).map_err(|_| BusError::Closed)
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("running", &self.is_running())
            .field("persistence", &self.persistence)
            .field("policy", &self.policy)
            .finish()
    }
}

struct Dispatcher {
    queue: PriorityMessageQueue,
    subscriptions: SubscriptionTable,
    routing: RoutingTable,
    transports: HashMap<Protocol, Box<dyn Transport>>,
    states: HashMap<Protocol, ConnectionState>,
    in_flight: HashMap<MessageId, Message>,
    awaiting_ack: HashSet<MessageId>,
    persistence: Option<PersistenceStore>,
    events: broadcast::Sender<BusEvent>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    policy: DeliveryPolicy,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Command>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        interval: Duration,
    ) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.teardown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.teardown();
                        break;
                    }
                },
                Some(event) = transport_rx.recv() => self.handle_transport_event(event),
                _ = tick.tick() => self.dispatch(),
            }
        }

        info!("Message bus dispatcher stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue(message) => {
                let protocol = message.protocol();
                self.enqueue(message);
                if self.is_connected(protocol) {
                    self.dispatch();
                }
            }
            Command::Distribute(message) => self.distribute(message),
            Command::Subscribe {
                channel,
                id,
                handler,
            } => {
                self.subscriptions.subscribe(&channel, id, handler);
                debug!("Subscription {id} added on {channel}");
            }
            Command::Unsubscribe { channel, id } => {
                if self.subscriptions.unsubscribe(&channel, id) {
                    debug!("Subscription {id} removed from {channel}");
                }
            }
            Command::SetFilter { channel, filter } => self.routing.set_filter(&channel, filter),
            Command::SetRoute { source, rule } => self.routing.set_route(&source, rule),
            Command::Acknowledge(id) => {
                if self.settle(&id) {
                    self.emit(BusEvent::Acknowledged(id));
                }
            }
            Command::Attach(transport) => self.attach(transport),
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown(_) => {}
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connecting(protocol) => {
                self.set_state(protocol, ConnectionState::Connecting)
            }
            TransportEvent::Connected(protocol) => {
                info!("{protocol} transport connected");
                self.set_state(protocol, ConnectionState::Connected);
                self.dispatch();
            }
            TransportEvent::Disconnected(protocol) => {
                self.set_state(protocol, ConnectionState::Disconnected)
            }
            TransportEvent::Reconnecting {
                protocol,
                attempt,
                delay,
            } => {
                debug!("{protocol} reconnect attempt {attempt} in {delay:?}");
                self.set_state(protocol, ConnectionState::Reconnecting);
                self.emit(BusEvent::Reconnecting {
                    protocol,
                    attempt,
                    delay,
                });
            }
            TransportEvent::Received(message) => self.distribute(message),
            TransportEvent::Sent { protocol, id } => self.on_sent(protocol, id),
            TransportEvent::SendFailed {
                message,
                error,
                retriable,
            } => self.on_send_failed(message, error, retriable),
            TransportEvent::Error { protocol, error } => {
                self.emit(BusEvent::Error {
                    protocol,
                    message: None,
                    error,
                });
            }
        }
    }

    fn enqueue(&mut self, message: Message) {
        if !self.routing.accepts(&message.channel, &message.payload) {
            debug!("Filter on {} dropped {}", message.channel, message.id());
            self.forget(message.id());
            return;
        }
        let id = message.id().to_string();
        let protocol = message.protocol();
        if let Err(e) = self.queue.enqueue(message) {
            warn!("Rejected {id}: {e}");
            self.forget(&id);
            self.emit(BusEvent::Error {
                protocol,
                message: Some(id),
                error: e,
            });
        }
    }

    /// Hand queued messages to every connected transport, highest band
    /// first. A protocol that refuses a message is skipped for the rest of
    /// the pass; its messages stay where they are.
    fn dispatch(&mut self) {
        let mut ready: HashSet<Protocol> = self
            .transports
            .keys()
            .copied()
            .filter(|p| self.is_connected(*p))
            .collect();

        while !ready.is_empty() {
            let Some(message) = self.queue.pop_first(|m| ready.contains(&m.protocol())) else {
                break;
            };
            let protocol = message.protocol();
            let Some(transport) = self.transports.get(&protocol) else {
                ready.remove(&protocol);
                self.queue.requeue_front(message);
                continue;
            };

            match transport.send(message.clone()) {
                Ok(()) => {
                    self.in_flight.insert(message.id().to_string(), message);
                }
                Err(e) => {
                    debug!("{protocol} refused {}: {e}", message.id());
                    ready.remove(&protocol);
                    self.queue.requeue_front(message);
                }
            }
        }
    }

    fn on_sent(&mut self, protocol: Protocol, id: MessageId) {
        let Some(message) = self.in_flight.remove(&id) else {
            debug!("Sent report for settled message {id}");
            return;
        };
        if message.requires_ack {
            self.awaiting_ack.insert(id.clone());
        } else {
            self.forget(&id);
        }
        self.emit(BusEvent::Delivered { id, protocol });
    }

    fn on_send_failed(&mut self, mut message: Message, error: TransportError, retriable: bool) {
        if self.in_flight.remove(message.id()).is_none() {
            debug!("Send failure for settled message {}", message.id());
            return;
        }

        if error == TransportError::NotConnected {
            // no attempt was made
            self.queue.requeue_front(message);
            return;
        }

        if retriable && message.retries_left() {
            message.retry_count += 1;
            debug!(
                "Retrying {} ({}/{}): {error}",
                message.id(),
                message.retry_count,
                message.max_retries
            );
            self.queue.requeue_front(message);
            return;
        }

        error!(
            "Delivery of {} over {} failed: {error}",
            message.id(),
            message.protocol()
        );
        self.forget(message.id());
        self.emit(BusEvent::Error {
            protocol: message.protocol(),
            message: Some(message.id().to_string()),
            error,
        });
    }

    fn distribute(&mut self, message: Message) {
        if !self.routing.accepts(&message.channel, &message.payload) {
            debug!("Filter on {} dropped inbound {}", message.channel, message.id());
            return;
        }
        self.emit(BusEvent::Received(message.clone()));

        if let Some(rule) = self.routing.route_for(&message.channel).cloned() {
            debug!(
                "Routing {} from {} to {} over {}",
                message.id(),
                message.channel,
                rule.target_channel,
                rule.target_protocol
            );
            let priority = message.priority();
            let routed = Message::new(
                rule.target_channel,
                message.payload,
                rule.target_protocol,
                priority,
            )
            .with_policy(self.policy);
            self.enqueue(routed);
            if self.is_connected(rule.target_protocol) {
                self.dispatch();
            }
            return;
        }

        for subscription in self.subscriptions.handlers(&message.channel) {
            let handler = &subscription.handler;
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&message))).is_err() {
                error!(
                    "Subscription {} on {} panicked handling {}",
                    subscription.id,
                    message.channel,
                    message.id()
                );
            }
        }

        if message.requires_ack {
            self.settle(message.id());
            self.emit(BusEvent::Acknowledged(message.id().to_string()));
        }
    }

    /// Drop every trace of `id`. Returns whether the bus knew it.
    fn settle(&mut self, id: &str) -> bool {
        let mut known = self.awaiting_ack.remove(id);
        known |= self.in_flight.remove(id).is_some();
        known |= self.queue.remove(|m| m.id() == id) > 0;
        known |= self.forget(id);
        known
    }

    /// Delete the durable record for `id`, if any.
    fn forget(&self, id: &str) -> bool {
        let Some(store) = &self.persistence else {
            return false;
        };
        match store.remove(id) {
            Ok(existed) => existed,
            Err(e) => {
                warn!("Failed to delete durable record {id}: {e}");
                false
            }
        }
    }

    fn attach(&mut self, mut transport: Box<dyn Transport>) {
        let protocol = transport.protocol();
        if let Some(mut previous) = self.transports.remove(&protocol) {
            previous.disconnect();
            self.reclaim(protocol);
        }
        transport.connect(TransportEvents::new(protocol, self.transport_tx.clone()));
        self.transports.insert(protocol, transport);
        info!("{protocol} transport attached");
    }

    /// Put messages handed to a torn-down transport back in the queue.
    fn reclaim(&mut self, protocol: Protocol) {
        let ids: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, m)| m.protocol() == protocol)
            .map(|(id, _)| id.clone())
            .collect();
        let mut lost: Vec<Message> = ids
            .iter()
            .filter_map(|id| self.in_flight.remove(id))
            .collect();
        lost.sort_by_key(|m| std::cmp::Reverse(m.timestamp));
        for message in lost {
            self.queue.requeue_front(message);
        }
    }

    fn teardown(&mut self) {
        for (protocol, mut transport) in self.transports.drain() {
            transport.disconnect();
            debug!("{protocol} transport stopped");
        }
        for state in self.states.values_mut() {
            *state = ConnectionState::Disconnected;
        }
    }

    fn is_connected(&self, protocol: Protocol) -> bool {
        self.states.get(&protocol) == Some(&ConnectionState::Connected)
    }

    fn set_state(&mut self, protocol: Protocol, state: ConnectionState) {
        let previous = self.states.insert(protocol, state);
        if previous != Some(state) {
            self.emit(BusEvent::ConnectionChanged { protocol, state });
        }
    }

    fn stats(&self) -> BusStats {
        let mut awaiting_ack: Vec<MessageId> = self.awaiting_ack.iter().cloned().collect();
        awaiting_ack.sort();
        BusStats {
            queued: self.queue.len(),
            in_flight: self.in_flight.len(),
            awaiting_ack,
            connections: self.states.clone(),
        }
    }

    fn emit(&self, event: BusEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }
}
