//! WebSocket transport
//!
//! Client-side adapter. The worker task:
//! - connects to the configured URL (bounded by the connect timeout)
//! - sends each outbound message as one text frame holding the JSON envelope
//! - pings the peer every heartbeat interval
//! - decodes inbound text/binary frames into `Message`s
//! - on loss, arms a single reconnect after `reconnect_interval`; every failed
//!   attempt re-arms it
//!
//! While disconnected, messages handed to the worker are returned as
//! `NotConnected` failures rather than buffered.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use super::reconnect::{BackoffPolicy, ReconnectSupervisor};
use super::{Transport, TransportEvents, Worker, message, reject_outbound, send_via};
use crate::bus::message::{Message, Protocol};
use crate::config::WebSocketSettings;
use crate::utils::error::TransportError;

const HEARTBEAT_PAYLOAD: &[u8] = b"astrobus-ping";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub struct WebSocketTransport {
    settings: WebSocketSettings,
    worker: Option<Worker>,
}

impl WebSocketTransport {
    pub fn new(settings: WebSocketSettings) -> Self {
        Self {
            settings,
            worker: None,
        }
    }
}

impl Transport for WebSocketTransport {
    fn protocol(&self) -> Protocol {
        Protocol::WebSocket
    }

    fn connect(&mut self, events: TransportEvents) {
        self.disconnect();
        let settings = self.settings.clone();
        self.worker = Some(Worker::spawn(move |rx| run(settings, events, rx)));
    }

    fn disconnect(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
            debug!("WebSocket worker for {} stopped", self.settings.url);
        }
    }

    fn send(&self, message: Message) -> Result<(), TransportError> {
        send_via(self.worker.as_ref(), message)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run(
    settings: WebSocketSettings,
    events: TransportEvents,
    mut outbound: UnboundedReceiver<Message>,
) {
    let mut supervisor =
        ReconnectSupervisor::new(BackoffPolicy::Fixed(settings.reconnect_interval()));

    loop {
        supervisor.begin_connect();
        events.connecting();

        match timeout(
            settings.connect_timeout(),
            connect_async(settings.url.as_str()),
        )
        .await
        {
            Ok(Ok((stream, _response))) => {
                supervisor.on_connected();
                info!("WebSocket connected to {}", settings.url);
                events.connected();

                match serve(stream, &settings, &events, &mut outbound).await {
                    Ok(()) => info!("WebSocket {} closed", settings.url),
                    Err(e) => {
                        warn!("WebSocket {} dropped: {e}", settings.url);
                        events.error(e);
                    }
                }
                events.disconnected();
            }
            Ok(Err(e)) => {
                warn!("WebSocket connect to {} failed: {e}", settings.url);
                events.error(TransportError::Connect(e.to_string()));
                events.disconnected();
            }
            Err(_) => {
                warn!("WebSocket connect to {} timed out", settings.url);
                events.error(TransportError::Timeout(settings.connect_timeout()));
                events.disconnected();
            }
        }

        if !settings.auto_reconnect {
            reject_outbound(Vec::new(), &mut outbound, &events);
            return;
        }

        let Some(delay) = supervisor.on_disconnected() else {
            continue;
        };
        events.reconnecting(supervisor.attempts(), delay);

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                Some(message) = outbound.recv() => {
                    events.send_failed(message, TransportError::NotConnected, true);
                }
            }
        }
        supervisor.fire();
    }
}

async fn serve(
    stream: WsStream,
    settings: &WebSocketSettings,
    events: &TransportEvents,
    outbound: &mut UnboundedReceiver<Message>,
) -> Result<(), TransportError> {
    let (mut sink, mut source) = stream.split();

    let mut heartbeat =
        tokio::time::interval(settings.heartbeat_interval().max(Duration::from_millis(1)));
    // the first tick completes immediately
    heartbeat.tick().await;

    loop {
        tokio::select! {
            maybe = outbound.recv() => {
                let Some(msg) = maybe else {
                    let _ = sink.close().await;
                    return Ok(());
                };
                let text = match message::encode(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        events.send_failed(msg, e, false);
                        continue;
                    }
                };
                match timeout(msg.timeout, sink.send(WsMessage::text(text))).await {
                    Ok(Ok(())) => events.sent(msg.id()),
                    Ok(Err(e)) => {
                        let err = TransportError::Send(e.to_string());
                        events.send_failed(msg, err.clone(), true);
                        return Err(err);
                    }
                    Err(_) => {
                        let err = TransportError::Timeout(msg.timeout);
                        events.send_failed(msg, err.clone(), true);
                        return Err(err);
                    }
                }
            }
            _ = heartbeat.tick() => {
                sink.send(WsMessage::Ping(HEARTBEAT_PAYLOAD.to_vec().into()))
                    .await
                    .map_err(|e| TransportError::Io(e.to_string()))?;
            }
            incoming = source.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => deliver(events, text.as_bytes()),
                Some(Ok(WsMessage::Binary(data))) => deliver(events, &data),
                Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }
}

fn deliver(events: &TransportEvents, bytes: &[u8]) {
    match message::decode(bytes, Protocol::WebSocket) {
        Ok(msg) => events.received(msg),
        Err(e) => {
            warn!("Invalid WebSocket frame: {e}");
            events.error(e);
        }
    }
}
