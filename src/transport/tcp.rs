//! Raw TCP transport
//!
//! Envelopes travel as newline-delimited JSON. Messages handed to the worker
//! before the socket is up (or while it is reconnecting) are held in a local
//! FIFO and written, in order, as soon as the connection is established.

use std::collections::VecDeque;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::reconnect::{BackoffPolicy, ReconnectSupervisor};
use super::{Transport, TransportEvents, Worker, message, reject_outbound, send_via};
use crate::bus::message::{Message, Protocol};
use crate::config::TcpSettings;
use crate::utils::error::TransportError;

#[derive(Debug)]
pub struct TcpTransport {
    settings: TcpSettings,
    worker: Option<Worker>,
}

impl TcpTransport {
    pub fn new(settings: TcpSettings) -> Self {
        Self {
            settings,
            worker: None,
        }
    }
}

impl Transport for TcpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn connect(&mut self, events: TransportEvents) {
        self.disconnect();
        let settings = self.settings.clone();
        self.worker = Some(Worker::spawn(move |rx| run(settings, events, rx)));
    }

    fn disconnect(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
            debug!("TCP worker for {} stopped", self.settings.address());
        }
    }

    fn send(&self, message: Message) -> Result<(), TransportError> {
        send_via(self.worker.as_ref(), message)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run(
    settings: TcpSettings,
    events: TransportEvents,
    mut outbound: UnboundedReceiver<Message>,
) {
    let mut supervisor =
        ReconnectSupervisor::new(BackoffPolicy::Fixed(settings.reconnect_interval()));
    let mut pending: VecDeque<Message> = VecDeque::new();
    let addr = settings.address();

    loop {
        supervisor.begin_connect();
        events.connecting();

        match timeout(settings.connect_timeout(), TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                supervisor.on_connected();
                info!("TCP connected to {addr}");
                events.connected();

                match serve(stream, &events, &mut outbound, &mut pending).await {
                    Ok(()) => info!("TCP peer {addr} closed the connection"),
                    Err(e) => {
                        warn!("TCP connection to {addr} dropped: {e}");
                        events.error(e);
                    }
                }
                events.disconnected();
            }
            Ok(Err(e)) => {
                warn!("TCP connect to {addr} failed: {e}");
                events.error(TransportError::Connect(e.to_string()));
                events.disconnected();
            }
            Err(_) => {
                warn!("TCP connect to {addr} timed out");
                events.error(TransportError::Timeout(settings.connect_timeout()));
                events.disconnected();
            }
        }

        if !settings.auto_reconnect {
            reject_outbound(pending.into(), &mut outbound, &events);
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
                Some(message) = outbound.recv() => pending.push_back(message),
            }
        }
        supervisor.fire();
    }
}

async fn serve(
    stream: TcpStream,
    events: &TransportEvents,
    outbound: &mut UnboundedReceiver<Message>,
    pending: &mut VecDeque<Message>,
) -> Result<(), TransportError> {
    let (read_half, mut write_half) = stream.into_split();

    while let Some(message) = pending.pop_front() {
        write_one(&mut write_half, message, events).await?;
    }

    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            maybe = outbound.recv() => {
                let Some(message) = maybe else {
                    let _ = write_half.shutdown().await;
                    return Ok(());
                };
                write_one(&mut write_half, message, events).await?;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match message::decode(line.as_bytes(), Protocol::Tcp) {
                    Ok(msg) => events.received(msg),
                    Err(e) => {
                        warn!("Invalid TCP frame: {e}");
                        events.error(e);
                    }
                },
                None => return Ok(()),
            }
        }
    }
}

async fn write_one(
    writer: &mut OwnedWriteHalf,
    message: Message,
    events: &TransportEvents,
) -> Result<(), TransportError> {
    let mut frame = match message::encode(&message) {
        Ok(frame) => frame,
        Err(e) => {
            events.send_failed(message, e, false);
            return Ok(());
        }
    };
    frame.push('\n');

    match timeout(message.timeout, writer.write_all(frame.as_bytes())).await {
        Ok(Ok(())) => {
            events.sent(message.id());
            Ok(())
        }
        Ok(Err(e)) => {
            let err = TransportError::from(e);
            events.send_failed(message, err.clone(), true);
            Err(err)
        }
        Err(_) => {
            let err = TransportError::Timeout(message.timeout);
            events.send_failed(message, err.clone(), true);
            Err(err)
        }
    }
}
