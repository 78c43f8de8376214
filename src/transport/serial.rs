//! Serial transport
//!
//! Outbound messages are encoded as envelope JSON, sealed by the port's
//! [`SerialFramer`] (compress, then XOR) and written one packet at a time.
//! Each packet write must finish within `write_timeout`; when it does not,
//! the rest of the write queue is discarded and every discarded message is
//! reported as a failed send. Serial sends are never retried by the bus.
//!
//! Inbound bytes go through the same framer. JSON frames that are envelopes
//! become messages on their own channel; anything else lands on
//! `raw_channel`.
//!
//! Auto-reconnect waits 1 s before the first attempt after a loss and 5 s
//! before each further one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use super::message::{self, Envelope};
use super::reconnect::{BackoffPolicy, ReconnectSupervisor};
use super::{Transport, TransportEvents, Worker, reject_outbound, send_via};
use crate::bus::message::{Message, Priority, Protocol};
use crate::config::{FlowControl, Parity, SerialSettings};
use crate::framing::{Frame, SerialFramer};
use crate::utils::error::{FramingError, TransportError};

const READ_CHUNK: usize = 4096;

pub const SERIAL_BACKOFF: BackoffPolicy = BackoffPolicy::Stepped {
    first: Duration::from_secs(1),
    then: Duration::from_secs(5),
};

/// Byte stream the serial worker reads and writes.
pub trait SerialLink: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialLink for T {}

/// Opens the line described by the settings. Swappable so the worker can
/// run over something other than a real port.
pub trait SerialOpener: Send + Sync {
    fn open(&self, settings: &SerialSettings) -> Result<Box<dyn SerialLink>, TransportError>;
}

/// Opens an OS serial port through `tokio-serial`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeSerialOpener;

impl SerialOpener for NativeSerialOpener {
    fn open(&self, settings: &SerialSettings) -> Result<Box<dyn SerialLink>, TransportError> {
        let data_bits = match settings.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => {
                return Err(TransportError::Connect(format!(
                    "unsupported data bits {other}"
                )));
            }
        };
        let stop_bits = match settings.stop_bits {
            1 => tokio_serial::StopBits::One,
            2 => tokio_serial::StopBits::Two,
            other => {
                return Err(TransportError::Connect(format!(
                    "unsupported stop bits {other}"
                )));
            }
        };
        let parity = match settings.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        let flow_control = match settings.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        };

        let port = tokio_serial::new(settings.port_name.as_str(), settings.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .open_native_async()
            .map_err(|e| TransportError::Connect(format!("{}: {e}", settings.port_name)))?;
        Ok(Box::new(port))
    }
}

pub struct SerialTransport {
    settings: SerialSettings,
    opener: Arc<dyn SerialOpener>,
    worker: Option<Worker>,
}

impl SerialTransport {
    /// Fails when the framing settings are unusable (zero packet size).
    pub fn new(settings: SerialSettings) -> Result<Self, FramingError> {
        SerialFramer::new(settings.framer_config())?;
        Ok(Self {
            settings,
            opener: Arc::new(NativeSerialOpener),
            worker: None,
        })
    }

    pub fn with_opener(mut self, opener: Arc<dyn SerialOpener>) -> Self {
        self.opener = opener;
        self
    }
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port_name", &self.settings.port_name)
            .field("baud_rate", &self.settings.baud_rate)
            .field("running", &self.worker.is_some())
            .finish()
    }
}

impl Transport for SerialTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Serial
    }

    fn connect(&mut self, events: TransportEvents) {
        self.disconnect();
        let framer = match SerialFramer::new(self.settings.framer_config()) {
            Ok(framer) => framer,
            Err(e) => {
                events.error(e.into());
                return;
            }
        };
        let settings = self.settings.clone();
        let opener = Arc::clone(&self.opener);
        self.worker = Some(Worker::spawn(move |rx| {
            run(settings, opener, framer, events, rx)
        }));
    }

    fn disconnect(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
            debug!("Serial worker for {} stopped", self.settings.port_name);
        }
    }

    fn send(&self, message: Message) -> Result<(), TransportError> {
        send_via(self.worker.as_ref(), message)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run(
    settings: SerialSettings,
    opener: Arc<dyn SerialOpener>,
    mut framer: SerialFramer,
    events: TransportEvents,
    mut outbound: UnboundedReceiver<Message>,
) {
    let mut supervisor = ReconnectSupervisor::new(SERIAL_BACKOFF);
    let port = settings.port_name.clone();

    loop {
        supervisor.begin_connect();
        events.connecting();

        match opener.open(&settings) {
            Ok(link) => {
                supervisor.on_connected();
                info!("Serial port {port} open at {} baud", settings.baud_rate);
                framer.reset();
                events.connected();

                match serve(link, &settings, &mut framer, &events, &mut outbound).await {
                    Ok(()) => info!("Serial port {port} closed"),
                    Err(e) => {
                        warn!("Serial port {port} failed: {e}");
                        events.error(e);
                    }
                }
                events.disconnected();
            }
            Err(e) => {
                warn!("Opening serial port {port} failed: {e}");
                events.error(e);
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
    link: Box<dyn SerialLink>,
    settings: &SerialSettings,
    framer: &mut SerialFramer,
    events: &TransportEvents,
    outbound: &mut UnboundedReceiver<Message>,
) -> Result<(), TransportError> {
    let (mut reader, mut writer) = tokio::io::split(link);
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            maybe = outbound.recv() => {
                let Some(message) = maybe else {
                    return Ok(());
                };
                let packets = message::encode(&message)
                    .and_then(|text| framer.encode(text.as_bytes()).map_err(TransportError::from));
                match packets {
                    Ok(packets) => {
                        write_packets(&mut writer, &packets, settings, message, events, outbound)
                            .await?;
                    }
                    Err(e) => events.send_failed(message, e, false),
                }
            }
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                match framer.feed(&buf[..n]) {
                    Ok(frames) => {
                        for frame in frames {
                            deliver(events, &settings.raw_channel, frame);
                        }
                    }
                    Err(e) => {
                        warn!("Dropping serial input: {e}");
                        events.error(e.into());
                    }
                }
            }
        }
    }
}

/// Write one message's packets in order, each bounded by the write timeout.
async fn write_packets(
    writer: &mut WriteHalf<Box<dyn SerialLink>>,
    packets: &[Vec<u8>],
    settings: &SerialSettings,
    message: Message,
    events: &TransportEvents,
    outbound: &mut UnboundedReceiver<Message>,
) -> Result<(), TransportError> {
    let write_timeout = settings.write_timeout();
    for packet in packets {
        let write = async {
            writer.write_all(packet).await?;
            writer.flush().await
        };
        match timeout(write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let err = TransportError::from(e);
                events.send_failed(message, err.clone(), false);
                return Err(err);
            }
            Err(_) => {
                warn!(
                    "Serial write to {} timed out, clearing write queue",
                    settings.port_name
                );
                let err = TransportError::Timeout(write_timeout);
                events.send_failed(message, err.clone(), false);
                while let Ok(queued) = outbound.try_recv() {
                    events.send_failed(queued, err.clone(), false);
                }
                return Ok(());
            }
        }
    }

    events.sent(message.id());
    Ok(())
}

fn deliver(events: &TransportEvents, raw_channel: &str, frame: Frame) {
    let message = match frame {
        Frame::Json(value) => match Envelope::from_value(value.clone()) {
            Ok(envelope) => envelope.into_message(Protocol::Serial),
            Err(_) => Message::new(raw_channel, value, Protocol::Serial, Priority::Normal),
        },
        Frame::Raw(bytes) => Message::new(
            raw_channel,
            Value::from(bytes),
            Protocol::Serial,
            Priority::Normal,
        ),
    };
    events.received(message);
}
