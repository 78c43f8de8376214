use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::message::DeliveryPolicy;
use crate::framing::FramerConfig;
use crate::framing::framer::{DEFAULT_MAX_BUFFER_SIZE, DEFAULT_MAX_PACKET_SIZE};

/// Top-level configuration settings for the application.
///
/// One section for the bus itself and one per transport.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Settings {
    pub bus: BusSettings,
    pub websocket: WebSocketSettings,
    pub tcp: TcpSettings,
    pub http: HttpSettings,
    pub serial: SerialSettings,
}

/// Configuration settings for the bus dispatcher.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BusSettings {
    pub dispatch_interval_ms: u64,
    /// `0` leaves the queue unbounded.
    pub max_queue_len: usize,
    pub default_max_retries: u32,
    pub default_timeout_ms: u64,
    pub event_capacity: usize,
    /// Directory of the sled store; persistence is off when unset.
    pub persistence_path: Option<String>,
    pub log_level: String,
}

impl BusSettings {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms.max(1))
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            max_retries: self.default_max_retries,
            timeout: Duration::from_millis(self.default_timeout_ms),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: 100,
            max_queue_len: 10_000,
            default_max_retries: 3,
            default_timeout_ms: 5000,
            event_capacity: 1024,
            persistence_path: None,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WebSocketSettings {
    pub url: String,
    pub reconnect_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub auto_reconnect: bool,
}

impl WebSocketSettings {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect_interval_ms: 5000,
            heartbeat_interval_ms: 30_000,
            connect_timeout_ms: 5000,
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TcpSettings {
    pub host: String,
    /// `0` means no TCP peer is configured.
    pub port: u16,
    pub reconnect_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub auto_reconnect: bool,
}

impl TcpSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            reconnect_interval_ms: 5000,
            connect_timeout_ms: 5000,
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct HttpSettings {
    /// Channel names are appended to this to form the POST URL.
    pub base_url: String,
    pub timeout_ms: u64,
    /// Capacity of each of the three priority sub-queues.
    pub queue_capacity: usize,
    pub headers: HashMap<String, String>,
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_ms: 30_000,
            queue_capacity: 100,
            headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SerialSettings {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    pub flow_control: FlowControl,
    pub max_packet_size: usize,
    pub max_buffer_size: usize,
    pub encryption_key: Option<String>,
    pub compression: bool,
    pub json_mode: bool,
    pub write_timeout_ms: u64,
    /// Channel used for inbound data in raw (non-JSON) mode.
    pub raw_channel: String,
    pub auto_reconnect: bool,
}

impl SerialSettings {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn framer_config(&self) -> FramerConfig {
        FramerConfig {
            max_packet_size: self.max_packet_size,
            encryption_key: self.encryption_key.clone(),
            compression: self.compression,
            json_mode: self.json_mode,
            max_buffer_size: self.max_buffer_size,
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            flow_control: FlowControl::None,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            encryption_key: None,
            compression: false,
            json_mode: true,
            write_timeout_ms: 1000,
            raw_channel: "serial.raw".to_string(),
            auto_reconnect: true,
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub bus: Option<PartialBusSettings>,
    pub websocket: Option<PartialWebSocketSettings>,
    pub tcp: Option<PartialTcpSettings>,
    pub http: Option<PartialHttpSettings>,
    pub serial: Option<PartialSerialSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBusSettings {
    pub dispatch_interval_ms: Option<u64>,
    pub max_queue_len: Option<usize>,
    pub default_max_retries: Option<u32>,
    pub default_timeout_ms: Option<u64>,
    pub event_capacity: Option<usize>,
    pub persistence_path: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialWebSocketSettings {
    pub url: Option<String>,
    pub reconnect_interval_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub auto_reconnect: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialTcpSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub reconnect_interval_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub auto_reconnect: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialHttpSettings {
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub queue_capacity: Option<usize>,
    pub headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSerialSettings {
    pub port_name: Option<String>,
    pub baud_rate: Option<u32>,
    pub data_bits: Option<u8>,
    pub parity: Option<Parity>,
    pub stop_bits: Option<u8>,
    pub flow_control: Option<FlowControl>,
    pub max_packet_size: Option<usize>,
    pub max_buffer_size: Option<usize>,
    pub encryption_key: Option<String>,
    pub compression: Option<bool>,
    pub json_mode: Option<bool>,
    pub write_timeout_ms: Option<u64>,
    pub raw_channel: Option<String>,
    pub auto_reconnect: Option<bool>,
}

impl PartialSettings {
    /// Merge with defaults
    pub fn merge(self, default: Settings) -> Settings {
        Settings {
            bus: self.bus.unwrap_or_default().merge(default.bus),
            websocket: self.websocket.unwrap_or_default().merge(default.websocket),
            tcp: self.tcp.unwrap_or_default().merge(default.tcp),
            http: self.http.unwrap_or_default().merge(default.http),
            serial: self.serial.unwrap_or_default().merge(default.serial),
        }
    }
}

impl PartialBusSettings {
    fn merge(self, d: BusSettings) -> BusSettings {
        BusSettings {
            dispatch_interval_ms: self.dispatch_interval_ms.unwrap_or(d.dispatch_interval_ms),
            max_queue_len: self.max_queue_len.unwrap_or(d.max_queue_len),
            default_max_retries: self.default_max_retries.unwrap_or(d.default_max_retries),
            default_timeout_ms: self.default_timeout_ms.unwrap_or(d.default_timeout_ms),
            event_capacity: self.event_capacity.unwrap_or(d.event_capacity),
            persistence_path: self.persistence_path.or(d.persistence_path),
            log_level: self.log_level.unwrap_or(d.log_level),
        }
    }
}

impl PartialWebSocketSettings {
    fn merge(self, d: WebSocketSettings) -> WebSocketSettings {
        WebSocketSettings {
            url: self.url.unwrap_or(d.url),
            reconnect_interval_ms: self.reconnect_interval_ms.unwrap_or(d.reconnect_interval_ms),
            heartbeat_interval_ms: self.heartbeat_interval_ms.unwrap_or(d.heartbeat_interval_ms),
            connect_timeout_ms: self.connect_timeout_ms.unwrap_or(d.connect_timeout_ms),
            auto_reconnect: self.auto_reconnect.unwrap_or(d.auto_reconnect),
        }
    }
}

impl PartialTcpSettings {
    fn merge(self, d: TcpSettings) -> TcpSettings {
        TcpSettings {
            host: self.host.unwrap_or(d.host),
            port: self.port.unwrap_or(d.port),
            reconnect_interval_ms: self.reconnect_interval_ms.unwrap_or(d.reconnect_interval_ms),
            connect_timeout_ms: self.connect_timeout_ms.unwrap_or(d.connect_timeout_ms),
            auto_reconnect: self.auto_reconnect.unwrap_or(d.auto_reconnect),
        }
    }
}

impl PartialHttpSettings {
    fn merge(self, d: HttpSettings) -> HttpSettings {
        HttpSettings {
            base_url: self.base_url.unwrap_or(d.base_url),
            timeout_ms: self.timeout_ms.unwrap_or(d.timeout_ms),
            queue_capacity: self.queue_capacity.unwrap_or(d.queue_capacity),
            headers: self.headers.unwrap_or(d.headers),
        }
    }
}

impl PartialSerialSettings {
    fn merge(self, d: SerialSettings) -> SerialSettings {
        SerialSettings {
            port_name: self.port_name.unwrap_or(d.port_name),
            baud_rate: self.baud_rate.unwrap_or(d.baud_rate),
            data_bits: self.data_bits.unwrap_or(d.data_bits),
            parity: self.parity.unwrap_or(d.parity),
            stop_bits: self.stop_bits.unwrap_or(d.stop_bits),
            flow_control: self.flow_control.unwrap_or(d.flow_control),
            max_packet_size: self.max_packet_size.unwrap_or(d.max_packet_size),
            max_buffer_size: self.max_buffer_size.unwrap_or(d.max_buffer_size),
            encryption_key: self.encryption_key.or(d.encryption_key),
            compression: self.compression.unwrap_or(d.compression),
            json_mode: self.json_mode.unwrap_or(d.json_mode),
            write_timeout_ms: self.write_timeout_ms.unwrap_or(d.write_timeout_ms),
            raw_channel: self.raw_channel.unwrap_or(d.raw_channel),
            auto_reconnect: self.auto_reconnect.unwrap_or(d.auto_reconnect),
        }
    }
}
