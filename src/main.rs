use std::process::ExitCode;
use std::time::Duration;

use astrobus::bus::{BusEvent, MessageBus, Priority, Protocol};
use astrobus::config::{Settings, load_config};
use astrobus::utils::logging;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "astrobus", version, about = "Prioritized multi-transport message bus")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect the configured transports and log inbound traffic.
    Listen {
        /// Channels to print; every inbound message is logged when empty.
        #[arg(long = "channel")]
        channels: Vec<String>,
    },
    /// Publish one message and wait for the delivery outcome.
    Publish {
        #[arg(long)]
        channel: String,
        /// JSON payload.
        #[arg(long, default_value = "null")]
        data: String,
        #[arg(long, default_value = "websocket")]
        protocol: Protocol,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        #[arg(long)]
        ack: bool,
        /// Seconds to wait for delivery.
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.bus.log_level);

    let bus = match MessageBus::from_settings(&settings.bus) {
        Ok(bus) => bus,
        Err(e) => {
            error!("Failed to start message bus: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = match cli.command {
        Command::Listen { channels } => listen(&bus, &settings, channels).await,
        Command::Publish {
            channel,
            data,
            protocol,
            priority,
            ack,
            wait,
        } => {
            publish(
                &bus,
                &settings,
                &channel,
                &data,
                protocol,
                priority,
                ack,
                Duration::from_secs(wait),
            )
            .await
        }
    };

    bus.shutdown().await;
    code
}

fn connect_configured(bus: &MessageBus, settings: &Settings, only: Option<Protocol>) -> bool {
    let wanted = |p: Protocol| only.is_none_or(|o| o == p);
    let mut any = false;

    if wanted(Protocol::WebSocket) && !settings.websocket.url.is_empty() {
        bus.connect_websocket(settings.websocket.clone());
        any = true;
    }
    if wanted(Protocol::Tcp) && settings.tcp.port != 0 {
        bus.connect_tcp(settings.tcp.clone());
        any = true;
    }
    if wanted(Protocol::Http) && !settings.http.base_url.is_empty() {
        bus.configure_http(settings.http.clone());
        any = true;
    }
    if wanted(Protocol::Serial) && !settings.serial.port_name.is_empty() {
        match bus.connect_serial(settings.serial.clone()) {
            Ok(()) => any = true,
            Err(e) => error!("Serial transport not started: {e}"),
        }
    }
    any
}

async fn listen(bus: &MessageBus, settings: &Settings, channels: Vec<String>) -> ExitCode {
    let mut events = bus.events();
    if !connect_configured(bus, settings, None) {
        warn!("No transport is configured");
        return ExitCode::FAILURE;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                return ExitCode::SUCCESS;
            }
            event = events.recv() => match event {
                Ok(BusEvent::Received(msg)) => {
                    if channels.is_empty() || channels.contains(&msg.channel) {
                        info!(
                            channel = %msg.channel,
                            protocol = %msg.protocol(),
                            id = %msg.id(),
                            "{}",
                            msg.payload
                        );
                    }
                }
                Ok(BusEvent::ConnectionChanged { protocol, state }) => {
                    info!("{protocol} is {state}");
                }
                Ok(BusEvent::Error { protocol, error, .. }) => warn!("{protocol}: {error}"),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Skipped {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return ExitCode::FAILURE,
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn publish(
    bus: &MessageBus,
    settings: &Settings,
    channel: &str,
    data: &str,
    protocol: Protocol,
    priority: Priority,
    ack: bool,
    wait: Duration,
) -> ExitCode {
    let payload: Value = match serde_json::from_str(data) {
        Ok(payload) => payload,
        Err(e) => {
            error!("--data is not valid JSON: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut events = bus.events();
    if !connect_configured(bus, settings, Some(protocol)) {
        error!("The {protocol} transport is not configured");
        return ExitCode::FAILURE;
    }

    let id = match bus.publish(channel, payload, protocol, priority, ack) {
        Ok(id) => id,
        Err(e) => {
            error!("Publish failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("Published {id} on {channel}");

    let outcome = tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(BusEvent::Delivered { id: delivered, .. }) if delivered == id => return true,
                Ok(BusEvent::Error {
                    message: Some(failed),
                    error,
                    ..
                }) if failed == id => {
                    error!("Delivery failed: {error}");
                    return false;
                }
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await;

    match outcome {
        Ok(true) => {
            info!("Delivered {id}");
            ExitCode::SUCCESS
        }
        Ok(false) => ExitCode::FAILURE,
        Err(_) => {
            warn!("No delivery confirmation for {id} within {wait:?}");
            ExitCode::FAILURE
        }
    }
}
