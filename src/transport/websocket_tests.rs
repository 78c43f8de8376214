use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::bus::message::{Message, Priority, Protocol};
use crate::config::WebSocketSettings;
use crate::transport::message::Envelope;
use crate::transport::websocket::WebSocketTransport;
use crate::transport::{Transport, TransportEvent, TransportEvents};
use crate::utils::error::TransportError;

async fn next_matching<F>(
    rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    mut pred: F,
) -> TransportEvent
where
    F: FnMut(&TransportEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for transport event")
}

fn settings_for(addr: std::net::SocketAddr) -> WebSocketSettings {
    WebSocketSettings {
        url: format!("ws://{addr}"),
        reconnect_interval_ms: 50,
        heartbeat_interval_ms: 1000,
        connect_timeout_ms: 1000,
        auto_reconnect: true,
    }
}

/// Accept one client and echo every text frame back.
async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(frame)) = ws.next().await {
            if frame.is_text() && ws.send(frame).await.is_err() {
                break;
            }
        }
    });
    addr
}

#[tokio::test]
async fn test_websocket_send_and_receive_envelopes() {
    let addr = spawn_echo_server().await;
    let mut transport = WebSocketTransport::new(settings_for(addr));
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.connect(TransportEvents::new(Protocol::WebSocket, tx));

    next_matching(&mut rx, |e| {
        matches!(e, TransportEvent::Connected(Protocol::WebSocket))
    })
    .await;

    let msg = Message::new(
        "telescope.position",
        json!({"alt": 45.0, "az": 180.0}),
        Protocol::WebSocket,
        Priority::Critical,
    );
    let id = msg.id().to_string();
    transport.send(msg).unwrap();

    match next_matching(&mut rx, |e| matches!(e, TransportEvent::Sent { .. })).await {
        TransportEvent::Sent { protocol, id: sent } => {
            assert_eq!(protocol, Protocol::WebSocket);
            assert_eq!(sent, id);
        }
        other => panic!("unexpected {other:?}"),
    }

    match next_matching(&mut rx, |e| matches!(e, TransportEvent::Received(_))).await {
        TransportEvent::Received(echoed) => {
            assert_eq!(echoed.id(), id);
            assert_eq!(echoed.channel, "telescope.position");
            assert_eq!(echoed.priority(), Priority::Critical);
            assert_eq!(echoed.payload, json!({"alt": 45.0, "az": 180.0}));
        }
        other => panic!("unexpected {other:?}"),
    }

    transport.disconnect();
}

#[tokio::test]
async fn test_websocket_invalid_frame_reports_protocol_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(WsMessage::text("{not json")).await.unwrap();
        // hold the connection open
        while ws.next().await.is_some() {}
    });

    let mut transport = WebSocketTransport::new(settings_for(addr));
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.connect(TransportEvents::new(Protocol::WebSocket, tx));

    match next_matching(&mut rx, |e| matches!(e, TransportEvent::Error { .. })).await {
        TransportEvent::Error { protocol, error } => {
            assert_eq!(protocol, Protocol::WebSocket);
            assert!(matches!(error, TransportError::Protocol(_)));
        }
        other => panic!("unexpected {other:?}"),
    }

    transport.disconnect();
}

#[tokio::test]
async fn test_websocket_reconnects_after_server_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // first session is closed right away, the second one stays up
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.close(None).await.unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let mut transport = WebSocketTransport::new(settings_for(addr));
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.connect(TransportEvents::new(Protocol::WebSocket, tx));

    next_matching(&mut rx, |e| matches!(e, TransportEvent::Connected(_))).await;
    next_matching(&mut rx, |e| matches!(e, TransportEvent::Disconnected(_))).await;
    match next_matching(&mut rx, |e| matches!(e, TransportEvent::Reconnecting { .. })).await {
        TransportEvent::Reconnecting { attempt, delay, .. } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay, Duration::from_millis(50));
        }
        other => panic!("unexpected {other:?}"),
    }
    next_matching(&mut rx, |e| matches!(e, TransportEvent::Connected(_))).await;

    transport.disconnect();
}

#[tokio::test]
async fn test_websocket_envelope_text_matches_wire_format() {
    let msg = Message::new("guider", json!([1, 2]), Protocol::WebSocket, Priority::Low)
        .requiring_ack(true);
    let envelope = Envelope::from_message(&msg);
    let text = envelope.to_json().unwrap();
    let parsed = Envelope::from_slice(text.as_bytes()).unwrap();
    assert_eq!(parsed, envelope);
    assert!(text.contains("\"requiresAck\":true"));
}

#[tokio::test]
async fn test_websocket_pings_peer_every_heartbeat_interval() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(frame)) = ws.next().await {
            if let WsMessage::Ping(payload) = frame {
                let _ = ping_tx.send(payload.to_vec());
            }
        }
    });

    let mut transport = WebSocketTransport::new(WebSocketSettings {
        heartbeat_interval_ms: 50,
        ..settings_for(addr)
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.connect(TransportEvents::new(Protocol::WebSocket, tx));
    next_matching(&mut rx, |e| matches!(e, TransportEvent::Connected(_))).await;

    for _ in 0..2 {
        let payload = tokio::time::timeout(Duration::from_secs(1), ping_rx.recv())
            .await
            .expect("no heartbeat ping")
            .expect("server task ended");
        assert_eq!(payload, b"astrobus-ping".to_vec());
    }

    transport.disconnect();
}
