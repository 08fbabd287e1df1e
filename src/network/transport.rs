//! WebSocket link to the agent
//!
//! The socket is split into a writer task draining the outbound channel
//! and a reader task turning text frames into `TransportEvent`s. Dropping
//! the outbound sender closes the socket.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::TransportConfig;
use crate::error::NetworkError;
use crate::protocol::{InboundMessage, OutboundMessage};

const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 1024;

/// Something that happened on the link
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// A frame that did not parse; the link stays open
    Malformed(String),
    /// Remote close or transport failure, with a reason when known
    Closed(Option<String>),
}

/// Parse one inbound text frame
pub fn parse_frame(text: &str) -> TransportEvent {
    match InboundMessage::from_json(text) {
        Ok(message) => TransportEvent::Message(message),
        Err(e) => TransportEvent::Malformed(e.to_string()),
    }
}

/// Both directions of an open link
pub struct TransportLink {
    pub outbound: mpsc::Sender<OutboundMessage>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

impl TransportLink {
    /// A link whose far end is held by the caller
    pub fn in_memory(capacity: usize) -> (Self, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            RemoteEnd {
                received: out_rx,
                events: in_tx,
            },
        )
    }
}

/// Agent side of an in-memory link
pub struct RemoteEnd {
    /// Everything the client sent
    pub received: mpsc::Receiver<OutboundMessage>,
    pub events: mpsc::Sender<TransportEvent>,
}

impl RemoteEnd {
    pub async fn send(&self, message: InboundMessage) -> Result<(), NetworkError> {
        self.events
            .send(TransportEvent::Message(message))
            .await
            .map_err(|_| NetworkError::TransportClosed)
    }

    /// Deliver a raw text frame as if read from a socket
    pub async fn send_text(&self, text: &str) -> Result<(), NetworkError> {
        self.events
            .send(parse_frame(text))
            .await
            .map_err(|_| NetworkError::TransportClosed)
    }

    pub async fn close(&self, reason: Option<&str>) -> Result<(), NetworkError> {
        self.events
            .send(TransportEvent::Closed(reason.map(str::to_string)))
            .await
            .map_err(|_| NetworkError::TransportClosed)
    }
}

/// Open the WebSocket to the configured agent endpoint
pub async fn connect(config: &TransportConfig) -> Result<TransportLink, NetworkError> {
    let url = config.endpoint();
    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        return Err(NetworkError::ConnectionFailed(format!(
            "Unsupported URL scheme: {}",
            url
        )));
    }

    tracing::info!("Connecting to {}", url);
    let (socket, _) = tokio::time::timeout(
        Duration::from_millis(config.connect_timeout_ms),
        connect_async(url.as_str()),
    )
    .await
    .map_err(|_| NetworkError::Timeout)?
    .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
    tracing::info!("Connected to {}", url);

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(INBOUND_CAPACITY);

    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("Dropping unserializable message: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                tracing::warn!("WebSocket send failed: {}", e);
                break;
            }
        }
        if let Err(e) = sink.close().await {
            tracing::debug!("WebSocket close: {}", e);
        }
        tracing::debug!("Writer task finished");
    });

    tokio::spawn(async move {
        let reason = loop {
            let Some(frame) = stream.next().await else {
                break None;
            };
            match frame {
                Ok(Message::Text(text)) => {
                    if in_tx.send(parse_frame(&text)).await.is_err() {
                        return;
                    }
                }
                Ok(Message::Close(frame)) => {
                    break frame.map(|f| f.reason.to_string());
                }
                Ok(Message::Binary(data)) => {
                    tracing::debug!("Ignoring {} byte binary frame", data.len());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("WebSocket receive failed: {}", e);
                    break Some(e.to_string());
                }
            }
        };
        let _ = in_tx.send(TransportEvent::Closed(reason)).await;
        tracing::debug!("Reader task finished");
    });

    Ok(TransportLink {
        outbound: out_tx,
        inbound: in_rx,
    })
}
