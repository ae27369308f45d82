//! WebSocket rendezvous channel
//!
//! Signaling frames are JSON text. Outbound payloads that are valid UTF-8 go out
//! as text frames; anything else is sent binary. Inbound text and binary frames
//! are both surfaced as [`TransportEvent::Data`].

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info};

use crate::error::{Result, TransportError};
use crate::traits::{Connector, TransportEvent, TransportReceiver, TransportSender};

/// WebSocket configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Give up on the handshake after this long
    pub connect_timeout: Duration,
    /// Capacity of the outbound and event queues
    pub channel_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 100,
        }
    }
}

/// WebSocket connector for the rendezvous server
pub struct WebSocketTransport {
    config: WebSocketConfig,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            config: WebSocketConfig::default(),
        }
    }

    pub fn with_config(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket sender
pub struct WebSocketSender {
    tx: mpsc::Sender<WsMessage>,
    connected: Arc<Mutex<bool>>,
}

#[async_trait]
impl TransportSender for WebSocketSender {
    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let msg = match std::str::from_utf8(&data) {
            Ok(text) => WsMessage::Text(text.to_owned()),
            Err(_) => WsMessage::Binary(data.to_vec()),
        };

        self.tx
            .send(msg)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    async fn close(&self) -> Result<()> {
        let _ = self.tx.send(WsMessage::Close(None)).await;
        *self.connected.lock() = false;
        Ok(())
    }
}

/// WebSocket receiver
pub struct WebSocketReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for WebSocketReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

impl WebSocketTransport {
    /// Open a channel to `url`
    pub async fn open(&self, url: &str) -> Result<(WebSocketSender, WebSocketReceiver)> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(TransportError::InvalidUrl(url.to_string()));
        }
        url::Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        info!("Connecting to rendezvous server: {}", url);

        let (ws_stream, response) =
            tokio::time::timeout(self.config.connect_timeout, connect_async(url))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        debug!("WebSocket connected, response: {:?}", response.status());

        let (write, read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::channel::<WsMessage>(self.config.channel_capacity);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(self.config.channel_capacity);

        let connected = Arc::new(Mutex::new(true));
        let connected_write = connected.clone();
        let connected_read = connected.clone();

        // Writer
        tokio::spawn(async move {
            let mut write = write;
            while let Some(msg) = send_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if let Err(e) = write.send(msg).await {
                    error!("WebSocket write error: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            *connected_write.lock() = false;
        });

        // Reader
        tokio::spawn(async move {
            let mut read = read;

            let _ = event_tx.send(TransportEvent::Connected).await;

            let mut reason = None;
            while let Some(result) = read.next().await {
                match result {
                    Ok(WsMessage::Text(text)) => {
                        let _ = event_tx.send(TransportEvent::Data(Bytes::from(text))).await;
                    }
                    Ok(WsMessage::Binary(data)) => {
                        let _ = event_tx.send(TransportEvent::Data(Bytes::from(data))).await;
                    }
                    Ok(WsMessage::Close(frame)) => {
                        reason = frame.map(|f| f.reason.to_string());
                        info!("WebSocket closed: {:?}", reason);
                        break;
                    }
                    // Pings are answered by tungstenite
                    Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => {}
                    Err(e) => {
                        error!("WebSocket read error: {}", e);
                        let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                        reason = Some(e.to_string());
                        break;
                    }
                }
            }

            *connected_read.lock() = false;
            let _ = event_tx.send(TransportEvent::Disconnected { reason }).await;
        });

        Ok((
            WebSocketSender {
                tx: send_tx,
                connected,
            },
            WebSocketReceiver { rx: event_rx },
        ))
    }
}

#[async_trait]
impl Connector for WebSocketTransport {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn TransportSender>, Box<dyn TransportReceiver>)> {
        let (sender, receiver) = self.open(url).await?;
        Ok((Box::new(sender), Box::new(receiver)))
    }
}
