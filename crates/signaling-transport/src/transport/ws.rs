//! WebSocket relay link

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

use super::{Connector, Link, ReconnectingTransport, TransportConfig};
use crate::error::{Error, Result};
use crate::message::SignalingMessage;

/// Relay transport over WebSocket text frames, one JSON message per frame
pub type WebSocketTransport = ReconnectingTransport<WsConnector>;

impl WebSocketTransport {
    /// Validate the relay URL and build a transport; nothing is opened yet
    pub fn new(config: TransportConfig) -> Result<Self> {
        let url = Url::parse(&config.url).map_err(|e| Error::InvalidUrl {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::InvalidUrl {
                url: config.url.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        let connector = WsConnector {
            url,
            connect_timeout: config.connect_timeout,
        };
        Ok(Self::with_connector(connector, config.reconnect))
    }
}

/// Opens WebSocket connections to one relay URL
pub struct WsConnector {
    url: Url,
    connect_timeout: Duration,
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self) -> std::result::Result<Box<dyn Link>, String> {
        let attempt = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()));
        match attempt.await {
            Ok(Ok((stream, response))) => {
                debug!(url = %self.url, status = %response.status(), "WebSocket handshake complete");
                Ok(Box::new(WsLink { stream }))
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "connect timed out after {}ms",
                self.connect_timeout.as_millis()
            )),
        }
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn recv(&mut self) -> std::result::Result<Option<SignalingMessage>, String> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match SignalingMessage::decode(&text) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => warn!("Ignoring undecodable relay frame: {}", e),
                },
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => match SignalingMessage::decode(text) {
                        Ok(message) => return Ok(Some(message)),
                        Err(e) => warn!("Ignoring undecodable relay frame: {}", e),
                    },
                    Err(_) => warn!(len = data.len(), "Ignoring non-UTF-8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Relay sent close frame");
                    return Ok(None);
                }
                // ping/pong are answered by tungstenite
                Ok(_) => {}
                Err(e) => return Err(e.to_string()),
            }
        }
        Ok(None)
    }

    async fn send(&mut self, message: SignalingMessage) -> std::result::Result<(), String> {
        let text = message.encode().map_err(|e| e.to_string())?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| e.to_string())
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Error closing WebSocket: {}", e);
        }
    }
}
