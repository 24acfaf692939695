//! Client builder
//!
//! A fluent builder that wires the relay transport, the media capture
//! device, the peer-link factory and an optional identity directory into a
//! running [`CallClient`].
//!
//! # Examples
//!
//! ## WebSocket relay
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use callwire_client_core::ClientBuilder;
//! use callwire_client_core::sim::{SimulatedMediaCapture, SimulatedPeerLinkFactory};
//!
//! # async fn example() -> callwire_client_core::ClientResult<()> {
//! let client = ClientBuilder::new()
//!     .relay_url("wss://relay.example.com/signal")
//!     .ring_timeout(Duration::from_secs(45))
//!     .media_capture(Arc::new(SimulatedMediaCapture::new()))
//!     .peer_links(Arc::new(SimulatedPeerLinkFactory::new()))
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Missing collaborators are reported at build time
//!
//! ```rust
//! use callwire_client_core::{ClientBuilder, ClientError};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let err = ClientBuilder::new().relay_url("ws://127.0.0.1:9000").build().await.unwrap_err();
//! assert!(matches!(err, ClientError::Configuration { .. }));
//! # })
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use callwire_signaling_transport::{SignalingTransport, Subscribers, TransportConfig, WebSocketTransport};

use super::engine::{Engine, EngineParts};
use super::{CallClient, ClientConfig};
use crate::directory::IdentityDirectory;
use crate::error::{ClientError, ClientResult};
use crate::media::MediaCapture;
use crate::negotiation::PeerLinkFactory;
use crate::registration::PresenceRegistry;

enum TransportSource {
    None,
    Ready(Arc<dyn SignalingTransport>),
    WebSocket(TransportConfig),
}

/// Fluent builder for [`CallClient`]
pub struct ClientBuilder {
    config: ClientConfig,
    transport: TransportSource,
    media: Option<Arc<dyn MediaCapture>>,
    links: Option<Arc<dyn PeerLinkFactory>>,
    directory: Option<Arc<dyn IdentityDirectory>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            transport: TransportSource::None,
            media: None,
            links: None,
            directory: None,
        }
    }

    /// Use an existing relay transport
    pub fn transport(mut self, transport: Arc<dyn SignalingTransport>) -> Self {
        self.transport = TransportSource::Ready(transport);
        self
    }

    /// Connect to a WebSocket relay with the default reconnect policy
    pub fn relay_url(self, url: impl Into<String>) -> Self {
        self.transport_config(TransportConfig::new(url))
    }

    /// Connect to a WebSocket relay with explicit transport settings
    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport = TransportSource::WebSocket(config);
        self
    }

    /// Camera and microphone access
    pub fn media_capture(mut self, media: Arc<dyn MediaCapture>) -> Self {
        self.media = Some(media);
        self
    }

    /// Factory for peer-to-peer media links
    pub fn peer_links(mut self, links: Arc<dyn PeerLinkFactory>) -> Self {
        self.links = Some(links);
        self
    }

    /// Display-name lookup for incoming calls
    pub fn directory(mut self, directory: Arc<dyn IdentityDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn ring_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_ring_timeout(timeout);
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_negotiation_timeout(timeout);
        self
    }

    /// Validate the configuration and start the client's engine
    pub async fn build(self) -> ClientResult<Arc<CallClient>> {
        self.config.validate()?;
        let media = self
            .media
            .ok_or_else(|| ClientError::config("a media capture implementation is required"))?;
        let links = self
            .links
            .ok_or_else(|| ClientError::config("a peer link factory is required"))?;
        let transport: Arc<dyn SignalingTransport> = match self.transport {
            TransportSource::Ready(transport) => transport,
            TransportSource::WebSocket(config) => Arc::new(WebSocketTransport::new(config)?),
            TransportSource::None => {
                return Err(ClientError::config("a relay url or transport is required"));
            }
        };

        let registry = Arc::new(PresenceRegistry::new(Arc::clone(&transport)));
        let events = Subscribers::new();
        let (session_tx, session_rx) = watch::channel(None);
        let (commands, inbox) = mpsc::unbounded_channel();

        let engine = Engine::new(
            EngineParts {
                config: self.config.clone(),
                transport: Arc::clone(&transport),
                registry: Arc::clone(&registry),
                media,
                links,
                directory: self.directory,
                events: events.clone(),
                session: session_tx,
            },
            commands.clone(),
        );
        let handle = tokio::spawn(engine.run(inbox));

        Ok(Arc::new(CallClient {
            config: self.config,
            transport,
            registry,
            commands,
            events,
            session: session_rx,
            engine: Mutex::new(Some(handle)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedMediaCapture, SimulatedPeerLinkFactory};
    use callwire_signaling_transport::{LoopbackRelay, LoopbackTransport, RetryConfig};

    #[tokio::test]
    async fn requires_transport_media_and_links() {
        let err = ClientBuilder::new()
            .media_capture(Arc::new(SimulatedMediaCapture::new()))
            .peer_links(Arc::new(SimulatedPeerLinkFactory::new()))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Configuration { .. }));

        let relay = LoopbackRelay::new();
        let err = ClientBuilder::new()
            .transport(Arc::new(LoopbackTransport::new(&relay, RetryConfig::quick())))
            .media_capture(Arc::new(SimulatedMediaCapture::new()))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Configuration { .. }));
    }

    #[tokio::test]
    async fn rejects_non_websocket_relay_urls() {
        let err = ClientBuilder::new()
            .relay_url("http://relay.example.com")
            .media_capture(Arc::new(SimulatedMediaCapture::new()))
            .peer_links(Arc::new(SimulatedPeerLinkFactory::new()))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let relay = LoopbackRelay::new();
        let err = ClientBuilder::new()
            .transport(Arc::new(LoopbackTransport::new(&relay, RetryConfig::quick())))
            .media_capture(Arc::new(SimulatedMediaCapture::new()))
            .peer_links(Arc::new(SimulatedPeerLinkFactory::new()))
            .ring_timeout(Duration::ZERO)
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Configuration { .. }));
    }
}
