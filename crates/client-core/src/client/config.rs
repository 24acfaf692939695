//! Client configuration
//!
//! [`ClientConfig`] carries the call timers, the media constraints requested
//! when a call needs the camera and microphone, and the ICE servers handed to
//! each peer link. Every field has a default, so a partial JSON document is a
//! valid configuration.
//!
//! # Usage Examples
//!
//! ## Builder-style configuration
//!
//! ```rust
//! use std::time::Duration;
//! use callwire_client_core::client::config::ClientConfig;
//! use callwire_client_core::MediaConstraints;
//!
//! let config = ClientConfig::new()
//!     .with_ring_timeout(Duration::from_secs(45))
//!     .with_media(MediaConstraints::audio_only());
//!
//! assert_eq!(config.ring_timeout(), Duration::from_secs(45));
//! assert!(!config.media.video);
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Loading from JSON
//!
//! ```rust
//! use callwire_client_core::client::config::ClientConfig;
//!
//! let config = ClientConfig::from_json(r#"{ "negotiation_timeout_secs": 5 }"#).unwrap();
//! assert_eq!(config.negotiation_timeout_secs, 5);
//! assert_eq!(config.ring_timeout_secs, 30);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};
use crate::media::MediaConstraints;
use crate::negotiation::LinkConfig;

/// Default public STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Main configuration for the call client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a call may ring, on either side, before it fails as "no answer"
    pub ring_timeout_secs: u64,

    /// How long CONNECTING may last before the call fails
    pub negotiation_timeout_secs: u64,

    /// How long `start` waits for the relay to confirm registration
    pub registration_timeout_secs: u64,

    /// Tracks requested from the capture device for each call
    pub media: MediaConstraints,

    /// STUN/TURN servers for peer links
    pub ice_servers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 30,
            negotiation_timeout_secs: 20,
            registration_timeout_secs: 10,
            media: MediaConstraints::default(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON configuration document; missing fields take defaults
    pub fn from_json(json: &str) -> ClientResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ClientError::config(format!("invalid client config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_ring_timeout(mut self, timeout: Duration) -> Self {
        self.ring_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_media(mut self, media: MediaConstraints) -> Self {
        self.media = media;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }

    /// Reject configurations the client cannot run with
    pub fn validate(&self) -> ClientResult<()> {
        if self.ring_timeout_secs == 0 {
            return Err(ClientError::config("ring timeout must be at least one second"));
        }
        if self.negotiation_timeout_secs == 0 {
            return Err(ClientError::config("negotiation timeout must be at least one second"));
        }
        if self.registration_timeout_secs == 0 {
            return Err(ClientError::config("registration timeout must be at least one second"));
        }
        if !self.media.audio && !self.media.video {
            return Err(ClientError::config("media constraints request no tracks"));
        }
        if let Some(bad) = self
            .ice_servers
            .iter()
            .find(|s| !(s.starts_with("stun:") || s.starts_with("turn:") || s.starts_with("turns:")))
        {
            return Err(ClientError::config(format!("unsupported ICE server url: {}", bad)));
        }
        Ok(())
    }
}
