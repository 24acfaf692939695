//! Error types for the signaling transport

use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on the relay link
#[derive(Debug, Error)]
pub enum Error {
    /// The link is not open; the message was dropped, not queued
    #[error("Transport is not connected")]
    NotConnected,

    /// Every connection attempt failed
    #[error("Failed to connect after {attempts} attempts: {reason}")]
    ConnectFailed { attempts: u32, reason: String },

    /// The relay URL could not be parsed
    #[error("Invalid relay URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A message could not be serialized
    #[error("Failed to encode signaling message: {0}")]
    Encode(#[source] serde_json::Error),

    /// A frame could not be parsed as a signaling message
    #[error("Failed to decode signaling message: {0}")]
    Decode(#[source] serde_json::Error),

    /// Underlying link failure
    #[error("Link error: {message}")]
    Link { message: String },
}

impl Error {
    /// Create a link error
    pub fn link(message: impl Into<String>) -> Self {
        Self::Link {
            message: message.into(),
        }
    }

    /// Whether retrying on a fresh connection may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Link { .. })
    }
}
