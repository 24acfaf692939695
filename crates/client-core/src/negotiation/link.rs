//! Peer link seam
//!
//! A [`PeerLink`] is one peer-to-peer media connection as provided by the
//! platform's real-time media stack. The negotiation engine drives it through
//! offer/answer and candidate exchange and listens to its events.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use callwire_signaling_transport::{IceCandidate, Subscription};

use super::NegotiationError;
use crate::media::{LocalMedia, RemoteMedia};

/// Which half of the offer/answer exchange a description is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description produced or consumed by a peer link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity reported by the peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    /// Connectivity lost after being connected
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::New => "new",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Events raised by a peer link
#[derive(Debug, Clone, PartialEq)]
pub enum PeerLinkEvent {
    /// A local connectivity candidate was gathered
    LocalCandidate(IceCandidate),
    StateChanged(LinkState),
    /// The peer's media arrived
    RemoteMedia(RemoteMedia),
}

/// Settings for creating a peer link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
}

/// One peer-to-peer media connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Add the tracks of a local capture stream to the link
    fn add_local_media(&mut self, media: &dyn LocalMedia) -> Result<(), NegotiationError>;

    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError>;

    /// Apply our own description; starts candidate gathering
    async fn set_local_description(&mut self, description: SessionDescription) -> Result<(), NegotiationError>;

    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<(), NegotiationError>;

    /// Apply a remote candidate. Links may refuse candidates that arrive
    /// before the remote description.
    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    fn subscribe(&self) -> Subscription<PeerLinkEvent>;

    /// Tear the connection down
    fn close(&mut self);
}

/// Creates peer links
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(&self, config: &LinkConfig) -> Result<Box<dyn PeerLink>, NegotiationError>;
}
