//! Simulated media and peer-link backends
//!
//! Deterministic stand-ins for the platform capture device and real-time
//! media stack. They are used by the test suite and by the `callwire` CLI to
//! exercise signaling end to end without devices or a network path.
//!
//! [`SimulatedMediaCapture`] models one exclusive capture device that can be
//! told to deny permission. [`SimulatedPeerLinkFactory`] creates links that
//! gather two host candidates once the local description is set and connect
//! once both descriptions and at least one remote candidate are applied, or
//! fail or stall, per [`LinkBehavior`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use callwire_signaling_transport::{IceCandidate, Subscribers, Subscription};

use crate::media::{LocalMedia, MediaCapture, MediaConstraints, MediaError, MediaKind, RemoteMedia};
use crate::negotiation::{
    LinkConfig, LinkState, NegotiationError, PeerLink, PeerLinkEvent, PeerLinkFactory, SdpKind,
    SessionDescription,
};

const CANDIDATES_PER_LINK: u16 = 2;

struct CaptureState {
    holder: Option<String>,
    denial: Option<MediaError>,
    delay: Duration,
    acquisitions: u32,
}

/// One exclusive capture device
#[derive(Clone)]
pub struct SimulatedMediaCapture {
    state: Arc<Mutex<CaptureState>>,
}

impl Default for SimulatedMediaCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedMediaCapture {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CaptureState {
                holder: None,
                denial: None,
                delay: Duration::ZERO,
                acquisitions: 0,
            })),
        }
    }

    /// Fail every later acquisition with `error`; `None` restores access
    pub fn set_denial(&self, error: Option<MediaError>) {
        self.state.lock().denial = error;
    }

    /// Make acquisition take `delay`, like a permission prompt would
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    /// Whether a stream currently holds the device
    pub fn in_use(&self) -> bool {
        self.state.lock().holder.is_some()
    }

    /// Number of successful acquisitions so far
    pub fn acquisitions(&self) -> u32 {
        self.state.lock().acquisitions
    }
}

#[async_trait]
impl MediaCapture for SimulatedMediaCapture {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Box<dyn LocalMedia>, MediaError> {
        let delay = self.state.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(error) = state.denial.clone() {
            return Err(error);
        }
        if state.holder.is_some() {
            return Err(MediaError::DeviceBusy);
        }
        let kinds = constraints.kinds();
        if kinds.is_empty() {
            return Err(MediaError::NoDevice(MediaKind::Audio));
        }

        let id = format!("local-{}", uuid::Uuid::new_v4().simple());
        state.holder = Some(id.clone());
        state.acquisitions += 1;
        debug!(media_id = %id, ?kinds, "Simulated capture acquired");

        Ok(Box::new(SimulatedLocalMedia {
            id,
            audio_enabled: constraints.audio,
            video_enabled: constraints.video,
            kinds,
            stopped: false,
            device: Arc::clone(&self.state),
        }))
    }
}

/// Stream handed out by [`SimulatedMediaCapture`]
pub struct SimulatedLocalMedia {
    id: String,
    kinds: Vec<MediaKind>,
    audio_enabled: bool,
    video_enabled: bool,
    stopped: bool,
    device: Arc<Mutex<CaptureState>>,
}

impl std::fmt::Debug for SimulatedLocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedLocalMedia")
            .field("id", &self.id)
            .field("kinds", &self.kinds)
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl LocalMedia for SimulatedLocalMedia {
    fn id(&self) -> &str {
        &self.id
    }

    fn kinds(&self) -> Vec<MediaKind> {
        self.kinds.clone()
    }

    fn set_enabled(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.audio_enabled = enabled,
            MediaKind::Video => self.video_enabled = enabled,
        }
    }

    fn is_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_enabled && self.kinds.contains(&MediaKind::Audio),
            MediaKind::Video => self.video_enabled && self.kinds.contains(&MediaKind::Video),
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let mut device = self.device.lock();
        if device.holder.as_deref() == Some(self.id.as_str()) {
            device.holder = None;
        }
        debug!(media_id = %self.id, "Simulated capture released");
    }

    fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl Drop for SimulatedLocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

/// How simulated links behave once both sides have exchanged descriptions
/// and candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkBehavior {
    Connect,
    Fail,
    /// Never leave `Connecting`
    Stall,
}

struct LinkShared {
    index: usize,
    behavior: LinkBehavior,
    state: LinkState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    media: Vec<(String, Vec<MediaKind>)>,
    applied_candidates: Vec<IceCandidate>,
    close_count: u32,
}

impl LinkShared {
    /// Advance towards a connectivity outcome; returns events to publish
    fn evaluate(&mut self) -> Vec<PeerLinkEvent> {
        let ready = self.state == LinkState::Connecting
            && self.local_description.is_some()
            && self.remote_description.is_some()
            && !self.applied_candidates.is_empty();
        if !ready {
            return Vec::new();
        }

        match self.behavior {
            LinkBehavior::Connect => {
                self.state = LinkState::Connected;
                vec![
                    PeerLinkEvent::StateChanged(LinkState::Connected),
                    PeerLinkEvent::RemoteMedia(RemoteMedia {
                        id: format!("remote-{}", self.index),
                        kinds: vec![MediaKind::Audio, MediaKind::Video],
                    }),
                ]
            }
            LinkBehavior::Fail => {
                self.state = LinkState::Failed;
                vec![PeerLinkEvent::StateChanged(LinkState::Failed)]
            }
            LinkBehavior::Stall => Vec::new(),
        }
    }
}

/// Test-side view of a link created by [`SimulatedPeerLinkFactory`]
#[derive(Clone)]
pub struct SimulatedLinkHandle {
    shared: Arc<Mutex<LinkShared>>,
    events: Subscribers<PeerLinkEvent>,
}

impl SimulatedLinkHandle {
    /// How many times `close()` reached the link
    pub fn close_count(&self) -> u32 {
        self.shared.lock().close_count
    }

    pub fn state(&self) -> LinkState {
        self.shared.lock().state
    }

    /// Remote candidates applied, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.shared.lock().applied_candidates.clone()
    }

    /// Ids of local streams added to the link
    pub fn local_media_ids(&self) -> Vec<String> {
        self.shared.lock().media.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Lose connectivity on a connected link
    pub fn drop_connection(&self) {
        let dropped = {
            let mut shared = self.shared.lock();
            if shared.state == LinkState::Connected {
                shared.state = LinkState::Disconnected;
                true
            } else {
                false
            }
        };
        if dropped {
            self.events
                .publish(PeerLinkEvent::StateChanged(LinkState::Disconnected));
        }
    }
}

/// Link created by [`SimulatedPeerLinkFactory`]
pub struct SimulatedPeerLink {
    handle: SimulatedLinkHandle,
}

impl SimulatedPeerLink {
    fn publish_all(&self, events: Vec<PeerLinkEvent>) {
        for event in events {
            self.handle.events.publish(event);
        }
    }

    fn describe(shared: &LinkShared, kind: SdpKind) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no=- {} 1 IN IP4 0.0.0.0\r\ns=callwire\r\nt=0 0\r\n",
            shared.index
        );
        for (_, kinds) in &shared.media {
            for kind in kinds {
                sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 0\r\n", kind));
            }
        }
        SessionDescription { kind, sdp }
    }

    fn ensure_open(shared: &LinkShared) -> Result<(), NegotiationError> {
        if shared.state == LinkState::Closed {
            Err(NegotiationError::link("link closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerLink for SimulatedPeerLink {
    fn add_local_media(&mut self, media: &dyn LocalMedia) -> Result<(), NegotiationError> {
        let mut shared = self.handle.shared.lock();
        Self::ensure_open(&shared)?;
        shared.media.push((media.id().to_string(), media.kinds()));
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let shared = self.handle.shared.lock();
        Self::ensure_open(&shared)?;
        Ok(Self::describe(&shared, SdpKind::Offer))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let shared = self.handle.shared.lock();
        Self::ensure_open(&shared)?;
        match &shared.remote_description {
            Some(remote) if remote.kind == SdpKind::Offer => Ok(Self::describe(&shared, SdpKind::Answer)),
            _ => Err(NegotiationError::link("no remote offer to answer")),
        }
    }

    async fn set_local_description(&mut self, description: SessionDescription) -> Result<(), NegotiationError> {
        let events = {
            let mut shared = self.handle.shared.lock();
            Self::ensure_open(&shared)?;
            shared.local_description = Some(description);

            let mut events = Vec::new();
            if shared.state == LinkState::New {
                shared.state = LinkState::Connecting;
                events.push(PeerLinkEvent::StateChanged(LinkState::Connecting));
            }
            for n in 0..CANDIDATES_PER_LINK {
                events.push(PeerLinkEvent::LocalCandidate(IceCandidate {
                    candidate: format!(
                        "candidate:{} 1 udp 2122260223 10.0.{}.{} {} typ host",
                        n,
                        shared.index,
                        n + 1,
                        50000 + n
                    ),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                }));
            }
            events.extend(shared.evaluate());
            events
        };
        self.publish_all(events);
        Ok(())
    }

    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<(), NegotiationError> {
        let events = {
            let mut shared = self.handle.shared.lock();
            Self::ensure_open(&shared)?;
            shared.remote_description = Some(description);
            shared.evaluate()
        };
        self.publish_all(events);
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let events = {
            let mut shared = self.handle.shared.lock();
            Self::ensure_open(&shared)?;
            if shared.remote_description.is_none() {
                return Err(NegotiationError::link("candidate before remote description"));
            }
            shared.applied_candidates.push(candidate);
            shared.evaluate()
        };
        self.publish_all(events);
        Ok(())
    }

    fn subscribe(&self) -> Subscription<PeerLinkEvent> {
        self.handle.events.subscribe()
    }

    fn close(&mut self) {
        let first = {
            let mut shared = self.handle.shared.lock();
            shared.close_count += 1;
            let first = shared.state != LinkState::Closed;
            shared.state = LinkState::Closed;
            first
        };
        if first {
            self.handle
                .events
                .publish(PeerLinkEvent::StateChanged(LinkState::Closed));
        }
    }
}

struct FactoryState {
    behavior: LinkBehavior,
    links: Vec<SimulatedLinkHandle>,
}

/// Creates [`SimulatedPeerLink`]s and keeps a handle to each
#[derive(Clone)]
pub struct SimulatedPeerLinkFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl Default for SimulatedPeerLinkFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPeerLinkFactory {
    /// Factory whose links connect
    pub fn new() -> Self {
        Self::with_behavior(LinkBehavior::Connect)
    }

    pub fn with_behavior(behavior: LinkBehavior) -> Self {
        Self {
            state: Arc::new(Mutex::new(FactoryState {
                behavior,
                links: Vec::new(),
            })),
        }
    }

    /// Behaviour of links created from now on
    pub fn set_behavior(&self, behavior: LinkBehavior) {
        self.state.lock().behavior = behavior;
    }

    /// Every link created so far, oldest first
    pub fn links(&self) -> Vec<SimulatedLinkHandle> {
        self.state.lock().links.clone()
    }

    pub fn last_link(&self) -> Option<SimulatedLinkHandle> {
        self.state.lock().links.last().cloned()
    }
}

#[async_trait]
impl PeerLinkFactory for SimulatedPeerLinkFactory {
    async fn create(&self, config: &LinkConfig) -> Result<Box<dyn PeerLink>, NegotiationError> {
        let mut state = self.state.lock();
        let index = state.links.len() + 1;
        debug!(index, ice_servers = ?config.ice_servers, "Creating simulated peer link");

        let handle = SimulatedLinkHandle {
            shared: Arc::new(Mutex::new(LinkShared {
                index,
                behavior: state.behavior,
                state: LinkState::New,
                local_description: None,
                remote_description: None,
                media: Vec::new(),
                applied_candidates: Vec::new(),
                close_count: 0,
            })),
            events: Subscribers::new(),
        };
        state.links.push(handle.clone());
        Ok(Box::new(SimulatedPeerLink { handle }))
    }
}
