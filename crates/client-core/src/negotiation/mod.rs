//! Negotiation engine
//!
//! Wraps one [`PeerLink`] for the lifetime of a call's CONNECTING and ACTIVE
//! phases. The engine never talks to the relay itself: every method returns
//! the [`NegotiationEvent`]s the caller must act on, most importantly
//! [`NegotiationEvent::LocalSignal`]s to relay to the peer.
//!
//! ## Roles
//!
//! The party that sent the invite is the [`NegotiationRole::Offerer`] and
//! produces the offer as soon as negotiation begins; local media must be
//! attached first. The [`NegotiationRole::Answerer`] produces an answer when
//! the offer arrives.
//!
//! ## Candidate ordering
//!
//! Local candidates are relayed one by one as the link gathers them. Remote
//! candidates that arrive before the remote description are buffered and
//! applied, in arrival order, right after the description is set.

mod link;
#[cfg(feature = "webrtc")]
mod webrtc_link;

pub use link::{
    LinkConfig, LinkState, PeerLink, PeerLinkEvent, PeerLinkFactory, SdpKind, SessionDescription,
};
#[cfg(feature = "webrtc")]
pub use webrtc_link::{WebRtcPeerLink, WebRtcPeerLinkFactory, link_state, rtc_configuration};

use std::fmt;

use thiserror::Error;
use tracing::{debug, trace};

use callwire_signaling_transport::{CallId, IceCandidate, Subscription};

use crate::media::{LocalMedia, MediaKind, RemoteMedia};

/// Side of the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Connection state as seen by the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::New => "new",
            NegotiationState::Connecting => "connecting",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl From<LinkState> for NegotiationState {
    fn from(state: LinkState) -> Self {
        match state {
            LinkState::New => NegotiationState::New,
            LinkState::Connecting => NegotiationState::Connecting,
            LinkState::Connected => NegotiationState::Connected,
            LinkState::Disconnected | LinkState::Failed => NegotiationState::Failed,
            LinkState::Closed => NegotiationState::Closed,
        }
    }
}

/// Negotiation data exchanged with the peer through the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationSignal {
    Offer(String),
    Answer(String),
    Candidate(IceCandidate),
}

impl NegotiationSignal {
    fn name(&self) -> &'static str {
        match self {
            NegotiationSignal::Offer(_) => "offer",
            NegotiationSignal::Answer(_) => "answer",
            NegotiationSignal::Candidate(_) => "candidate",
        }
    }
}

/// Output of the engine for the orchestrator to act on
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEvent {
    /// Relay this to the peer
    LocalSignal(NegotiationSignal),
    StateChanged(NegotiationState),
    RemoteMediaAvailable(RemoteMedia),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("peer link error: {0}")]
    Link(String),

    #[error("unexpected {signal} while {state}")]
    UnexpectedSignal {
        signal: &'static str,
        state: NegotiationState,
    },

    #[error("negotiation has not begun")]
    NotStarted,

    #[error("offerer needs local media before it can offer")]
    MissingLocalMedia,

    #[error("negotiation engine is closed")]
    Closed,
}

impl NegotiationError {
    pub fn link(message: impl Into<String>) -> Self {
        Self::Link(message.into())
    }
}

/// Drives one peer link through offer/answer and candidate exchange
pub struct NegotiationEngine {
    call_id: CallId,
    link: Box<dyn PeerLink>,
    role: Option<NegotiationRole>,
    state: NegotiationState,
    local_media: Option<Box<dyn LocalMedia>>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    closed: bool,
}

impl fmt::Debug for NegotiationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationEngine")
            .field("call_id", &self.call_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl NegotiationEngine {
    pub fn new(call_id: CallId, link: Box<dyn PeerLink>) -> Self {
        Self {
            call_id,
            link,
            role: None,
            state: NegotiationState::New,
            local_media: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            closed: false,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn role(&self) -> Option<NegotiationRole> {
        self.role
    }

    pub fn connection_state(&self) -> NegotiationState {
        self.state
    }

    /// Events of the underlying link, to be fed back through
    /// [`handle_link_event`](Self::handle_link_event)
    pub fn link_events(&self) -> Subscription<PeerLinkEvent> {
        self.link.subscribe()
    }

    /// Number of remote candidates waiting for the remote description
    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Hand the call's capture stream to the link. The engine owns it from
    /// here on and releases it on [`close`](Self::close).
    pub fn attach_local_media(&mut self, media: Box<dyn LocalMedia>) -> Result<(), NegotiationError> {
        if self.closed {
            return Err(NegotiationError::Closed);
        }
        self.link.add_local_media(media.as_ref())?;
        debug!(call_id = %self.call_id, media_id = media.id(), "Local media attached");
        if let Some(mut previous) = self.local_media.replace(media) {
            previous.stop();
        }
        Ok(())
    }

    pub fn local_media(&self) -> Option<&dyn LocalMedia> {
        self.local_media.as_deref()
    }

    /// Toggle a local track; false when no media is attached
    pub fn set_media_enabled(&mut self, kind: MediaKind, enabled: bool) -> bool {
        match self.local_media.as_mut() {
            Some(media) => {
                media.set_enabled(kind, enabled);
                true
            }
            None => false,
        }
    }

    /// Start negotiating. The offerer produces its offer immediately.
    pub async fn begin(&mut self, role: NegotiationRole) -> Result<Vec<NegotiationEvent>, NegotiationError> {
        if self.closed {
            return Err(NegotiationError::Closed);
        }
        if self.role.is_some() {
            return Err(NegotiationError::UnexpectedSignal {
                signal: "begin",
                state: self.state,
            });
        }

        self.role = Some(role);
        let mut events = Vec::new();
        self.set_state(NegotiationState::Connecting, &mut events);

        if role == NegotiationRole::Offerer {
            if self.local_media.is_none() {
                return Err(NegotiationError::MissingLocalMedia);
            }
            let offer = self.link.create_offer().await?;
            let sdp = offer.sdp.clone();
            self.link.set_local_description(offer).await?;
            debug!(call_id = %self.call_id, "Offer created");
            events.push(NegotiationEvent::LocalSignal(NegotiationSignal::Offer(sdp)));
        }
        Ok(events)
    }

    /// Apply a signal relayed from the peer
    pub async fn submit_remote_signal(
        &mut self,
        signal: NegotiationSignal,
    ) -> Result<Vec<NegotiationEvent>, NegotiationError> {
        if self.closed {
            return Err(NegotiationError::Closed);
        }
        let Some(role) = self.role else {
            return Err(NegotiationError::NotStarted);
        };

        let mut events = Vec::new();
        match signal {
            NegotiationSignal::Offer(sdp) if role == NegotiationRole::Answerer && !self.remote_description_set => {
                self.link.set_remote_description(SessionDescription::offer(sdp)).await?;
                self.remote_description_set = true;
                self.flush_candidates().await?;

                let answer = self.link.create_answer().await?;
                let sdp = answer.sdp.clone();
                self.link.set_local_description(answer).await?;
                debug!(call_id = %self.call_id, "Answer created");
                events.push(NegotiationEvent::LocalSignal(NegotiationSignal::Answer(sdp)));
            }
            NegotiationSignal::Answer(sdp) if role == NegotiationRole::Offerer && !self.remote_description_set => {
                self.link.set_remote_description(SessionDescription::answer(sdp)).await?;
                self.remote_description_set = true;
                self.flush_candidates().await?;
            }
            NegotiationSignal::Candidate(candidate) => {
                if self.remote_description_set {
                    trace!(call_id = %self.call_id, "Applying remote candidate");
                    self.link.add_remote_candidate(candidate).await?;
                } else {
                    trace!(call_id = %self.call_id, buffered = self.pending_candidates.len() + 1, "Buffering remote candidate");
                    self.pending_candidates.push(candidate);
                }
            }
            other => {
                return Err(NegotiationError::UnexpectedSignal {
                    signal: other.name(),
                    state: self.state,
                });
            }
        }
        Ok(events)
    }

    /// Translate a link event into engine output
    pub fn handle_link_event(&mut self, event: PeerLinkEvent) -> Vec<NegotiationEvent> {
        let mut events = Vec::new();
        if self.closed {
            return events;
        }
        match event {
            PeerLinkEvent::LocalCandidate(candidate) => {
                events.push(NegotiationEvent::LocalSignal(NegotiationSignal::Candidate(candidate)));
            }
            PeerLinkEvent::StateChanged(state) => {
                self.set_state(state.into(), &mut events);
            }
            PeerLinkEvent::RemoteMedia(media) => {
                events.push(NegotiationEvent::RemoteMediaAvailable(media));
            }
        }
        events
    }

    /// Release the peer link and the local capture stream.
    ///
    /// Safe to call any number of times from any state.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending_candidates.clear();
        self.link.close();
        if let Some(mut media) = self.local_media.take() {
            media.stop();
        }
        self.state = NegotiationState::Closed;
        debug!(call_id = %self.call_id, "Negotiation closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn flush_candidates(&mut self) -> Result<(), NegotiationError> {
        if self.pending_candidates.is_empty() {
            return Ok(());
        }
        debug!(call_id = %self.call_id, count = self.pending_candidates.len(), "Flushing buffered candidates");
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.link.add_remote_candidate(candidate).await?;
        }
        Ok(())
    }

    fn set_state(&mut self, state: NegotiationState, events: &mut Vec<NegotiationEvent>) {
        if self.state != state {
            self.state = state;
            events.push(NegotiationEvent::StateChanged(state));
        }
    }
}

impl Drop for NegotiationEngine {
    fn drop(&mut self) {
        self.close();
    }
}
