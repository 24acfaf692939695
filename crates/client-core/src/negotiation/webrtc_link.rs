//! Peer links backed by the `webrtc` crate
//!
//! [`WebRtcPeerLinkFactory`] builds one `RTCPeerConnection` per call with the
//! default codecs and interceptors registered. Local capture streams become
//! one sample track per media kind (Opus for audio, VP8 for video); the
//! capture pipeline writes samples through [`WebRtcPeerLink::local_tracks`].
//! Remote tracks are grouped by stream id and reported as [`RemoteMedia`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use callwire_signaling_transport::{IceCandidate, Subscribers, Subscription};

use super::NegotiationError;
use super::link::{LinkConfig, LinkState, PeerLink, PeerLinkEvent, PeerLinkFactory, SdpKind, SessionDescription};
use crate::media::{LocalMedia, MediaKind, RemoteMedia};

fn link_error(context: &str, error: webrtc::Error) -> NegotiationError {
    NegotiationError::link(format!("{}: {}", context, error))
}

/// Creates [`WebRtcPeerLink`]s sharing one configured API
pub struct WebRtcPeerLinkFactory {
    api: Arc<API>,
}

impl WebRtcPeerLinkFactory {
    pub fn new() -> Result<Self, NegotiationError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| link_error("codec registration failed", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| link_error("interceptor registration failed", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api: Arc::new(api) })
    }
}

impl std::fmt::Debug for WebRtcPeerLinkFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcPeerLinkFactory").finish_non_exhaustive()
    }
}

#[async_trait]
impl PeerLinkFactory for WebRtcPeerLinkFactory {
    async fn create(&self, config: &LinkConfig) -> Result<Box<dyn PeerLink>, NegotiationError> {
        let connection = self
            .api
            .new_peer_connection(rtc_configuration(config))
            .await
            .map_err(|e| link_error("peer connection setup failed", e))?;
        debug!(ice_servers = ?config.ice_servers, "Created WebRTC peer connection");
        Ok(Box::new(WebRtcPeerLink::wrap(Arc::new(connection))))
    }
}

/// One STUN/TURN entry per configured URL
pub fn rtc_configuration(config: &LinkConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

/// `None` for the library's "unspecified" placeholder
pub fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn media_kind(kind: RTPCodecType) -> Option<MediaKind> {
    match kind {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        RTPCodecType::Unspecified => None,
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| link_error("invalid session description", e))
}

/// Capture stream waiting to be turned into tracks
struct PendingMedia {
    stream_id: String,
    kinds: Vec<MediaKind>,
}

/// Peer link over an `RTCPeerConnection`
pub struct WebRtcPeerLink {
    connection: Arc<RTCPeerConnection>,
    events: Arc<Subscribers<PeerLinkEvent>>,
    pending_media: Option<PendingMedia>,
    local_tracks: Vec<Arc<TrackLocalStaticSample>>,
    closed: bool,
}

impl WebRtcPeerLink {
    fn wrap(connection: Arc<RTCPeerConnection>) -> Self {
        let events = Arc::new(Subscribers::new());

        let state_events = Arc::clone(&events);
        connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(%state, "Peer connection state changed");
            if let Some(state) = link_state(state) {
                state_events.publish(PeerLinkEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        let candidate_events = Arc::clone(&events);
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // `None` marks the end of gathering
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => candidate_events.publish(PeerLinkEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    })),
                    Err(e) => warn!(error = %e, "Dropping unserialisable local candidate"),
                }
            }
            Box::pin(async {})
        }));

        let track_events = Arc::clone(&events);
        let mut streams: HashMap<String, Vec<MediaKind>> = HashMap::new();
        connection.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            if let Some(kind) = media_kind(track.kind()) {
                let stream_id = track.stream_id();
                let kinds = streams.entry(stream_id.clone()).or_default();
                if !kinds.contains(&kind) {
                    kinds.push(kind);
                }
                let kinds = kinds.clone();
                debug!(stream = %stream_id, ?kinds, "Remote track arrived");
                track_events.publish(PeerLinkEvent::RemoteMedia(RemoteMedia { id: stream_id, kinds }));
            }
            // keep the receiver's buffers moving until the track ends
            Box::pin(async move {
                while track.read_rtp().await.is_ok() {}
                trace!(track = %track.id(), "Remote track ended");
            })
        }));

        Self {
            connection,
            events,
            pending_media: None,
            local_tracks: Vec::new(),
            closed: false,
        }
    }

    /// Sample tracks carrying the attached capture stream
    pub fn local_tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.local_tracks
    }

    /// Turn attached media into tracks; must precede offer or answer creation
    async fn attach_tracks(&mut self) -> Result<(), NegotiationError> {
        let Some(pending) = self.pending_media.take() else {
            return Ok(());
        };
        for kind in pending.kinds {
            let (mime_type, name) = match kind {
                MediaKind::Audio => (MIME_TYPE_OPUS, "audio"),
                MediaKind::Video => (MIME_TYPE_VP8, "video"),
            };
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                format!("{}-{}", pending.stream_id, name),
                pending.stream_id.clone(),
            ));
            let local: Arc<dyn TrackLocal + Send + Sync> = track.clone();
            self.connection
                .add_track(local)
                .await
                .map_err(|e| link_error("adding local track failed", e))?;
            self.local_tracks.push(track);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for WebRtcPeerLink {
    fn add_local_media(&mut self, media: &dyn LocalMedia) -> Result<(), NegotiationError> {
        if self.closed {
            return Err(NegotiationError::Closed);
        }
        self.pending_media = Some(PendingMedia {
            stream_id: media.id().to_owned(),
            kinds: media.kinds(),
        });
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.attach_tracks().await?;
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(|e| link_error("offer creation failed", e))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.attach_tracks().await?;
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(|e| link_error("answer creation failed", e))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&mut self, description: SessionDescription) -> Result<(), NegotiationError> {
        self.connection
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(|e| link_error("applying local description failed", e))
    }

    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<(), NegotiationError> {
        self.connection
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|e| link_error("applying remote description failed", e))
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(|e| link_error("applying remote candidate failed", e))
    }

    fn subscribe(&self) -> Subscription<PeerLinkEvent> {
        self.events.subscribe()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let connection = Arc::clone(&self.connection);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = connection.close().await {
                        warn!(error = %e, "Peer connection did not close cleanly");
                    }
                });
            }
            Err(_) => warn!("No runtime left to close the peer connection on"),
        }
    }
}
