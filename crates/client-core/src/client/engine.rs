//! The client's single event loop
//!
//! Every input (user commands, relay traffic, peer-link events, timers and
//! media acquisition results) is an [`EngineInput`] on one unbounded queue,
//! handled strictly in arrival order. Async work is spawned off the loop and
//! reports back through the same queue tagged with the generation of the call
//! that started it; a result whose generation is no longer current is dropped
//! (and any media it acquired is released).

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use callwire_signaling_transport::{
    CallId, ConnectionState, Identity, IdentityId, RejectReason, SignalingMessage,
    SignalingTransport, Subscribers, TransportEvent,
};

use super::config::ClientConfig;
use crate::call::{Action, CallSession, CallState, Trigger};
use crate::directory::IdentityDirectory;
use crate::error::{ClientError, ClientResult};
use crate::events::{
    summary_duration, CallStatusInfo, CallSummary, ClientEvent, EndReason, IncomingCallInfo,
};
use crate::media::{LocalMedia, MediaCapture, MediaError, MediaKind};
use crate::negotiation::{
    NegotiationEngine, NegotiationEvent, NegotiationRole, NegotiationSignal, NegotiationState,
    PeerLinkEvent, PeerLinkFactory,
};
use crate::registration::{PresenceEvent, PresenceRegistry, RegistrationStatus};

type Reply<T> = oneshot::Sender<ClientResult<T>>;

/// User requests, each with its reply channel
pub(crate) enum Command {
    Start { identity: Identity, reply: Reply<()> },
    PlaceCall { target: IdentityId, reply: Reply<CallId> },
    Accept { call_id: CallId, reply: Reply<()> },
    Reject { call_id: CallId, reply: Reply<()> },
    HangUp { reply: Reply<()> },
    SetMediaEnabled { kind: MediaKind, enabled: bool, reply: Reply<()> },
    Shutdown { reply: oneshot::Sender<()> },
}

pub(crate) enum EngineInput {
    Command(Command),
    Transport(TransportEvent),
    Link { generation: u64, event: PeerLinkEvent },
    MediaAcquired {
        generation: u64,
        result: Result<Box<dyn LocalMedia>, MediaError>,
    },
    RingTimeout { generation: u64 },
    NegotiationTimeout { generation: u64 },
    RegistrationTimeout { seq: u64 },
}

/// Collaborators the engine drives
pub(crate) struct EngineParts {
    pub config: ClientConfig,
    pub transport: Arc<dyn SignalingTransport>,
    pub registry: Arc<PresenceRegistry>,
    pub media: Arc<dyn MediaCapture>,
    pub links: Arc<dyn PeerLinkFactory>,
    pub directory: Option<Arc<dyn IdentityDirectory>>,
    pub events: Subscribers<ClientEvent>,
    pub session: watch::Sender<Option<crate::events::SessionSnapshot>>,
}

/// Everything owned by the call in progress
struct ActiveCall {
    session: CallSession,
    generation: u64,
    negotiation: Option<NegotiationEngine>,
    /// Local media acquired before negotiation began
    media: Option<Box<dyn LocalMedia>>,
    /// Remote signals that arrived before negotiation began
    early_signals: Vec<NegotiationSignal>,
    ring_timer: Option<JoinHandle<()>>,
    negotiation_timer: Option<JoinHandle<()>>,
    link_forwarder: Option<JoinHandle<()>>,
    audio_enabled: bool,
    video_enabled: bool,
}

impl ActiveCall {
    fn new(session: CallSession, generation: u64, config: &ClientConfig) -> Self {
        Self {
            session,
            generation,
            negotiation: None,
            media: None,
            early_signals: Vec::new(),
            ring_timer: None,
            negotiation_timer: None,
            link_forwarder: None,
            audio_enabled: config.media.audio,
            video_enabled: config.media.video,
        }
    }

    fn negotiation_state(&self) -> Option<NegotiationState> {
        self.negotiation.as_ref().map(|n| n.connection_state())
    }

    /// Release every resource of the call; safe to repeat
    fn teardown(&mut self) {
        for timer in [
            self.ring_timer.take(),
            self.negotiation_timer.take(),
            self.link_forwarder.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
        if let Some(mut negotiation) = self.negotiation.take() {
            negotiation.close();
        }
        if let Some(mut media) = self.media.take() {
            media.stop();
        }
        self.early_signals.clear();
    }
}

struct PendingStart {
    seq: u64,
    reply: Reply<()>,
    timer: JoinHandle<()>,
}

pub(crate) struct Engine {
    config: ClientConfig,
    transport: Arc<dyn SignalingTransport>,
    registry: Arc<PresenceRegistry>,
    media: Arc<dyn MediaCapture>,
    links: Arc<dyn PeerLinkFactory>,
    directory: Option<Arc<dyn IdentityDirectory>>,
    events: Subscribers<ClientEvent>,
    session: watch::Sender<Option<crate::events::SessionSnapshot>>,
    inbox: mpsc::UnboundedSender<EngineInput>,
    transport_forwarder: Option<JoinHandle<()>>,
    current: Option<ActiveCall>,
    next_generation: u64,
    pending_start: Option<PendingStart>,
    registration_seq: u64,
}

impl Engine {
    /// Create the engine and subscribe it to the transport
    pub(crate) fn new(parts: EngineParts, inbox: mpsc::UnboundedSender<EngineInput>) -> Self {
        let mut transport_events = parts.transport.subscribe();
        let tx = inbox.clone();
        let transport_forwarder = tokio::spawn(async move {
            while let Some(event) = transport_events.recv().await {
                if tx.send(EngineInput::Transport(event)).is_err() {
                    break;
                }
            }
        });

        Self {
            config: parts.config,
            transport: parts.transport,
            registry: parts.registry,
            media: parts.media,
            links: parts.links,
            directory: parts.directory,
            events: parts.events,
            session: parts.session,
            inbox,
            transport_forwarder: Some(transport_forwarder),
            current: None,
            next_generation: 0,
            pending_start: None,
            registration_seq: 0,
        }
    }

    pub(crate) async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<EngineInput>) {
        debug!("Client engine started");
        while let Some(input) = inbox.recv().await {
            match input {
                EngineInput::Command(Command::Shutdown { reply }) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                EngineInput::Command(command) => self.on_command(command).await,
                EngineInput::Transport(event) => self.on_transport(event).await,
                EngineInput::Link { generation, event } => self.on_link_event(generation, event).await,
                EngineInput::MediaAcquired { generation, result } => self.on_media(generation, result).await,
                EngineInput::RingTimeout { generation } => {
                    if self.is_current(generation) {
                        self.fire(Trigger::RingTimeout).await;
                    }
                }
                EngineInput::NegotiationTimeout { generation } => {
                    if self.is_current(generation) {
                        self.fire(Trigger::NegotiationTimeout).await;
                    }
                }
                EngineInput::RegistrationTimeout { seq } => self.on_registration_timeout(seq),
            }
        }
        debug!("Client engine stopped");
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current.as_ref().is_some_and(|c| c.generation == generation)
    }

    // ---- commands ----

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Start { identity, reply } => self.start(identity, reply),
            Command::PlaceCall { target, reply } => {
                let result = self.place_call(target).await;
                let _ = reply.send(result);
            }
            Command::Accept { call_id, reply } => {
                let result = self.answer(&call_id, Trigger::LocalAccept).await;
                let _ = reply.send(result);
            }
            Command::Reject { call_id, reply } => {
                let result = self.answer(&call_id, Trigger::LocalReject).await;
                let _ = reply.send(result);
            }
            Command::HangUp { reply } => {
                let result = match &self.current {
                    Some(_) => {
                        self.fire(Trigger::LocalHangup).await;
                        Ok(())
                    }
                    None => Err(ClientError::NoActiveCall),
                };
                let _ = reply.send(result);
            }
            Command::SetMediaEnabled { kind, enabled, reply } => {
                let _ = reply.send(self.set_media_enabled(kind, enabled));
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn start(&mut self, identity: Identity, reply: Reply<()>) {
        if let Err(e) = self.registry.register(identity) {
            let _ = reply.send(Err(e));
            return;
        }
        if self.registry.status() == RegistrationStatus::Active {
            let _ = reply.send(Ok(()));
            return;
        }

        self.registration_seq += 1;
        let seq = self.registration_seq;
        let timeout = self.config.registration_timeout();
        let tx = self.inbox.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(EngineInput::RegistrationTimeout { seq });
        });
        if let Some(previous) = self.pending_start.replace(PendingStart { seq, reply, timer }) {
            previous.timer.abort();
            let _ = previous.reply.send(Err(ClientError::invalid_state("superseded by a newer start")));
        }
    }

    fn on_registration_timeout(&mut self, seq: u64) {
        if self.pending_start.as_ref().is_some_and(|p| p.seq == seq) {
            if let Some(pending) = self.pending_start.take() {
                warn!(seconds = self.config.registration_timeout_secs, "Registration not confirmed in time");
                let _ = pending.reply.send(Err(ClientError::RegistrationTimeout {
                    seconds: self.config.registration_timeout_secs,
                }));
            }
        }
    }

    fn finish_start(&mut self, result: ClientResult<()>) {
        if let Some(pending) = self.pending_start.take() {
            pending.timer.abort();
            let _ = pending.reply.send(result);
        }
    }

    async fn place_call(&mut self, target: IdentityId) -> ClientResult<CallId> {
        let own = match self.registry.identity() {
            Some(identity) if self.registry.status() == RegistrationStatus::Active => identity,
            _ => return Err(ClientError::NotRegistered),
        };
        if target == own.id {
            return Err(ClientError::invalid_state("cannot call yourself"));
        }
        if let Some(call) = &self.current {
            return Err(ClientError::Busy {
                call_id: call.session.call_id().clone(),
            });
        }
        if self.transport.connection_state() != ConnectionState::Open {
            return Err(callwire_signaling_transport::Error::NotConnected.into());
        }
        if !self.registry.is_online(&target) {
            return Err(ClientError::PeerUnavailable { peer: target });
        }

        let display_name = self
            .directory
            .as_ref()
            .and_then(|d| d.resolve(&target))
            .map(|entry| entry.display_name)
            .unwrap_or_else(|| target.to_string());
        let peer = Identity::new(target, display_name, own.role.counterpart());
        let call_id = CallId::generate(&own.id, &peer.id);

        info!(call_id = %call_id, peer = %peer.id, "Placing call");
        let (session, transition) = CallSession::outgoing(call_id.clone(), peer);
        self.begin_call(session, transition.actions).await;
        Ok(call_id)
    }

    async fn answer(&mut self, call_id: &CallId, trigger: Trigger) -> ClientResult<()> {
        let Some(call) = &self.current else {
            return Err(ClientError::NoActiveCall);
        };
        if call.session.call_id() != call_id {
            return Err(ClientError::CallNotFound {
                call_id: call_id.clone(),
            });
        }
        if call.session.state() != CallState::IncomingRinging {
            return Err(ClientError::invalid_state(format!(
                "call {} is {}, not ringing",
                call_id,
                call.session.state()
            )));
        }
        self.fire(trigger).await;
        Ok(())
    }

    fn set_media_enabled(&mut self, kind: MediaKind, enabled: bool) -> ClientResult<()> {
        let Some(call) = self.current.as_mut() else {
            return Err(ClientError::NoActiveCall);
        };
        let applied = match (call.negotiation.as_mut(), call.media.as_mut()) {
            (Some(negotiation), _) => negotiation.set_media_enabled(kind, enabled),
            (None, Some(media)) => {
                media.set_enabled(kind, enabled);
                true
            }
            (None, None) => false,
        };
        match kind {
            MediaKind::Audio => call.audio_enabled = enabled,
            MediaKind::Video => call.video_enabled = enabled,
        }
        debug!(call_id = %call.session.call_id(), %kind, enabled, applied, "Local track toggled");
        self.publish_snapshot();
        Ok(())
    }

    async fn shutdown(&mut self) {
        if self.current.is_some() {
            self.fire(Trigger::LocalHangup).await;
        }
        if let Some(pending) = self.pending_start.take() {
            pending.timer.abort();
            let _ = pending.reply.send(Err(ClientError::EngineStopped));
        }
        if let Some(forwarder) = self.transport_forwarder.take() {
            forwarder.abort();
        }
    }

    // ---- relay ----

    async fn on_transport(&mut self, event: TransportEvent) {
        let status_before = self.registry.status();
        let presence_before = self.registry.presence();
        let presence_events = self.registry.handle_transport_event(&event);

        match &event {
            TransportEvent::Opened { reconnected, link } => {
                info!(reconnected, link, "Relay connected");
                self.events.publish(ClientEvent::NetworkEvent {
                    connected: true,
                    reason: None,
                });
            }
            TransportEvent::Disconnected { reason, .. } => {
                self.events.publish(ClientEvent::NetworkEvent {
                    connected: false,
                    reason: Some(reason.clone()),
                });
                if self.current.is_some() {
                    self.fire(Trigger::TransportLost).await;
                }
            }
            TransportEvent::Closed { reason } => {
                self.events.publish(ClientEvent::NetworkEvent {
                    connected: false,
                    reason: Some(format!("{:?}", reason)),
                });
                if self.current.is_some() {
                    self.fire(Trigger::TransportLost).await;
                }
                self.finish_start(Err(callwire_signaling_transport::Error::NotConnected.into()));
            }
            TransportEvent::ConnectError { attempt, reason } => {
                debug!(attempt, reason = %reason, "Relay connection attempt failed");
            }
            TransportEvent::Message(message) => self.on_message(message.clone()).await,
        }

        let mut failure = None;
        for event in &presence_events {
            match event {
                PresenceEvent::RegistrationConfirmed { .. } => self.finish_start(Ok(())),
                PresenceEvent::RegistrationFailed { reason } => {
                    failure = Some(reason.clone());
                    self.finish_start(Err(ClientError::registration(reason.clone())));
                }
                PresenceEvent::PresenceChanged { identity_id, online } => {
                    self.events.publish(ClientEvent::PresenceChanged {
                        identity_id: identity_id.clone(),
                        online: *online,
                    });
                }
                PresenceEvent::PresenceReset { .. } => {}
            }
        }

        if presence_events.iter().any(|e| matches!(e, PresenceEvent::PresenceReset { .. })) {
            let before: BTreeSet<_> = presence_before.iter().cloned().collect();
            let after: BTreeSet<_> = self.registry.presence().iter().cloned().collect();
            for id in before.difference(&after) {
                self.events.publish(ClientEvent::PresenceChanged {
                    identity_id: id.clone(),
                    online: false,
                });
            }
            for id in after.difference(&before) {
                self.events.publish(ClientEvent::PresenceChanged {
                    identity_id: id.clone(),
                    online: true,
                });
            }
        }

        let status = self.registry.status();
        if status != status_before {
            self.events.publish(ClientEvent::RegistrationStatusChanged { status, reason: failure });
        }
    }

    async fn on_message(&mut self, message: SignalingMessage) {
        if let SignalingMessage::Invite { call_id, from, to } = message {
            self.on_invite(call_id, from, to).await;
            return;
        }

        let Some(call_id) = message.call_id().cloned() else {
            return;
        };
        let current = self.current.as_ref().map(|c| c.session.call_id());
        if current != Some(&call_id) {
            let mismatch = ClientError::ProtocolMismatch { call_id };
            debug!(kind = message.kind(), current = ?current, "Dropping message: {}", mismatch);
            return;
        }

        match message {
            SignalingMessage::InviteAck { accepted, reason, .. } => {
                self.fire(Trigger::RemoteAck { accepted, reason }).await;
            }
            SignalingMessage::Hangup { .. } => self.fire(Trigger::RemoteHangup).await,
            SignalingMessage::CallFailed { reason, .. } => {
                self.fire(Trigger::RemoteCallFailed { reason }).await;
            }
            SignalingMessage::Offer { sdp, .. } => self.on_remote_signal(NegotiationSignal::Offer(sdp)).await,
            SignalingMessage::Answer { sdp, .. } => self.on_remote_signal(NegotiationSignal::Answer(sdp)).await,
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.on_remote_signal(NegotiationSignal::Candidate(candidate)).await;
            }
            other => debug!(kind = other.kind(), "Ignoring relay message"),
        }
    }

    async fn on_invite(&mut self, call_id: CallId, from: Identity, to: IdentityId) {
        let own = self.registry.identity();
        if own.as_ref().map(|i| &i.id) != Some(&to) {
            debug!(call_id = %call_id, to = %to, "Dropping invite addressed to another identity");
            return;
        }

        if let Some(call) = &self.current {
            if call.session.call_id() == &call_id {
                debug!(call_id = %call_id, "Dropping duplicate invite");
                return;
            }
            info!(call_id = %call_id, caller = %from.id, current = %call.session.call_id(), "Busy, rejecting invite");
            self.send(SignalingMessage::InviteAck {
                call_id: call_id.clone(),
                accepted: false,
                reason: Some(RejectReason::Busy),
            });
            self.events.publish(ClientEvent::BusyRejected { call_id, caller: from });
            return;
        }

        let entry = self.directory.as_ref().and_then(|d| d.resolve(&from.id));
        let info = IncomingCallInfo {
            call_id: call_id.clone(),
            caller_display_name: entry
                .as_ref()
                .map(|e| e.display_name.clone())
                .unwrap_or_else(|| from.display_name.clone()),
            caller_avatar_url: entry.and_then(|e| e.avatar_url),
            caller: from.clone(),
            received_at: Utc::now(),
        };

        info!(call_id = %call_id, caller = %from.id, "Incoming call");
        let (session, transition) = CallSession::incoming(call_id, from);
        self.begin_call(session, transition.actions).await;
        self.events.publish(ClientEvent::IncomingCall { info });
    }

    async fn on_remote_signal(&mut self, signal: NegotiationSignal) {
        let Some(call) = self.current.as_mut() else {
            return;
        };
        let Some(negotiation) = call.negotiation.as_mut() else {
            debug!(call_id = %call.session.call_id(), state = %call.session.state(), "Holding signal until negotiation begins");
            call.early_signals.push(signal);
            return;
        };

        let triggers = match negotiation.submit_remote_signal(signal).await {
            Ok(events) => self.apply_negotiation_events(events),
            Err(e) => {
                warn!(error = %e, "Remote signal rejected");
                vec![Trigger::NegotiationFailed(e.to_string())]
            }
        };
        for trigger in triggers {
            self.fire(trigger).await;
        }
    }

    // ---- async continuations ----

    async fn on_link_event(&mut self, generation: u64, event: PeerLinkEvent) {
        if !self.is_current(generation) {
            debug!(generation, "Dropping link event from a finished call");
            return;
        }
        let events = match self.current.as_mut().and_then(|c| c.negotiation.as_mut()) {
            Some(negotiation) => negotiation.handle_link_event(event),
            None => return,
        };
        for trigger in self.apply_negotiation_events(events) {
            self.fire(trigger).await;
        }
    }

    async fn on_media(&mut self, generation: u64, result: Result<Box<dyn LocalMedia>, MediaError>) {
        if !self.is_current(generation) {
            if let Ok(mut media) = result {
                debug!(generation, media_id = media.id(), "Releasing media acquired for a finished call");
                media.stop();
            }
            return;
        }

        match result {
            Ok(mut media) => {
                let Some(call) = self.current.as_mut() else {
                    media.stop();
                    return;
                };
                media.set_enabled(MediaKind::Audio, call.audio_enabled);
                media.set_enabled(MediaKind::Video, call.video_enabled);
                if let Some(mut previous) = call.media.replace(media) {
                    previous.stop();
                }
                self.fire(Trigger::MediaReady).await;
            }
            Err(e) => {
                warn!(error = %e, "Local media unavailable");
                self.fire(Trigger::MediaFailed(e)).await;
            }
        }
    }

    // ---- state machine ----

    async fn begin_call(&mut self, session: CallSession, actions: Vec<Action>) {
        self.next_generation += 1;
        let state = session.state();
        let call_id = session.call_id().clone();
        self.current = Some(ActiveCall::new(session, self.next_generation, &self.config));
        self.report_state(call_id, CallState::Idle, state, None);

        let mut follow_ups = Vec::new();
        for action in actions {
            follow_ups.extend(self.execute(action).await);
        }
        for trigger in follow_ups {
            self.fire(trigger).await;
        }
    }

    /// Run a trigger, and any triggers its actions produce, to completion
    async fn fire(&mut self, trigger: Trigger) {
        let mut queue = VecDeque::from([trigger]);
        while let Some(trigger) = queue.pop_front() {
            let Some(call) = self.current.as_mut() else {
                return;
            };
            let previous = call.session.state();
            let call_id = call.session.call_id().clone();
            let Some(transition) = call.session.handle(trigger.clone()) else {
                debug!(call_id = %call_id, state = %previous, ?trigger, "Trigger ignored");
                continue;
            };

            if let Some(next) = transition.next_state {
                self.report_state(call_id, previous, next, transition.reason.clone());
            }
            for action in transition.actions {
                queue.extend(self.execute(action).await);
            }
            self.check_invariants();

            if transition.next_state.is_some_and(CallState::is_terminal) {
                self.finish_call();
                return;
            }
        }
    }

    /// Perform one action; returns the triggers it produced
    async fn execute(&mut self, action: Action) -> Vec<Trigger> {
        let Some(call) = self.current.as_mut() else {
            return Vec::new();
        };
        let call_id = call.session.call_id().clone();
        let generation = call.generation;

        match action {
            Action::SendInvite => {
                let to = call.session.peer().id.clone();
                let Some(from) = self.registry.identity() else {
                    return vec![Trigger::TransportLost];
                };
                if !self.send(SignalingMessage::Invite { call_id, from, to }) {
                    return vec![Trigger::TransportLost];
                }
            }
            Action::SendAck { accepted, reason } => {
                self.send(SignalingMessage::InviteAck {
                    call_id,
                    accepted,
                    reason,
                });
            }
            Action::SendHangup => {
                self.send(SignalingMessage::Hangup { call_id });
            }
            Action::StartRingTimer => {
                let handle = self.spawn_timer(self.config.ring_timeout(), EngineInput::RingTimeout { generation });
                if let Some(call) = self.current.as_mut() {
                    call.ring_timer = Some(handle);
                }
            }
            Action::StopRingTimer => {
                if let Some(timer) = call.ring_timer.take() {
                    timer.abort();
                    debug!(call_id = %call_id, "Ring timer stopped");
                }
            }
            Action::StartNegotiationTimer => {
                let handle = self.spawn_timer(
                    self.config.negotiation_timeout(),
                    EngineInput::NegotiationTimeout { generation },
                );
                if let Some(call) = self.current.as_mut() {
                    call.negotiation_timer = Some(handle);
                }
            }
            Action::AcquireMedia => {
                let capture = Arc::clone(&self.media);
                let constraints = self.config.media;
                let tx = self.inbox.clone();
                debug!(call_id = %call_id, ?constraints, "Acquiring local media");
                tokio::spawn(async move {
                    let result = capture.acquire(constraints).await;
                    let _ = tx.send(EngineInput::MediaAcquired { generation, result });
                });
            }
            Action::BeginNegotiation(role) => match self.begin_negotiation(role).await {
                Ok(triggers) => return triggers,
                Err(e) => {
                    warn!(call_id = %call_id, error = %e, "Negotiation could not start");
                    return vec![Trigger::NegotiationFailed(e.to_string())];
                }
            },
            Action::Teardown => {
                call.teardown();
                debug!(call_id = %call_id, "Call resources released");
            }
        }
        Vec::new()
    }

    async fn begin_negotiation(&mut self, role: NegotiationRole) -> ClientResult<Vec<Trigger>> {
        let link = self.links.create(&self.config.link_config()).await?;
        let inbox = self.inbox.clone();
        let Some(call) = self.current.as_mut() else {
            return Ok(Vec::new());
        };
        let generation = call.generation;
        let mut negotiation = NegotiationEngine::new(call.session.call_id().clone(), link);
        let media = call
            .media
            .take()
            .ok_or_else(|| ClientError::invalid_state("local media missing"))?;
        negotiation.attach_local_media(media)?;

        let mut link_events = negotiation.link_events();
        call.link_forwarder = Some(tokio::spawn(async move {
            while let Some(event) = link_events.recv().await {
                if inbox.send(EngineInput::Link { generation, event }).is_err() {
                    break;
                }
            }
        }));

        let events = negotiation.begin(role).await?;
        let early = std::mem::take(&mut call.early_signals);
        call.negotiation = Some(negotiation);
        debug!(call_id = %call.session.call_id(), ?role, held = early.len(), "Negotiation started");

        let mut triggers = self.apply_negotiation_events(events);
        for signal in early {
            let Some(negotiation) = self.current.as_mut().and_then(|c| c.negotiation.as_mut()) else {
                break;
            };
            let events = negotiation.submit_remote_signal(signal).await?;
            triggers.extend(self.apply_negotiation_events(events));
        }
        Ok(triggers)
    }

    /// Relay local signals and turn negotiation state into triggers
    fn apply_negotiation_events(&mut self, events: Vec<NegotiationEvent>) -> Vec<Trigger> {
        let Some(call_id) = self.current.as_ref().map(|c| c.session.call_id().clone()) else {
            return Vec::new();
        };
        let mut triggers = Vec::new();
        for event in events {
            match event {
                NegotiationEvent::LocalSignal(NegotiationSignal::Offer(sdp)) => {
                    self.send(SignalingMessage::Offer {
                        call_id: call_id.clone(),
                        sdp,
                    });
                }
                NegotiationEvent::LocalSignal(NegotiationSignal::Answer(sdp)) => {
                    self.send(SignalingMessage::Answer {
                        call_id: call_id.clone(),
                        sdp,
                    });
                }
                NegotiationEvent::LocalSignal(NegotiationSignal::Candidate(candidate)) => {
                    self.send(SignalingMessage::IceCandidate {
                        call_id: call_id.clone(),
                        candidate,
                    });
                }
                NegotiationEvent::StateChanged(NegotiationState::Connected) => {
                    triggers.push(Trigger::NegotiationConnected);
                }
                NegotiationEvent::StateChanged(NegotiationState::Failed) => {
                    triggers.push(Trigger::NegotiationFailed("peer link failed".to_string()));
                }
                NegotiationEvent::StateChanged(state) => {
                    debug!(call_id = %call_id, %state, "Negotiation state changed");
                }
                NegotiationEvent::RemoteMediaAvailable(media) => {
                    self.events.publish(ClientEvent::RemoteMediaAvailable {
                        call_id: call_id.clone(),
                        media,
                    });
                }
            }
        }
        triggers
    }

    fn report_state(&mut self, call_id: CallId, previous: CallState, next: CallState, reason: Option<EndReason>) {
        match &reason {
            Some(reason) => info!(call_id = %call_id, from = %previous, to = %next, reason = %reason, "Call state changed"),
            None => info!(call_id = %call_id, from = %previous, to = %next, "Call state changed"),
        }
        self.events.publish(ClientEvent::CallStateChanged {
            info: CallStatusInfo {
                call_id,
                new_state: next,
                previous_state: previous,
                reason,
                timestamp: Utc::now(),
            },
        });
        self.publish_snapshot();
    }

    fn check_invariants(&self) {
        if let Some(call) = &self.current {
            if let Err(violation) = call.session.check_invariants(call.negotiation_state()) {
                error!(call_id = %call.session.call_id(), "Session invariant violated: {}", violation);
            }
        }
    }

    /// Report the outcome of a terminal call and return to idle
    fn finish_call(&mut self) {
        let Some(mut call) = self.current.take() else {
            return;
        };
        call.teardown();

        let session = &call.session;
        let ended_at = session.ended_at().unwrap_or_else(Utc::now);
        let reason = session.end_reason().cloned().unwrap_or(EndReason::ConnectionLost);
        let summary = CallSummary {
            call_id: session.call_id().clone(),
            peer: session.peer().clone(),
            direction: session.direction(),
            final_state: session.state(),
            reason,
            started_at: session.started_at(),
            connected_at: session.connected_at(),
            ended_at,
            duration: summary_duration(session.connected_at(), ended_at),
        };
        info!(
            call_id = %summary.call_id,
            state = %summary.final_state,
            reason = %summary.reason,
            duration_secs = summary.duration.as_secs(),
            "Call finished"
        );
        self.events.publish(ClientEvent::CallEnded { summary });
        self.session.send_replace(None);
    }

    fn publish_snapshot(&self) {
        let snapshot = self
            .current
            .as_ref()
            .map(|c| c.session.snapshot(c.audio_enabled, c.video_enabled));
        self.session.send_replace(snapshot);
    }

    // ---- helpers ----

    fn send(&self, message: SignalingMessage) -> bool {
        let kind = message.kind();
        match self.transport.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(kind, error = %e, "Could not send to relay");
                false
            }
        }
    }

    fn spawn_timer(&self, after: std::time::Duration, input: EngineInput) -> JoinHandle<()> {
        let tx = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(input);
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(forwarder) = self.transport_forwarder.take() {
            forwarder.abort();
        }
        if let Some(mut call) = self.current.take() {
            call.teardown();
        }
        if let Some(pending) = self.pending_start.take() {
            pending.timer.abort();
        }
    }
}
