//! Transition table for one call
//!
//! [`CallSession::handle`] is pure bookkeeping: it validates a [`Trigger`]
//! against the current state, updates the session, and returns the
//! [`Action`]s the engine must execute. A trigger that is not valid in the
//! current state yields `None` and changes nothing, which is how late
//! duplicates (a second hangup, an accept after a timeout) become no-ops.

use chrono::{DateTime, Utc};

use callwire_signaling_transport::{CallId, Identity, RejectReason};

use super::{CallDirection, CallState};
use crate::events::{EndReason, SessionSnapshot};
use crate::media::MediaError;
use crate::negotiation::{NegotiationRole, NegotiationState};

/// Inputs to the call state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    LocalAccept,
    LocalReject,
    LocalHangup,
    RemoteAck {
        accepted: bool,
        reason: Option<RejectReason>,
    },
    RemoteHangup,
    /// The relay could not deliver our invite
    RemoteCallFailed { reason: String },
    MediaReady,
    MediaFailed(MediaError),
    NegotiationConnected,
    NegotiationFailed(String),
    RingTimeout,
    NegotiationTimeout,
    TransportLost,
}

/// Side effects requested by a transition, executed in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SendInvite,
    SendAck {
        accepted: bool,
        reason: Option<RejectReason>,
    },
    SendHangup,
    StartRingTimer,
    /// The user answered; the ring timer no longer bounds the call
    StopRingTimer,
    AcquireMedia,
    /// Create the negotiation engine, attach local media and begin
    BeginNegotiation(NegotiationRole),
    StartNegotiationTimer,
    /// Close negotiation, release local media, cancel timers
    Teardown,
}

/// Result of a valid trigger
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub actions: Vec<Action>,
    /// New state, if the state changed
    pub next_state: Option<CallState>,
    /// Set when the transition ends the call
    pub reason: Option<EndReason>,
}

/// Progress of local media acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaPhase {
    NotRequested,
    Pending,
    Ready,
}

/// One call attempt
#[derive(Debug, Clone)]
pub struct CallSession {
    call_id: CallId,
    peer: Identity,
    direction: CallDirection,
    state: CallState,
    media: MediaPhase,
    /// Incoming: the user accepted and we are waiting for media
    accepted_locally: bool,
    /// Outgoing: the peer accepted and we are waiting for media
    accepted_by_peer: bool,
    started_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    end_reason: Option<EndReason>,
}

impl CallSession {
    /// A call we place; media acquisition starts alongside the invite
    pub fn outgoing(call_id: CallId, peer: Identity) -> (Self, Transition) {
        let mut session = Self::new(call_id, peer, CallDirection::Outgoing, CallState::OutgoingRinging);
        session.media = MediaPhase::Pending;
        let transition = Transition {
            actions: vec![Action::SendInvite, Action::StartRingTimer, Action::AcquireMedia],
            next_state: Some(CallState::OutgoingRinging),
            reason: None,
        };
        (session, transition)
    }

    /// A call offered to us by `peer`
    pub fn incoming(call_id: CallId, peer: Identity) -> (Self, Transition) {
        let session = Self::new(call_id, peer, CallDirection::Incoming, CallState::IncomingRinging);
        let transition = Transition {
            actions: vec![Action::StartRingTimer],
            next_state: Some(CallState::IncomingRinging),
            reason: None,
        };
        (session, transition)
    }

    fn new(call_id: CallId, peer: Identity, direction: CallDirection, state: CallState) -> Self {
        Self {
            call_id,
            peer,
            direction,
            state,
            media: MediaPhase::NotRequested,
            accepted_locally: false,
            accepted_by_peer: false,
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            end_reason: None,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn peer(&self) -> &Identity {
        &self.peer
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn media_phase(&self) -> MediaPhase {
        self.media
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end_reason.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Apply a trigger; `None` when it is not valid in the current state
    pub fn handle(&mut self, trigger: Trigger) -> Option<Transition> {
        use CallState::*;

        if self.state.is_terminal() || self.state == Idle {
            return None;
        }

        // valid from any ringing, connecting or active state
        match &trigger {
            Trigger::LocalHangup => return Some(self.end(EndReason::LocalHangup, vec![Action::SendHangup])),
            Trigger::RemoteHangup => return Some(self.end(EndReason::RemoteHangup, vec![])),
            Trigger::TransportLost => return Some(self.end(EndReason::ConnectionLost, vec![])),
            _ => {}
        }

        match (self.state, trigger) {
            (OutgoingRinging, Trigger::RemoteAck { accepted: true, .. }) => {
                if self.accepted_by_peer {
                    return None;
                }
                self.accepted_by_peer = true;
                if self.media == MediaPhase::Ready {
                    Some(self.start_connecting(vec![], NegotiationRole::Offerer))
                } else {
                    Some(Transition {
                        actions: vec![],
                        next_state: None,
                        reason: None,
                    })
                }
            }
            (OutgoingRinging, Trigger::RemoteAck { accepted: false, reason }) => {
                let reason = match reason {
                    Some(RejectReason::Busy) => EndReason::Busy,
                    Some(RejectReason::MediaUnavailable) => EndReason::PeerMediaUnavailable,
                    Some(RejectReason::Declined) | None => EndReason::Declined,
                };
                Some(self.end(reason, vec![]))
            }
            (OutgoingRinging, Trigger::RemoteCallFailed { reason }) => {
                Some(self.end(EndReason::PeerUnreachable(reason), vec![]))
            }
            (OutgoingRinging, Trigger::MediaReady) if self.media == MediaPhase::Pending => {
                self.media = MediaPhase::Ready;
                if self.accepted_by_peer {
                    Some(self.start_connecting(vec![], NegotiationRole::Offerer))
                } else {
                    Some(Transition {
                        actions: vec![],
                        next_state: None,
                        reason: None,
                    })
                }
            }
            (OutgoingRinging, Trigger::MediaFailed(error)) if self.media == MediaPhase::Pending => {
                Some(self.end(EndReason::MediaUnavailable(error), vec![Action::SendHangup]))
            }
            (OutgoingRinging, Trigger::RingTimeout) => Some(self.end(EndReason::NoAnswer, vec![Action::SendHangup])),
            // a timeout already queued when the user answered
            (IncomingRinging, Trigger::RingTimeout) if self.accepted_locally => None,
            (IncomingRinging, Trigger::RingTimeout) => Some(self.end(EndReason::NoAnswer, vec![Action::SendHangup])),

            (IncomingRinging, Trigger::LocalAccept) => {
                if self.accepted_locally {
                    return None;
                }
                self.accepted_locally = true;
                self.media = MediaPhase::Pending;
                Some(Transition {
                    actions: vec![Action::StopRingTimer, Action::AcquireMedia],
                    next_state: None,
                    reason: None,
                })
            }
            (IncomingRinging, Trigger::LocalReject) => Some(self.end(
                EndReason::RejectedLocally,
                vec![Action::SendAck {
                    accepted: false,
                    reason: Some(RejectReason::Declined),
                }],
            )),
            (IncomingRinging, Trigger::MediaReady) if self.media == MediaPhase::Pending => {
                self.media = MediaPhase::Ready;
                Some(self.start_connecting(
                    vec![Action::SendAck {
                        accepted: true,
                        reason: None,
                    }],
                    NegotiationRole::Answerer,
                ))
            }
            (IncomingRinging, Trigger::MediaFailed(error)) if self.media == MediaPhase::Pending => Some(self.end(
                EndReason::MediaUnavailable(error),
                vec![Action::SendAck {
                    accepted: false,
                    reason: Some(RejectReason::MediaUnavailable),
                }],
            )),

            (Connecting, Trigger::NegotiationConnected) => {
                self.state = Active;
                self.connected_at = Some(Utc::now());
                Some(Transition {
                    actions: vec![],
                    next_state: Some(Active),
                    reason: None,
                })
            }
            (Connecting, Trigger::NegotiationFailed(detail)) => {
                Some(self.end(EndReason::NegotiationFailed(detail), vec![Action::SendHangup]))
            }
            (Connecting, Trigger::NegotiationTimeout) => {
                Some(self.end(EndReason::NegotiationTimeout, vec![Action::SendHangup]))
            }
            (Active, Trigger::NegotiationFailed(_)) => {
                Some(self.end(EndReason::ConnectionLost, vec![Action::SendHangup]))
            }

            _ => None,
        }
    }

    fn start_connecting(&mut self, mut actions: Vec<Action>, role: NegotiationRole) -> Transition {
        self.state = CallState::Connecting;
        actions.push(Action::BeginNegotiation(role));
        actions.push(Action::StartNegotiationTimer);
        Transition {
            actions,
            next_state: Some(CallState::Connecting),
            reason: None,
        }
    }

    fn end(&mut self, reason: EndReason, mut actions: Vec<Action>) -> Transition {
        actions.push(Action::Teardown);
        let state = reason.terminal_state();
        self.state = state;
        self.ended_at = Some(Utc::now());
        self.end_reason = Some(reason.clone());
        Transition {
            actions,
            next_state: Some(state),
            reason: Some(reason),
        }
    }

    /// Check the session against the negotiation engine it owns
    pub fn check_invariants(&self, negotiation: Option<NegotiationState>) -> Result<(), String> {
        match self.state {
            CallState::Active if negotiation != Some(NegotiationState::Connected) => Err(format!(
                "call {} is ACTIVE with negotiation {:?}",
                self.call_id, negotiation
            )),
            CallState::Connecting | CallState::Active if self.media != MediaPhase::Ready => Err(format!(
                "call {} is {} without local media",
                self.call_id, self.state
            )),
            state if state.is_terminal() && (self.ended_at.is_none() || self.end_reason.is_none()) => {
                Err(format!("call {} ended without an end reason", self.call_id))
            }
            _ => Ok(()),
        }
    }

    pub fn snapshot(&self, audio_enabled: bool, video_enabled: bool) -> SessionSnapshot {
        SessionSnapshot {
            call_id: self.call_id.clone(),
            peer: self.peer.clone(),
            direction: self.direction,
            state: self.state,
            started_at: self.started_at,
            connected_at: self.connected_at,
            ended_at: self.ended_at,
            end_reason: self.end_reason.clone(),
            audio_enabled,
            video_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callwire_signaling_transport::Role;

    fn outgoing() -> CallSession {
        CallSession::outgoing(CallId::from("p_d_1"), Identity::new("d", "D", Role::Responder)).0
    }

    fn incoming() -> CallSession {
        CallSession::incoming(CallId::from("p_d_1"), Identity::new("p", "P", Role::Initiator)).0
    }

    #[test]
    fn outgoing_happy_path() {
        let (mut call, start) =
            CallSession::outgoing(CallId::from("p_d_1"), Identity::new("d", "D", Role::Responder));
        assert_eq!(start.actions, vec![Action::SendInvite, Action::StartRingTimer, Action::AcquireMedia]);

        assert!(call.handle(Trigger::MediaReady).unwrap().next_state.is_none());
        let t = call
            .handle(Trigger::RemoteAck {
                accepted: true,
                reason: None,
            })
            .unwrap();
        assert_eq!(t.next_state, Some(CallState::Connecting));
        assert_eq!(
            t.actions,
            vec![
                Action::BeginNegotiation(NegotiationRole::Offerer),
                Action::StartNegotiationTimer
            ]
        );

        let t = call.handle(Trigger::NegotiationConnected).unwrap();
        assert_eq!(t.next_state, Some(CallState::Active));
        assert!(call.connected_at().is_some());
        assert!(call.check_invariants(Some(NegotiationState::Connected)).is_ok());

        let t = call.handle(Trigger::LocalHangup).unwrap();
        assert_eq!(t.next_state, Some(CallState::Ended));
        assert_eq!(t.actions, vec![Action::SendHangup, Action::Teardown]);
    }

    #[test]
    fn accept_before_media_waits_for_media() {
        let mut call = outgoing();
        let t = call
            .handle(Trigger::RemoteAck {
                accepted: true,
                reason: None,
            })
            .unwrap();
        assert!(t.next_state.is_none());
        assert_eq!(call.state(), CallState::OutgoingRinging);

        let t = call.handle(Trigger::MediaReady).unwrap();
        assert_eq!(t.next_state, Some(CallState::Connecting));
    }

    #[test]
    fn media_failure_never_reaches_connecting() {
        let mut call = outgoing();
        let t = call.handle(Trigger::MediaFailed(MediaError::PermissionDenied)).unwrap();
        assert_eq!(t.next_state, Some(CallState::Failed));
        assert_eq!(t.reason, Some(EndReason::MediaUnavailable(MediaError::PermissionDenied)));
        assert_eq!(t.actions, vec![Action::SendHangup, Action::Teardown]);

        let mut call = incoming();
        call.handle(Trigger::LocalAccept).unwrap();
        let t = call.handle(Trigger::MediaFailed(MediaError::DeviceBusy)).unwrap();
        assert_eq!(t.next_state, Some(CallState::Failed));
        assert_eq!(
            t.actions[0],
            Action::SendAck {
                accepted: false,
                reason: Some(RejectReason::MediaUnavailable)
            }
        );
    }

    #[test]
    fn ring_timeout_after_answer_is_ignored() {
        let mut call = incoming();
        call.handle(Trigger::LocalAccept).unwrap();
        assert!(call.handle(Trigger::RingTimeout).is_none());
        assert_eq!(call.state(), CallState::IncomingRinging);

        let t = call.handle(Trigger::MediaReady).unwrap();
        assert_eq!(t.next_state, Some(CallState::Connecting));

        let mut unanswered = incoming();
        let t = unanswered.handle(Trigger::RingTimeout).unwrap();
        assert_eq!(t.reason, Some(EndReason::NoAnswer));
    }

    #[test]
    fn incoming_accept_sends_ack_once_media_is_ready() {
        let mut call = incoming();
        let t = call.handle(Trigger::LocalAccept).unwrap();
        assert_eq!(t.actions, vec![Action::StopRingTimer, Action::AcquireMedia]);
        assert!(call.handle(Trigger::LocalAccept).is_none());

        let t = call.handle(Trigger::MediaReady).unwrap();
        assert_eq!(t.next_state, Some(CallState::Connecting));
        assert_eq!(
            t.actions,
            vec![
                Action::SendAck {
                    accepted: true,
                    reason: None
                },
                Action::BeginNegotiation(NegotiationRole::Answerer),
                Action::StartNegotiationTimer,
            ]
        );
    }

    #[test]
    fn rejections_carry_distinct_reasons() {
        for (reason, expected) in [
            (Some(RejectReason::Busy), EndReason::Busy),
            (Some(RejectReason::Declined), EndReason::Declined),
            (Some(RejectReason::MediaUnavailable), EndReason::PeerMediaUnavailable),
            (None, EndReason::Declined),
        ] {
            let mut call = outgoing();
            let t = call
                .handle(Trigger::RemoteAck {
                    accepted: false,
                    reason,
                })
                .unwrap();
            assert_eq!(t.next_state, Some(CallState::Rejected));
            assert_eq!(t.reason, Some(expected));
        }
    }

    #[test]
    fn terminal_states_ignore_everything() {
        let mut call = outgoing();
        call.handle(Trigger::RingTimeout).unwrap();
        assert_eq!(call.state(), CallState::Failed);
        assert_eq!(call.end_reason(), Some(&EndReason::NoAnswer));

        assert!(call.handle(Trigger::LocalHangup).is_none());
        assert!(call.handle(Trigger::RemoteHangup).is_none());
        assert!(call
            .handle(Trigger::RemoteAck {
                accepted: true,
                reason: None
            })
            .is_none());
        assert!(call.check_invariants(None).is_ok());
    }

    #[test]
    fn timers_only_fire_in_their_states() {
        let mut call = outgoing();
        call.handle(Trigger::MediaReady).unwrap();
        call.handle(Trigger::RemoteAck {
            accepted: true,
            reason: None,
        })
        .unwrap();
        assert!(call.handle(Trigger::RingTimeout).is_none());

        call.handle(Trigger::NegotiationConnected).unwrap();
        assert!(call.handle(Trigger::NegotiationTimeout).is_none());
        assert_eq!(call.state(), CallState::Active);
    }

    #[test]
    fn link_loss_while_active_fails_the_call() {
        let mut call = incoming();
        call.handle(Trigger::LocalAccept).unwrap();
        call.handle(Trigger::MediaReady).unwrap();
        call.handle(Trigger::NegotiationConnected).unwrap();

        let t = call.handle(Trigger::NegotiationFailed("link lost".into())).unwrap();
        assert_eq!(t.next_state, Some(CallState::Failed));
        assert_eq!(t.reason, Some(EndReason::ConnectionLost));
        assert_eq!(t.actions, vec![Action::SendHangup, Action::Teardown]);
    }

    #[test]
    fn active_without_connected_negotiation_violates_invariant() {
        let mut call = incoming();
        call.handle(Trigger::LocalAccept).unwrap();
        call.handle(Trigger::MediaReady).unwrap();
        call.handle(Trigger::NegotiationConnected).unwrap();
        assert!(call.check_invariants(Some(NegotiationState::Failed)).is_err());
        assert!(call.check_invariants(None).is_err());
    }
}
