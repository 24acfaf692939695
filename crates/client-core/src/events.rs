//! Events published by the call client
//!
//! Everything a UI layer renders comes through [`ClientEvent`]: incoming
//! call prompts, session state changes, call outcomes, presence and relay
//! connectivity. Subscribe with [`CallClient::subscribe`]; dropping the
//! returned subscription unsubscribes.
//!
//! ```rust
//! use callwire_client_core::events::{format_duration, EndReason};
//! use std::time::Duration;
//!
//! assert_eq!(EndReason::NoAnswer.to_string(), "no answer");
//! assert_eq!(format_duration(Duration::from_secs(125)), "02:05");
//! ```
//!
//! [`CallClient::subscribe`]: crate::client::CallClient::subscribe

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use callwire_signaling_transport::{CallId, Identity, IdentityId};

use crate::call::{CallDirection, CallState};
use crate::media::{MediaError, RemoteMedia};
use crate::registration::RegistrationStatus;

/// Why a call ended
///
/// Each reason has its own human-readable text; reasons are never collapsed
/// into a generic failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// We hung up
    LocalHangup,
    /// The peer hung up or cancelled
    RemoteHangup,
    /// The peer declined the invite
    Declined,
    /// The peer was in another call
    Busy,
    /// The peer accepted but could not open its camera or microphone
    PeerMediaUnavailable,
    /// The relay could not reach the peer
    PeerUnreachable(String),
    /// Nobody answered before the ring timeout
    NoAnswer,
    /// We could not open our camera or microphone
    MediaUnavailable(MediaError),
    NegotiationFailed(String),
    NegotiationTimeout,
    /// Relay or peer connectivity was lost
    ConnectionLost,
    /// We declined the invite
    RejectedLocally,
}

impl EndReason {
    /// Terminal state a call ending for this reason lands in
    pub fn terminal_state(&self) -> CallState {
        match self {
            EndReason::LocalHangup | EndReason::RemoteHangup => CallState::Ended,
            EndReason::Declined
            | EndReason::Busy
            | EndReason::PeerMediaUnavailable
            | EndReason::RejectedLocally => CallState::Rejected,
            EndReason::PeerUnreachable(_)
            | EndReason::NoAnswer
            | EndReason::MediaUnavailable(_)
            | EndReason::NegotiationFailed(_)
            | EndReason::NegotiationTimeout
            | EndReason::ConnectionLost => CallState::Failed,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::LocalHangup => write!(f, "call ended"),
            EndReason::RemoteHangup => write!(f, "peer hung up"),
            EndReason::Declined => write!(f, "peer declined"),
            EndReason::Busy => write!(f, "peer busy"),
            EndReason::PeerMediaUnavailable => write!(f, "peer media unavailable"),
            EndReason::PeerUnreachable(detail) => write!(f, "peer unreachable/offline ({})", detail),
            EndReason::NoAnswer => write!(f, "no answer"),
            EndReason::MediaUnavailable(MediaError::PermissionDenied) => {
                write!(f, "media permission denied")
            }
            EndReason::MediaUnavailable(e) => write!(f, "media unavailable: {}", e),
            EndReason::NegotiationFailed(detail) => write!(f, "negotiation failed: {}", detail),
            EndReason::NegotiationTimeout => write!(f, "negotiation timed out"),
            EndReason::ConnectionLost => write!(f, "connection lost"),
            EndReason::RejectedLocally => write!(f, "declined"),
        }
    }
}

/// Priority levels for client events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    Low,
    Normal,
    High,
}

/// Information about an incoming call
#[derive(Debug, Clone)]
pub struct IncomingCallInfo {
    pub call_id: CallId,
    /// The caller as it announced itself
    pub caller: Identity,
    /// Display name from the directory, falling back to the caller's own
    pub caller_display_name: String,
    pub caller_avatar_url: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Information about a call state change
#[derive(Debug, Clone)]
pub struct CallStatusInfo {
    /// Call that changed state
    pub call_id: CallId,
    /// New call state after the transition
    pub new_state: CallState,
    /// Previous call state before the transition
    pub previous_state: CallState,
    /// Reason for the change, for terminal states
    pub reason: Option<EndReason>,
    /// When the state change occurred
    pub timestamp: DateTime<Utc>,
}

/// Read-only view of the current call
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub call_id: CallId,
    pub peer: Identity,
    pub direction: CallDirection,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl SessionSnapshot {
    /// Time spent connected; zero if the call never connected
    pub fn duration(&self) -> Duration {
        connected_duration(self.connected_at, self.ended_at)
    }
}

/// Outcome of a finished call
#[derive(Debug, Clone)]
pub struct CallSummary {
    pub call_id: CallId,
    pub peer: Identity,
    pub direction: CallDirection,
    /// `Ended`, `Rejected` or `Failed`
    pub final_state: CallState,
    pub reason: EndReason,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
}

fn connected_duration(connected_at: Option<DateTime<Utc>>, ended_at: Option<DateTime<Utc>>) -> Duration {
    let Some(connected_at) = connected_at else {
        return Duration::ZERO;
    };
    let end = ended_at.unwrap_or_else(Utc::now);
    (end - connected_at).to_std().unwrap_or(Duration::ZERO)
}

pub(crate) fn summary_duration(connected_at: Option<DateTime<Utc>>, ended_at: DateTime<Utc>) -> Duration {
    connected_duration(connected_at, Some(ended_at))
}

/// Format a duration as `mm:ss`, or `h:mm:ss` past an hour
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// Events published by the call client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A peer is calling; answer with `accept` or `reject`
    IncomingCall { info: IncomingCallInfo },

    /// The current call changed state
    CallStateChanged { info: CallStatusInfo },

    /// The current call finished; the client is idle again
    CallEnded { summary: CallSummary },

    /// An invite arrived during another call and was refused as busy
    BusyRejected { call_id: CallId, caller: Identity },

    /// The peer's media is flowing
    RemoteMediaAvailable { call_id: CallId, media: RemoteMedia },

    RegistrationStatusChanged {
        status: RegistrationStatus,
        reason: Option<String>,
    },

    PresenceChanged { identity_id: IdentityId, online: bool },

    /// Relay connectivity changed
    NetworkEvent {
        connected: bool,
        reason: Option<String>,
    },
}

impl ClientEvent {
    pub fn priority(&self) -> EventPriority {
        match self {
            ClientEvent::IncomingCall { .. } | ClientEvent::CallEnded { .. } => EventPriority::High,
            ClientEvent::NetworkEvent { connected: false, .. } => EventPriority::High,
            ClientEvent::RegistrationStatusChanged {
                status: RegistrationStatus::Failed,
                ..
            } => EventPriority::High,
            ClientEvent::PresenceChanged { .. } | ClientEvent::BusyRejected { .. } => EventPriority::Low,
            _ => EventPriority::Normal,
        }
    }

    /// The call this event concerns, if any
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            ClientEvent::IncomingCall { info } => Some(&info.call_id),
            ClientEvent::CallStateChanged { info } => Some(&info.call_id),
            ClientEvent::CallEnded { summary } => Some(&summary.call_id),
            ClientEvent::BusyRejected { call_id, .. }
            | ClientEvent::RemoteMediaAvailable { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_visible_reasons_are_distinct() {
        let reasons = [
            EndReason::Declined,
            EndReason::PeerUnreachable("peer offline".to_string()),
            EndReason::NoAnswer,
            EndReason::MediaUnavailable(MediaError::PermissionDenied),
            EndReason::ConnectionLost,
        ];
        let texts: std::collections::HashSet<String> = reasons.iter().map(|r| r.to_string()).collect();
        assert_eq!(texts.len(), reasons.len());
        assert_eq!(
            EndReason::MediaUnavailable(MediaError::PermissionDenied).to_string(),
            "media permission denied"
        );
    }

    #[test]
    fn reasons_map_to_terminal_states() {
        assert_eq!(EndReason::RemoteHangup.terminal_state(), CallState::Ended);
        assert_eq!(EndReason::Busy.terminal_state(), CallState::Rejected);
        assert_eq!(EndReason::NoAnswer.terminal_state(), CallState::Failed);
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(Duration::ZERO), "00:00");
        assert_eq!(format_duration(Duration::from_secs(59)), "00:59");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }

    #[test]
    fn duration_counts_only_connected_time() {
        let started = Utc::now();
        let connected = started + chrono::Duration::seconds(5);
        let ended = connected + chrono::Duration::seconds(42);
        assert_eq!(summary_duration(Some(connected), ended), Duration::from_secs(42));
        assert_eq!(summary_duration(None, ended), Duration::ZERO);
    }
}
