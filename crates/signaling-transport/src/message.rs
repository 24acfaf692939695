//! Signaling wire format
//!
//! Every frame on the relay link is one JSON object tagged by `type`:
//!
//! ```text
//! {"type":"invite","call_id":"p_d_3f..","from":{"id":"p","display_name":"Pat","role":"initiator"},"to":"d"}
//! {"type":"invite-ack","call_id":"p_d_3f..","accepted":false,"reason":"busy"}
//! {"type":"ice-candidate","call_id":"p_d_3f..","candidate":{"candidate":"candidate:0 1 udp ..","sdp_mid":"0","sdp_mline_index":0}}
//! ```
//!
//! All variants except `register`, `registered`, `registration-error` and
//! `presence-changed` carry the `call_id` both endpoints use for the call.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::{CallId, Identity, IdentityId};

/// A network path descriptor exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Why an invite was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// The recipient declined
    Declined,
    /// The recipient is already in a call
    Busy,
    /// The recipient accepted but could not open camera or microphone
    MediaUnavailable,
}

/// One message on the relay link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Client -> relay: announce this identity
    Register { identity: Identity },

    /// Relay -> client: registration accepted, with the identities online now
    Registered {
        identity_id: IdentityId,
        #[serde(default)]
        online: Vec<IdentityId>,
    },

    /// Relay -> client: registration refused
    RegistrationError { reason: String },

    /// Call invitation; delivered verbatim to `to`
    Invite {
        call_id: CallId,
        from: Identity,
        to: IdentityId,
    },

    /// Answer to an invitation
    InviteAck {
        call_id: CallId,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<RejectReason>,
    },

    Offer { call_id: CallId, sdp: String },

    Answer { call_id: CallId, sdp: String },

    IceCandidate {
        call_id: CallId,
        candidate: IceCandidate,
    },

    Hangup { call_id: CallId },

    /// Relay -> client: the invite could not be delivered
    CallFailed { call_id: CallId, reason: String },

    /// Relay -> all clients: an identity came online or went away
    PresenceChanged { identity_id: IdentityId, online: bool },
}

impl SignalingMessage {
    /// The call this message belongs to, if it is call-scoped
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::Invite { call_id, .. }
            | Self::InviteAck { call_id, .. }
            | Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::IceCandidate { call_id, .. }
            | Self::Hangup { call_id }
            | Self::CallFailed { call_id, .. } => Some(call_id),
            Self::Register { .. }
            | Self::Registered { .. }
            | Self::RegistrationError { .. }
            | Self::PresenceChanged { .. } => None,
        }
    }

    /// Wire name of the variant, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Registered { .. } => "registered",
            Self::RegistrationError { .. } => "registration-error",
            Self::Invite { .. } => "invite",
            Self::InviteAck { .. } => "invite-ack",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Hangup { .. } => "hangup",
            Self::CallFailed { .. } => "call-failed",
            Self::PresenceChanged { .. } => "presence-changed",
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::Encode)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::Decode)
    }
}
