//! Call lifecycle
//!
//! ```text
//!            place call                 peer accepts               link connected
//!   IDLE ──────────────▶ OUTGOING_RINGING ─────────▶ CONNECTING ─────────────▶ ACTIVE
//!     │                                                  ▲                       │
//!     │  invite           local accept + media ready     │                       │ hang up
//!     └──────────▶ INCOMING_RINGING ─────────────────────┘                       ▼
//!                                                                      ENDED / REJECTED / FAILED
//! ```
//!
//! Terminal states are reported once and the client returns to IDLE. IDLE has
//! no session object: the client simply holds no [`CallSession`].

mod session;

pub use session::{Action, CallSession, MediaPhase, Transition, Trigger};

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    OutgoingRinging,
    IncomingRinging,
    Connecting,
    Active,
    Ended,
    Rejected,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Rejected | CallState::Failed)
    }

    pub fn is_ringing(self) -> bool {
        matches!(self, CallState::OutgoingRinging | CallState::IncomingRinging)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "IDLE",
            CallState::OutgoingRinging => "OUTGOING_RINGING",
            CallState::IncomingRinging => "INCOMING_RINGING",
            CallState::Connecting => "CONNECTING",
            CallState::Active => "ACTIVE",
            CallState::Ended => "ENDED",
            CallState::Rejected => "REJECTED",
            CallState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Who placed the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Outgoing => write!(f, "outgoing"),
            CallDirection::Incoming => write!(f, "incoming"),
        }
    }
}
