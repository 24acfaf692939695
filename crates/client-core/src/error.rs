//! Error types for the call client
//!
//! Errors split by blast radius:
//!
//! - transport errors are retried inside the transport and only reach the
//!   caller once reconnection is exhausted
//! - registration errors are fatal to presence until the identity is fixed
//! - media and negotiation errors end the current call attempt only
//! - stale or unknown call ids (`ProtocolMismatch`) are expected under
//!   normal races; they are logged and never returned to callers

use thiserror::Error;

use callwire_signaling_transport::{CallId, IdentityId};

use crate::media::MediaError;
use crate::negotiation::NegotiationError;

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the call client
#[derive(Debug, Error)]
pub enum ClientError {
    /// Relay link failure
    #[error("Transport error: {0}")]
    Transport(#[from] callwire_signaling_transport::Error),

    /// The relay refused the identity
    #[error("Registration rejected: {reason}")]
    Registration { reason: String },

    /// The relay did not confirm registration in time
    #[error("Registration not confirmed within {seconds} seconds")]
    RegistrationTimeout { seconds: u64 },

    /// Camera or microphone could not be acquired
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),

    /// The peer link rejected an operation
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// No usable connectivity within the negotiation window
    #[error("Negotiation timed out after {seconds} seconds")]
    NegotiationTimeout { seconds: u64 },

    /// Message for a call id that is not the current call
    #[error("Message for unknown or stale call {call_id}")]
    ProtocolMismatch { call_id: CallId },

    /// Operation requires a confirmed registration
    #[error("Not registered with the relay")]
    NotRegistered,

    /// Target is not in the presence set
    #[error("Peer {peer} is unreachable or offline")]
    PeerUnavailable { peer: IdentityId },

    /// A call is already in progress
    #[error("Already in call {call_id}")]
    Busy { call_id: CallId },

    /// Operation names a call that is not the current one
    #[error("Call not found: {call_id}")]
    CallNotFound { call_id: CallId },

    /// Operation requires a current call
    #[error("No active call")]
    NoActiveCall,

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The engine task has stopped
    #[error("Client engine stopped")]
    EngineStopped,
}

impl ClientError {
    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a registration error
    pub fn registration(reason: impl Into<String>) -> Self {
        Self::Registration {
            reason: reason.into(),
        }
    }

    /// Whether the error only affected a single call attempt
    pub fn is_call_scoped(&self) -> bool {
        matches!(
            self,
            Self::MediaAcquisition(_)
                | Self::Negotiation(_)
                | Self::NegotiationTimeout { .. }
                | Self::PeerUnavailable { .. }
                | Self::Busy { .. }
                | Self::CallNotFound { .. }
        )
    }
}
